//! `ra-store` — the durable append-only record store: messages,
//! conversations, logs, generations, thoughts. The bus is the fast,
//! ephemeral path; this crate is the slow, forever path.
//!
//! Failures here must never abort a user-visible turn: every call site
//! in `ra-memory`/`ra-engine`/`ra-graph` wraps a store call and
//! logs-and-continues on error, mirroring the teacher's
//! `crates/gateway/src/runtime/mod.rs::persist_transcript` swallow-and-log
//! behavior.

mod jsonl;

pub use jsonl::JsonlStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ra_domain::error::Result;
use ra_domain::model::{Conversation, Generation, LogEntry, Message, Thought};

/// Fields an `updateGenerationStatus` call may patch.
#[derive(Debug, Clone, Default)]
pub struct GenerationStatusPatch {
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub tokens_used: Option<ra_domain::stream::Usage>,
    pub model: Option<String>,
}

/// The durable collections and indexes the runtime needs.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn store_message(&self, message: Message) -> Result<()>;
    async fn store_messages(&self, messages: Vec<Message>) -> Result<()>;
    /// The `N` most recent messages for `conversation_id`, chronological.
    async fn get_last_messages(&self, conversation_id: &str, n: usize) -> Result<Vec<Message>>;

    async fn store_logs(&self, logs: Vec<LogEntry>) -> Result<()>;

    async fn store_generation(&self, generation: Generation) -> Result<()>;
    async fn update_generation_status(
        &self,
        generation_id: &str,
        status: ra_domain::model::GenerationStatus,
        patch: GenerationStatusPatch,
    ) -> Result<()>;

    async fn update_conversation_title(&self, conversation_id: &str, title: &str) -> Result<()>;
    /// Conversations ordered by `lastUpdatedAt desc`.
    async fn get_conversations(&self, limit: usize, skip: usize) -> Result<Vec<Conversation>>;
    async fn upsert_conversation(&self, conversation: Conversation) -> Result<()>;

    async fn store_thought(&self, thought: Thought) -> Result<()>;
    /// Thoughts for `conversation_id`, most recent first.
    async fn get_thoughts(&self, conversation_id: &str, limit: usize) -> Result<Vec<Thought>>;
}
