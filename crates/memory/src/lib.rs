//! `ra-memory` — the conversation-memory tier: a hot cache of recent
//! messages in the bus, a durable-store fallback, token-budgeted
//! context assembly, and the trailing/executive summary bookkeeping
//! that backs it. Grounded on `crates/sessions/src/store.rs::SessionStore`'s
//! RwLock-guarded-map-over-a-durable-file shape and
//! `crates/serialmemory-client/src/provider.rs`'s trait-over-one-client
//! design.

mod token;

pub use token::{HeuristicTokenCounter, TokenCounter};

use std::sync::Arc;

use ra_bus::Bus;
use ra_domain::config::MemoryConfig;
use ra_domain::error::Result;
use ra_domain::model::{Conversation, Message};
use ra_store::DurableStore;

/// Per-message token overhead added on top of content length, matching
/// the fixed cost a chat-formatted message carries regardless of body
/// (role/name/delimiter tokens).
const PER_MESSAGE_OVERHEAD_TOKENS: u32 = 4;

fn hot_cache_key(conversation_id: &str) -> String {
    format!("conversations:{conversation_id}:messages")
}

fn trailing_summary_key(conversation_id: &str) -> String {
    format!("conversations:{conversation_id}:summary:trailing")
}

fn executive_summary_key(conversation_id: &str) -> String {
    format!("conversations:{conversation_id}:summary:executive")
}

/// Staged work for the trim-and-summarize protocol: the trimmed
/// messages (plus any prior trailing summary) to hand an LLM, and the
/// conversation whose `needsTrailingSummaryGeneration` flag now needs
/// clearing once that call completes. `ra-background` owns turning
/// this into a summary; `ra-memory` only stages it.
#[derive(Debug, Clone)]
pub struct TrimStaged {
    pub conversation_id: String,
    pub content_to_summarize: String,
}

/// Write-through cache + durable fallback + token-budgeted context
/// assembly for conversation history.
pub struct MemoryManager {
    bus: Arc<dyn Bus>,
    store: Arc<dyn DurableStore>,
    config: MemoryConfig,
    token_counter: Arc<dyn TokenCounter>,
}

impl MemoryManager {
    pub fn new(bus: Arc<dyn Bus>, store: Arc<dyn DurableStore>, config: MemoryConfig) -> Self {
        Self {
            bus,
            store,
            config,
            token_counter: Arc::new(HeuristicTokenCounter),
        }
    }

    /// Override the default heuristic tokenizer, e.g. with one backed
    /// by the provider's actual tokenizer.
    pub fn with_token_counter(mut self, token_counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = token_counter;
        self
    }

    /// Deterministic id (16-hex SHA-256 prefix) when `seed` is given —
    /// stable across restarts for the same opening message — otherwise
    /// 16 random hex chars.
    pub fn generate_conversation_id(&self, seed: Option<&str>) -> String {
        match seed {
            Some(seed) => Conversation::id_from_seed(seed),
            None => Conversation::random_id(),
        }
    }

    /// Write `message` through to both tiers, trim the hot cache to
    /// `hot_cache_cap`, and run the trim-and-summarize protocol if the
    /// conversation now exceeds the token budget plus cushion. A
    /// durable-store failure is logged and swallowed — the cache stays
    /// consistent regardless.
    pub async fn add_message(&self, message: Message) -> Result<Option<TrimStaged>> {
        let conversation_id = message.conversation_id.clone();
        let serialized = serde_json::to_string(&message)?;
        self.bus.rpush(&hot_cache_key(&conversation_id), &serialized).await?;
        self.bus
            .ltrim(
                &hot_cache_key(&conversation_id),
                -(self.config.hot_cache_cap as i64),
                -1,
            )
            .await?;

        if let Err(error) = self.store.store_message(message).await {
            tracing::warn!(%conversation_id, %error, "durable store write failed; hot cache remains authoritative");
        }

        self.maybe_trim_and_stage(&conversation_id).await
    }

    /// The cache if non-empty; otherwise hydrate it from the durable
    /// store's last `hot_cache_cap` messages and return those.
    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let cached = self.read_cache(conversation_id).await?;
        if !cached.is_empty() {
            return Ok(cached);
        }

        let hydrated = self
            .store
            .get_last_messages(conversation_id, self.config.hot_cache_cap)
            .await?;
        for message in &hydrated {
            let serialized = serde_json::to_string(message)?;
            self.bus.rpush(&hot_cache_key(conversation_id), &serialized).await?;
        }
        Ok(hydrated)
    }

    /// Bypasses the cache entirely; used by admin/export paths that
    /// need the full history rather than the windowed cache.
    pub async fn get_all_messages_from_db(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.store.get_last_messages(conversation_id, usize::MAX).await
    }

    /// The longest suffix of `get_messages` whose total token count
    /// (content + per-message overhead) fits within `max_context_tokens`.
    pub async fn get_context_for_conversation(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let messages = self.get_messages(conversation_id).await?;
        Ok(self.pack_within_budget(&messages, self.config.max_context_tokens))
    }

    pub async fn get_trailing_summary(&self, conversation_id: &str) -> Result<Option<String>> {
        self.bus.get(&trailing_summary_key(conversation_id)).await
    }

    pub async fn set_trailing_summary(&self, conversation_id: &str, summary: &str) -> Result<()> {
        self.bus.set(&trailing_summary_key(conversation_id), summary, None).await
    }

    pub async fn get_executive_summary(&self, conversation_id: &str) -> Result<Option<String>> {
        self.bus.get(&executive_summary_key(conversation_id)).await
    }

    pub async fn set_executive_summary(&self, conversation_id: &str, summary: &str) -> Result<()> {
        self.bus.set(&executive_summary_key(conversation_id), summary, None).await
    }

    async fn read_cache(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let raw = self.bus.lrange(&hot_cache_key(conversation_id), 0, -1).await?;
        let mut messages = Vec::with_capacity(raw.len());
        for line in raw {
            match serde_json::from_str::<Message>(&line) {
                Ok(message) => messages.push(message),
                Err(error) => tracing::warn!(%conversation_id, %error, "skipping unparsable cached message"),
            }
        }
        Ok(messages)
    }

    fn message_tokens(&self, message: &Message) -> u32 {
        self.token_counter.count(&message.content) + PER_MESSAGE_OVERHEAD_TOKENS
    }

    /// Scan backwards accumulating tokens, keeping the longest suffix
    /// whose total stays within `budget`.
    fn pack_within_budget(&self, messages: &[Message], budget: u32) -> Vec<Message> {
        let mut total = 0u32;
        let mut split = messages.len();
        for (idx, message) in messages.iter().enumerate().rev() {
            let cost = self.message_tokens(message);
            if total + cost > budget {
                break;
            }
            total += cost;
            split = idx;
        }
        messages[split..].to_vec()
    }

    /// If the conversation's token total exceeds `max_context_tokens +
    /// summary_cushion_tokens`, trim the cache to the packed suffix and
    /// stage the trimmed-off prefix (plus any existing trailing
    /// summary) for `ra-background` to summarize.
    async fn maybe_trim_and_stage(&self, conversation_id: &str) -> Result<Option<TrimStaged>> {
        let messages = self.read_cache(conversation_id).await?;
        let total: u32 = messages.iter().map(|m| self.message_tokens(m)).sum();
        let threshold = self.config.max_context_tokens + self.config.summary_cushion_tokens;
        if total <= threshold {
            return Ok(None);
        }

        let kept = self.pack_within_budget(&messages, self.config.max_context_tokens);
        let split = messages.len() - kept.len();
        let trimmed = &messages[..split];
        if trimmed.is_empty() {
            return Ok(None);
        }

        let mut rendered = String::new();
        if let Some(previous) = self.get_trailing_summary(conversation_id).await? {
            rendered.push_str(&previous);
            rendered.push('\n');
        }
        for message in trimmed {
            rendered.push_str(&format!("{:?}: {}\n", message.role, message.content));
        }

        self.bus.del(&hot_cache_key(conversation_id)).await?;
        for message in &kept {
            let serialized = serde_json::to_string(message)?;
            self.bus.rpush(&hot_cache_key(conversation_id), &serialized).await?;
        }

        Ok(Some(TrimStaged {
            conversation_id: conversation_id.to_string(),
            content_to_summarize: rendered,
        }))
    }
}
