//! `JsonlStore` — a filesystem-backed [`crate::DurableStore`]: one
//! append-only `*.jsonl` file per collection under `data_dir`, with
//! in-memory indexes rebuilt at load time, grounded on
//! `crates/sessions/src/transcript.rs::TranscriptWriter` (append-only
//! JSONL) and `crates/gateway/src/runtime/runs.rs::RunStore` (bounded
//! in-memory index, `load_recent`/`rewrite_jsonl` pruning).

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use ra_domain::error::{Error, Result};
use ra_domain::model::{
    Conversation, Generation, GenerationStatus, LogEntry, Message, Thought,
};

use crate::{DurableStore, GenerationStatusPatch};

const MESSAGES_FILE: &str = "messages.jsonl";
const CONVERSATIONS_FILE: &str = "conversations.jsonl";
const LOGS_FILE: &str = "logs.jsonl";
const GENERATIONS_FILE: &str = "generations.jsonl";
const THOUGHTS_FILE: &str = "thoughts.jsonl";

/// How many trailing messages per conversation are kept in memory;
/// older entries are still on disk and can be paged in by rereading
/// the file, which `get_last_messages` never needs to do.
const MAX_MESSAGES_PER_CONVERSATION: usize = 500;
const MAX_THOUGHTS_PER_CONVERSATION: usize = 200;

#[derive(Default)]
struct Inner {
    messages: HashMap<String, Vec<Message>>,
    conversations: HashMap<String, Conversation>,
    generations: HashMap<String, Generation>,
    thoughts: HashMap<String, Vec<Thought>>,
}

/// An append-only JSONL record store. Every mutating call appends one
/// or more lines to the collection's file on disk, then updates the
/// in-memory index under the same lock — the file is the source of
/// truth on restart, the index is what `get_*` reads from.
pub struct JsonlStore {
    data_dir: PathBuf,
    inner: RwLock<Inner>,
}

impl JsonlStore {
    /// Load (or create) the collections under `data_dir`, replaying
    /// each JSONL file into its in-memory index.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir).map_err(Error::Io)?;

        let mut inner = Inner::default();

        for message in read_lines::<Message>(&data_dir.join(MESSAGES_FILE))? {
            let bucket = inner.messages.entry(message.conversation_id.clone()).or_default();
            bucket.push(message);
            if bucket.len() > MAX_MESSAGES_PER_CONVERSATION {
                bucket.remove(0);
            }
        }

        for conversation in read_lines::<Conversation>(&data_dir.join(CONVERSATIONS_FILE))? {
            inner
                .conversations
                .insert(conversation.conversation_id.clone(), conversation);
        }

        for generation in read_lines::<Generation>(&data_dir.join(GENERATIONS_FILE))? {
            inner.generations.insert(generation.generation_id.clone(), generation);
        }

        for thought in read_lines::<Thought>(&data_dir.join(THOUGHTS_FILE))? {
            let bucket = inner.thoughts.entry(thought.conversation_id.clone()).or_default();
            bucket.push(thought);
            if bucket.len() > MAX_THOUGHTS_PER_CONVERSATION {
                bucket.remove(0);
            }
        }

        Ok(Self {
            data_dir,
            inner: RwLock::new(inner),
        })
    }

    fn append<T: serde::Serialize>(&self, file_name: &str, records: &[T]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for record in records {
            let line = serde_json::to_string(record).map_err(Error::Json)?;
            buf.push_str(&line);
            buf.push('\n');
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_dir.join(file_name))
            .map_err(Error::Io)?;
        file.write_all(buf.as_bytes()).map_err(Error::Io)?;
        Ok(())
    }
}

fn read_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
    let mut out = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => out.push(record),
            Err(err) => {
                tracing::warn!(error = %err, file = %path.display(), "skipping unparsable jsonl line");
            }
        }
    }
    Ok(out)
}

#[async_trait]
impl DurableStore for JsonlStore {
    async fn store_message(&self, message: Message) -> Result<()> {
        self.store_messages(vec![message]).await
    }

    async fn store_messages(&self, messages: Vec<Message>) -> Result<()> {
        self.append(MESSAGES_FILE, &messages)?;
        let mut inner = self.inner.write();
        for message in messages {
            let bucket = inner.messages.entry(message.conversation_id.clone()).or_default();
            bucket.push(message);
            if bucket.len() > MAX_MESSAGES_PER_CONVERSATION {
                bucket.remove(0);
            }
        }
        Ok(())
    }

    async fn get_last_messages(&self, conversation_id: &str, n: usize) -> Result<Vec<Message>> {
        let inner = self.inner.read();
        let Some(bucket) = inner.messages.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let start = bucket.len().saturating_sub(n);
        Ok(bucket[start..].to_vec())
    }

    async fn store_logs(&self, logs: Vec<LogEntry>) -> Result<()> {
        self.append(LOGS_FILE, &logs)
    }

    async fn store_generation(&self, generation: Generation) -> Result<()> {
        self.append(GENERATIONS_FILE, std::slice::from_ref(&generation))?;
        self.inner
            .write()
            .generations
            .insert(generation.generation_id.clone(), generation);
        Ok(())
    }

    async fn update_generation_status(
        &self,
        generation_id: &str,
        status: GenerationStatus,
        patch: GenerationStatusPatch,
    ) -> Result<()> {
        let updated = {
            let mut inner = self.inner.write();
            let Some(generation) = inner.generations.get_mut(generation_id) else {
                return Err(Error::Store(format!("unknown generation: {generation_id}")));
            };
            generation.status = status;
            if let Some(end_time) = patch.end_time {
                generation.completed_at = Some(end_time);
            }
            if let Some(error) = patch.error {
                generation.error = Some(error);
            }
            if let Some(tokens) = patch.tokens_used {
                generation.tokens = Some(tokens);
            }
            if let Some(model) = patch.model {
                generation.model = Some(model);
            }
            let _ = patch.duration_ms;
            generation.clone()
        };
        // Re-append the full record rather than mutating in place — the
        // append-only file's last line for this id wins on replay.
        self.append(GENERATIONS_FILE, std::slice::from_ref(&updated))
    }

    async fn update_conversation_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        let updated = {
            let mut inner = self.inner.write();
            let conversation = inner
                .conversations
                .entry(conversation_id.to_string())
                .or_insert_with(|| Conversation::new(conversation_id.to_string()));
            conversation.title = Some(title.to_string());
            conversation.title_set_by_user = true;
            conversation.clone()
        };
        self.append(CONVERSATIONS_FILE, std::slice::from_ref(&updated))
    }

    async fn get_conversations(&self, limit: usize, skip: usize) -> Result<Vec<Conversation>> {
        let inner = self.inner.read();
        let mut all: Vec<Conversation> = inner.conversations.values().cloned().collect();
        all.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
        Ok(all.into_iter().skip(skip).take(limit).collect())
    }

    async fn upsert_conversation(&self, conversation: Conversation) -> Result<()> {
        self.append(CONVERSATIONS_FILE, std::slice::from_ref(&conversation))?;
        self.inner
            .write()
            .conversations
            .insert(conversation.conversation_id.clone(), conversation);
        Ok(())
    }

    async fn store_thought(&self, thought: Thought) -> Result<()> {
        self.append(THOUGHTS_FILE, std::slice::from_ref(&thought))?;
        let mut inner = self.inner.write();
        let bucket = inner.thoughts.entry(thought.conversation_id.clone()).or_default();
        bucket.push(thought);
        if bucket.len() > MAX_THOUGHTS_PER_CONVERSATION {
            bucket.remove(0);
        }
        Ok(())
    }

    async fn get_thoughts(&self, conversation_id: &str, limit: usize) -> Result<Vec<Thought>> {
        let inner = self.inner.read();
        let Some(bucket) = inner.thoughts.get(conversation_id) else {
            return Ok(Vec::new());
        };
        Ok(bucket.iter().rev().take(limit).cloned().collect())
    }
}
