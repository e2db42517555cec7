//! `ra-generation` — the lifecycle of a single assistant turn:
//! `start`/`complete`/`fail`, with the concurrency guard and
//! stale-reclaim logic that keep at most one `generating` record per
//! conversation. Grounded on `crates/gateway/src/runtime/runs.rs::RunStore`'s
//! update/insert/persist/emit quartet and `Run::finish`, re-expressed as
//! a compare-and-set on a Bus pointer key instead of an in-process
//! `RwLock<VecDeque<Run>>`.

use std::sync::Arc;

use ra_bus::Bus;
use ra_domain::config::GenerationConfig;
use ra_domain::error::Result;
use ra_domain::model::{Generation, GenerationStatus, LogCategory, LogEntry, LogLevel};
use ra_domain::stream::Usage;
use ra_store::{DurableStore, GenerationStatusPatch};

fn pointer_key(conversation_id: &str) -> String {
    format!("conversation:{conversation_id}:generation")
}

fn record_key(generation_id: &str) -> String {
    format!("generation:{generation_id}")
}

/// Fields a caller may supply when completing a generation.
#[derive(Debug, Clone, Default)]
pub struct CompleteGenerationParams {
    pub response: String,
    pub thinking: Option<String>,
    pub route: Option<String>,
    pub tools_used: Vec<String>,
    pub model: Option<String>,
    pub tokens: Option<Usage>,
}

/// Response is truncated to this many characters before it's embedded
/// in the completion chat log entry.
const RESPONSE_LOG_TRUNCATE_CHARS: usize = 10_000;

/// Owns the `Generation` collection: the Bus pointer key that
/// implements the single-in-flight-per-conversation guard, and the
/// durable record each pointer refers to.
pub struct GenerationRegistry {
    bus: Arc<dyn Bus>,
    store: Arc<dyn DurableStore>,
    config: GenerationConfig,
}

impl GenerationRegistry {
    pub fn new(bus: Arc<dyn Bus>, store: Arc<dyn DurableStore>, config: GenerationConfig) -> Self {
        Self { bus, store, config }
    }

    /// Starts a new generation for `conversation_id`, or returns `Ok(None)`
    /// if one is already in flight and not yet stale. A stale `generating`
    /// pointer (older than `stale_threshold_secs`) is force-failed first,
    /// then a fresh generation is started.
    pub async fn start_generation(
        &self,
        conversation_id: &str,
        generation_id: Option<String>,
    ) -> Result<Option<String>> {
        if let Some(pointer) = self.bus.get(&pointer_key(conversation_id)).await? {
            if let Some(existing) = self.read_record(&pointer).await? {
                if existing.is_generating() {
                    let stale = existing.age()
                        > chrono::Duration::seconds(self.config.stale_threshold_secs as i64);
                    if !stale {
                        return Ok(None);
                    }
                    self.fail_generation(&existing.generation_id, "timed out (stale)")
                        .await?;
                }
            } else {
                // Pointer references a record that no longer exists; clear it.
                self.bus.del(&pointer_key(conversation_id)).await?;
            }
        }

        let generation_id = generation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let generation = Generation::new(generation_id.clone(), conversation_id.to_string());
        self.persist(&generation).await?;

        let ttl = std::time::Duration::from_secs(self.config.ttl_secs);
        self.bus
            .set(&pointer_key(conversation_id), &generation_id, Some(ttl))
            .await?;

        self.publish_log(
            LogLevel::Info,
            LogCategory::Generation,
            "Generation started",
            Some(&generation_id),
            Some(conversation_id),
        )
        .await?;

        Ok(Some(generation_id))
    }

    pub async fn complete_generation(
        &self,
        generation_id: &str,
        params: CompleteGenerationParams,
    ) -> Result<()> {
        let Some(mut generation) = self.read_record(generation_id).await? else {
            return Ok(());
        };
        let conversation_id = generation.conversation_id.clone();
        let started_at = generation.started_at;

        generation.status = GenerationStatus::Completed;
        generation.completed_at = Some(chrono::Utc::now());
        generation.route = params.route;
        generation.tools_used = params.tools_used;
        generation.model = params.model.clone();
        generation.tokens = params.tokens.clone();
        generation.response = Some(params.response.clone());
        generation.thinking = params.thinking;
        self.persist(&generation).await?;

        self.clear_pointer_if_current(&conversation_id, generation_id).await?;

        let elapsed_ms = (chrono::Utc::now() - started_at).num_milliseconds().max(0);
        self.publish_log(
            LogLevel::Info,
            LogCategory::Generation,
            format!("Generation completed ({elapsed_ms}ms)"),
            Some(generation_id),
            Some(&conversation_id),
        )
        .await?;

        let truncated: String = params
            .response
            .chars()
            .take(RESPONSE_LOG_TRUNCATE_CHARS)
            .collect();
        self.publish_log(
            LogLevel::Info,
            LogCategory::Chat,
            truncated,
            Some(generation_id),
            Some(&conversation_id),
        )
        .await?;

        Ok(())
    }

    pub async fn fail_generation(&self, generation_id: &str, error: &str) -> Result<()> {
        let Some(mut generation) = self.read_record(generation_id).await? else {
            return Ok(());
        };
        let conversation_id = generation.conversation_id.clone();

        generation.status = GenerationStatus::Error;
        generation.completed_at = Some(chrono::Utc::now());
        generation.error = Some(error.to_string());
        self.persist(&generation).await?;

        self.clear_pointer_if_current(&conversation_id, generation_id).await?;

        self.publish_log(
            LogLevel::Error,
            LogCategory::Generation,
            format!("Generation failed: {error}"),
            Some(generation_id),
            Some(&conversation_id),
        )
        .await?;

        Ok(())
    }

    async fn clear_pointer_if_current(&self, conversation_id: &str, generation_id: &str) -> Result<()> {
        if self.bus.get(&pointer_key(conversation_id)).await? == Some(generation_id.to_string()) {
            self.bus.del(&pointer_key(conversation_id)).await?;
        }
        Ok(())
    }

    async fn read_record(&self, generation_id: &str) -> Result<Option<Generation>> {
        let Some(raw) = self.bus.get(&record_key(generation_id)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&raw).ok())
    }

    async fn persist(&self, generation: &Generation) -> Result<()> {
        let ttl = std::time::Duration::from_secs(self.config.ttl_secs);
        let serialized = serde_json::to_string(generation)?;
        self.bus.set(&record_key(&generation.generation_id), &serialized, Some(ttl)).await?;

        if let Err(error) = self.store.store_generation(generation.clone()).await {
            tracing::warn!(generation_id = %generation.generation_id, %error, "durable generation write failed");
        }
        if !matches!(generation.status, GenerationStatus::Generating) {
            let patch = GenerationStatusPatch {
                end_time: generation.completed_at,
                duration_ms: generation
                    .completed_at
                    .map(|end| (end - generation.started_at).num_milliseconds()),
                error: generation.error.clone(),
                tokens_used: generation.tokens.clone(),
                model: generation.model.clone(),
            };
            if let Err(error) = self
                .store
                .update_generation_status(&generation.generation_id, generation.status, patch)
                .await
            {
                tracing::warn!(generation_id = %generation.generation_id, %error, "durable generation status update failed");
            }
        }
        Ok(())
    }

    async fn publish_log(
        &self,
        level: LogLevel,
        category: LogCategory,
        message: impl Into<String>,
        generation_id: Option<&str>,
        conversation_id: Option<&str>,
    ) -> Result<()> {
        let mut entry = LogEntry::new(level, category, message);
        entry.generation_id = generation_id.map(str::to_string);
        entry.conversation_id = conversation_id.map(str::to_string);
        let serialized = serde_json::to_string(&entry)?;
        self.bus.publish("log:generation", &serialized).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ra_bus::InMemoryBus;
    use ra_store::JsonlStore;

    fn registry(config: GenerationConfig) -> (GenerationRegistry, tempfile::TempDir) {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DurableStore> = Arc::new(JsonlStore::new(dir.path()).unwrap());
        (GenerationRegistry::new(bus, store, config), dir)
    }

    #[tokio::test]
    async fn start_then_complete_clears_the_pointer() {
        let (registry, _dir) = registry(GenerationConfig::default());
        let generation_id = registry
            .start_generation("conv-1", None)
            .await
            .unwrap()
            .expect("expected a fresh generation");

        registry
            .complete_generation(
                &generation_id,
                CompleteGenerationParams {
                    response: "done".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(registry.bus.get(&pointer_key("conv-1")).await.unwrap(), None);
        // A new generation can now start for the same conversation.
        assert!(registry.start_generation("conv-1", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn second_concurrent_start_is_rejected() {
        let (registry, _dir) = registry(GenerationConfig::default());
        let first = registry.start_generation("conv-1", None).await.unwrap();
        assert!(first.is_some());

        let second = registry.start_generation("conv-1", None).await.unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn stale_generation_is_reclaimed() {
        let (registry, _dir) = registry(GenerationConfig {
            stale_threshold_secs: 0,
            ..GenerationConfig::default()
        });
        let first = registry.start_generation("conv-1", None).await.unwrap().unwrap();

        // stale_threshold_secs of 0 means any in-flight generation is
        // immediately eligible for reclaim.
        let second = registry.start_generation("conv-1", None).await.unwrap();
        assert!(second.is_some());
        assert_ne!(second.unwrap(), first);

        let failed = registry.read_record(&first).await.unwrap().unwrap();
        assert_eq!(failed.status, GenerationStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("timed out (stale)"));
    }

    #[tokio::test]
    async fn fail_generation_clears_pointer_and_records_error() {
        let (registry, _dir) = registry(GenerationConfig::default());
        let generation_id = registry.start_generation("conv-1", None).await.unwrap().unwrap();
        registry.fail_generation(&generation_id, "provider unreachable").await.unwrap();

        assert_eq!(registry.bus.get(&pointer_key("conv-1")).await.unwrap(), None);
        let record = registry.read_record(&generation_id).await.unwrap().unwrap();
        assert_eq!(record.status, GenerationStatus::Error);
        assert_eq!(record.error.as_deref(), Some("provider unreachable"));
    }

    #[tokio::test]
    async fn complete_generation_truncates_response_in_chat_log() {
        let (registry, _dir) = registry(GenerationConfig::default());
        let generation_id = registry.start_generation("conv-1", None).await.unwrap().unwrap();
        let long_response = "x".repeat(RESPONSE_LOG_TRUNCATE_CHARS + 500);

        let mut logs = registry.bus.subscribe("log:generation").await.unwrap();
        registry
            .complete_generation(
                &generation_id,
                CompleteGenerationParams {
                    response: long_response,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // First log is the lifecycle "Generation completed" entry, second
        // is the truncated chat-log entry.
        use futures_util::StreamExt as _;
        let _lifecycle = logs.next().await.unwrap();
        let chat_raw = logs.next().await.unwrap();
        let chat_entry: LogEntry = serde_json::from_str(&chat_raw).unwrap();
        assert_eq!(chat_entry.message.len(), RESPONSE_LOG_TRUNCATE_CHARS);
    }
}
