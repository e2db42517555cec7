//! `ra-logger` — the conversation-scoped [`ra_domain::model::LogEntry`]
//! pipeline: a distinct concern from operator-facing `tracing` output.
//! `BusLogger` is the base write path (persist + list-append + publish);
//! `PersistentLogger` wraps it with an in-memory batch flushed
//! periodically to the durable store, grounded on
//! `crates/gateway/src/runtime/schedule_runner.rs`'s
//! periodic-task-with-drain-on-shutdown shape.
//! `subscribe_to_generation` replays existing logs then streams new
//! ones, mirroring `crates/gateway/src/runtime/runs.rs::RunStore::subscribe`'s
//! broadcast-channel-per-id plus replay-then-forward loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ra_bus::Bus;
use ra_domain::error::Result;
use ra_domain::model::LogEntry;
use ra_domain::stream::BoxStream;
use ra_store::DurableStore;

fn entry_key(id: &str) -> String {
    format!("log:{id}")
}

fn generation_index_key(generation_id: &str) -> String {
    format!("generation:{generation_id}:logs")
}

fn conversation_index_key(conversation_id: &str) -> String {
    format!("conversation:{conversation_id}:logs")
}

fn generation_channel(generation_id: &str) -> String {
    format!("logs:generation:{generation_id}")
}

fn conversation_channel(conversation_id: &str) -> String {
    format!("logs:conversation:{conversation_id}")
}

/// Aggregate fan-out channel every entry is published to, regardless of
/// whether it also carries a generation/conversation id.
const ALL_LOGS_CHANNEL: &str = "logs:all";

/// Writes a [`LogEntry`] through to whichever sinks this logger owns.
#[async_trait]
pub trait Logger: Send + Sync {
    async fn log(&self, entry: LogEntry) -> Result<()>;
}

/// The base write path: persist the entry, index it by generation and
/// conversation, and publish it on the matching fan-out channels.
pub struct BusLogger {
    bus: Arc<dyn Bus>,
    ttl_secs: u64,
}

impl BusLogger {
    pub fn new(bus: Arc<dyn Bus>, ttl_secs: u64) -> Self {
        Self { bus, ttl_secs }
    }

    /// Existing logs for a generation, oldest first, by replaying the
    /// index list and reading each entry back out of the KV.
    pub async fn replay_for_generation(&self, generation_id: &str) -> Result<Vec<LogEntry>> {
        let ids = self.bus.lrange(&generation_index_key(generation_id), 0, -1).await?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(raw) = self.bus.get(&entry_key(&id)).await? {
                if let Ok(entry) = serde_json::from_str(&raw) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl Logger for BusLogger {
    async fn log(&self, entry: LogEntry) -> Result<()> {
        let ttl = Duration::from_secs(self.ttl_secs);
        let serialized = serde_json::to_string(&entry)?;
        self.bus.set(&entry_key(&entry.id), &serialized, Some(ttl)).await?;

        if let Some(generation_id) = &entry.generation_id {
            self.bus.rpush(&generation_index_key(generation_id), &entry.id).await?;
            self.bus.publish(&generation_channel(generation_id), &serialized).await?;
        }
        if let Some(conversation_id) = &entry.conversation_id {
            self.bus.rpush(&conversation_index_key(conversation_id), &entry.id).await?;
            self.bus.publish(&conversation_channel(conversation_id), &serialized).await?;
        }
        self.bus.publish(ALL_LOGS_CHANNEL, &serialized).await?;
        Ok(())
    }
}

/// Wraps a [`BusLogger`] with an in-memory batch, additionally writing
/// each entry to the durable store once the batch flushes — every
/// `flush_interval` or once `flush_batch_size` entries have
/// accumulated, whichever comes first.
pub struct PersistentLogger {
    inner: BusLogger,
    store: Arc<dyn DurableStore>,
    batch: Arc<Mutex<Vec<LogEntry>>>,
    flush_batch_size: usize,
    _flusher: tokio::task::JoinHandle<()>,
}

impl PersistentLogger {
    pub fn new(
        bus: Arc<dyn Bus>,
        store: Arc<dyn DurableStore>,
        ttl_secs: u64,
        flush_interval: Duration,
        flush_batch_size: usize,
    ) -> Self {
        let batch: Arc<Mutex<Vec<LogEntry>>> = Arc::new(Mutex::new(Vec::new()));
        let flusher_batch = batch.clone();
        let flusher_store = store.clone();
        let flusher = tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            loop {
                interval.tick().await;
                let drained: Vec<LogEntry> = std::mem::take(&mut *flusher_batch.lock());
                if drained.is_empty() {
                    continue;
                }
                if let Err(error) = flusher_store.store_logs(drained).await {
                    tracing::warn!(%error, "periodic log batch flush to durable store failed");
                }
            }
        });

        Self {
            inner: BusLogger::new(bus, ttl_secs),
            store,
            batch,
            flush_batch_size,
            _flusher: flusher,
        }
    }

    pub async fn replay_for_generation(&self, generation_id: &str) -> Result<Vec<LogEntry>> {
        self.inner.replay_for_generation(generation_id).await
    }

    /// Flush whatever remains in the batch. Call this on shutdown so
    /// entries accumulated since the last tick aren't lost.
    pub async fn shutdown(&self) -> Result<()> {
        let drained: Vec<LogEntry> = std::mem::take(&mut *self.batch.lock());
        if drained.is_empty() {
            return Ok(());
        }
        self.store.store_logs(drained).await
    }
}

#[async_trait]
impl Logger for PersistentLogger {
    async fn log(&self, entry: LogEntry) -> Result<()> {
        self.inner.log(entry.clone()).await?;

        let should_flush = {
            let mut batch = self.batch.lock();
            batch.push(entry);
            batch.len() >= self.flush_batch_size
        };
        if should_flush {
            let drained: Vec<LogEntry> = std::mem::take(&mut *self.batch.lock());
            if let Err(error) = self.store.store_logs(drained).await {
                tracing::warn!(%error, "batch-size-triggered log flush to durable store failed");
            }
        }
        Ok(())
    }
}

/// Replay logs already recorded for `generation_id`, then stream new
/// ones as they arrive. The stream ends when no new entry arrives
/// within `idle_timeout`, or a replayed/streamed entry's message marks
/// the generation as no longer in flight (callers pass `is_terminal`
/// to recognize that without this crate depending on `ra-generation`).
pub async fn subscribe_to_generation(
    bus: Arc<dyn Bus>,
    logger: &BusLogger,
    generation_id: String,
    idle_timeout: Duration,
    is_terminal: impl Fn(&LogEntry) -> bool + Send + 'static,
) -> BoxStream<'static, LogEntry> {
    let replay = logger.replay_for_generation(&generation_id).await.unwrap_or_default();

    let stream = async_stream::stream! {
        for entry in &replay {
            yield entry.clone();
        }
        if replay.iter().any(&is_terminal) {
            return;
        }

        let Ok(mut subscription) = bus.subscribe(&generation_channel(&generation_id)).await else {
            return;
        };
        loop {
            match tokio::time::timeout(idle_timeout, futures_util::StreamExt::next(&mut subscription)).await {
                Ok(Some(raw)) => {
                    let Ok(entry) = serde_json::from_str::<LogEntry>(&raw) else { continue };
                    let terminal = is_terminal(&entry);
                    yield entry;
                    if terminal {
                        return;
                    }
                }
                Ok(None) => return,
                Err(_) => return,
            }
        }
    };
    Box::pin(stream)
}
