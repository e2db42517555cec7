//! `ra-bus` — the pub/sub + keyed KV surface every other `ra-*` crate talks
//! to: channel fan-out for SSE/tool events, a TTL'd KV for
//! generation/stream-state pointers, and list/set primitives for hot
//! caches and log indexes.
//!
//! One implementation ships here, [`memory::InMemoryBus`] — an in-process
//! stand-in for a Redis-style backend, sufficient for a single orchestrator
//! node and for tests. Swapping in a networked backend means implementing
//! [`Bus`] again; nothing upstream depends on the in-memory shape.

mod memory;
pub mod request;

pub use memory::InMemoryBus;
pub use request::{BusRequestClient, BusRequestServer};

use async_trait::async_trait;
use ra_domain::error::Result;
use ra_domain::stream::BoxStream;

/// One message delivered to a channel subscriber.
pub type ChannelMessage = String;

/// Pub/sub + keyed KV + list/set primitives.
///
/// All operations are best-effort: a `Bus` failure must never be fatal to
/// the turn that triggered it — callers log and continue.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl` if given.
    async fn set(&self, key: &str, value: &str, ttl: Option<std::time::Duration>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn del(&self, key: &str) -> Result<()>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;

    /// Append to the tail of the list at `key`.
    async fn rpush(&self, key: &str, value: &str) -> Result<()>;
    /// Return the slice `[start, stop]` (inclusive, 0-indexed; negative
    /// indices count from the end, Redis-style).
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn llen(&self, key: &str) -> Result<usize>;
    /// Trim the list so only `[start, stop]` survives.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Publish `message` on `channel`. At-most-once delivery: subscribers
    /// not connected at publish time miss it.
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
    /// Subscribe to `channel`; messages arrive to each subscriber in
    /// publish order, with no cross-channel ordering guarantee.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, ChannelMessage>>;

    /// An independent connection/handle, mirroring a Redis client
    /// `duplicate()` — for the in-memory backend this just clones the
    /// shared `Arc` state.
    fn duplicate(&self) -> std::sync::Arc<dyn Bus>;
}
