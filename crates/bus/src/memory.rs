//! `InMemoryBus` — a `parking_lot::RwLock<HashMap<...>>` KV with lazy TTL
//! eviction plus a `RwLock<HashMap<String, broadcast::Sender<Bytes>>>`
//! channel table, grounded on the teacher's `RunStore::event_channels`/
//! `subscribe`/`emit`/`cleanup_channel` pattern (`crates/gateway/src/
//! runtime/runs.rs`) and the `parking_lot::RwLock` caches in
//! `crates/gateway/src/state.rs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use ra_domain::error::Result;
use ra_domain::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::{Bus, ChannelMessage};

struct Entry {
    value: String,
    deadline: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Channel broadcast capacity; a slow subscriber beyond this lags and
/// drops the oldest messages rather than blocking publishers.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Inner {
    kv: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
    sets: HashMap<String, std::collections::HashSet<String>>,
    channels: HashMap<String, broadcast::Sender<ChannelMessage>>,
}

impl Inner {
    fn channel(&mut self, name: &str, capacity: usize) -> broadcast::Sender<ChannelMessage> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .clone()
    }
}

/// In-process pub/sub + KV bus. Sufficient for a single orchestrator
/// node and for tests; swap in a networked backend by implementing
/// [`Bus`] again.
pub struct InMemoryBus {
    inner: Arc<RwLock<Inner>>,
    channel_capacity: usize,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            channel_capacity,
        }
    }

    fn normalize_range(len: usize, start: i64, stop: i64) -> (usize, usize) {
        let len_i = len as i64;
        let norm = |idx: i64| -> i64 {
            if idx < 0 {
                (len_i + idx).max(0)
            } else {
                idx
            }
        };
        let start = norm(start).min(len_i);
        let stop = norm(stop).min(len_i - 1);
        if stop < start || len == 0 {
            (0, 0)
        } else {
            (start as usize, stop as usize + 1)
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.write();
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                deadline: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.kv.get(key) {
            if entry.is_expired() {
                inner.kv.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.inner.write().kv.remove(key);
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.inner
            .write()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .read()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        if let Some(h) = self.inner.write().hashes.get_mut(key) {
            h.remove(field);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .inner
            .read()
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .write()
            .lists
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let (lo, hi) = Self::normalize_range(list.len(), start, stop);
        Ok(list[lo..hi].to_vec())
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        Ok(self.inner.read().lists.get(key).map(Vec::len).unwrap_or(0))
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(list) = inner.lists.get_mut(key) {
            let (lo, hi) = Self::normalize_range(list.len(), start, stop);
            *list = list[lo..hi].to_vec();
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.inner
            .write()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(s) = self.inner.write().sets.get_mut(key) {
            s.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let sender = {
            let mut inner = self.inner.write();
            inner.channel(channel, self.channel_capacity)
        };
        // No receivers is not an error — at-most-once delivery: a publish
        // with nobody listening is simply dropped.
        let _ = sender.send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, ChannelMessage>> {
        let receiver = {
            let mut inner = self.inner.write();
            inner.channel(channel, self.channel_capacity).subscribe()
        };
        let stream = BroadcastStream::new(receiver).filter_map(|item| item.ok());
        Ok(Box::pin(stream))
    }

    fn duplicate(&self) -> Arc<dyn Bus> {
        Arc::new(InMemoryBus {
            inner: self.inner.clone(),
            channel_capacity: self.channel_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt as _;

    #[tokio::test]
    async fn kv_roundtrip() {
        let bus = InMemoryBus::new();
        bus.set("k", "v", None).await.unwrap();
        assert_eq!(bus.get("k").await.unwrap(), Some("v".into()));
        bus.del("k").await.unwrap();
        assert_eq!(bus.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn kv_ttl_expires() {
        let bus = InMemoryBus::new();
        bus.set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(bus.get("k").await.unwrap(), Some("v".into()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(bus.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_rpush_lrange_ltrim() {
        let bus = InMemoryBus::new();
        for i in 0..5 {
            bus.rpush("l", &i.to_string()).await.unwrap();
        }
        assert_eq!(bus.llen("l").await.unwrap(), 5);
        assert_eq!(
            bus.lrange("l", 0, -1).await.unwrap(),
            vec!["0", "1", "2", "3", "4"]
        );
        bus.ltrim("l", -2, -1).await.unwrap();
        assert_eq!(bus.lrange("l", 0, -1).await.unwrap(), vec!["3", "4"]);
    }

    #[tokio::test]
    async fn set_sadd_srem_smembers() {
        let bus = InMemoryBus::new();
        bus.sadd("s", "a").await.unwrap();
        bus.sadd("s", "b").await.unwrap();
        let mut members = bus.smembers("s").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);
        bus.srem("s", "a").await.unwrap();
        assert_eq!(bus.smembers("s").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn hash_ops() {
        let bus = InMemoryBus::new();
        bus.hset("h", "f1", "v1").await.unwrap();
        bus.hset("h", "f2", "v2").await.unwrap();
        assert_eq!(bus.hget("h", "f1").await.unwrap(), Some("v1".into()));
        bus.hdel("h", "f1").await.unwrap();
        assert_eq!(bus.hget("h", "f1").await.unwrap(), None);
        assert_eq!(bus.hgetall("h").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_subscribe_ordering() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("chan").await.unwrap();
        bus.publish("chan", "one").await.unwrap();
        bus.publish("chan", "two").await.unwrap();
        assert_eq!(sub.next().await, Some("one".to_string()));
        assert_eq!(sub.next().await, Some("two".to_string()));
    }

    #[tokio::test]
    async fn publish_with_no_subscriber_is_not_an_error() {
        let bus = InMemoryBus::new();
        bus.publish("nobody-listening", "msg").await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_shares_state() {
        let bus = InMemoryBus::new();
        let dup = bus.duplicate();
        bus.set("k", "v", None).await.unwrap();
        assert_eq!(dup.get("k").await.unwrap(), Some("v".into()));
    }

    #[tokio::test]
    async fn lrange_negative_indices() {
        let bus = InMemoryBus::new();
        for i in 0..10 {
            bus.rpush("l", &i.to_string()).await.unwrap();
        }
        assert_eq!(bus.lrange("l", -3, -1).await.unwrap(), vec!["7", "8", "9"]);
    }
}
