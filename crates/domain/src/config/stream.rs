use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// SSE publishing/reconnect tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamConfig {
    /// How long a new SSE subscriber waits for the ready handshake before
    /// giving up and falling back to a plain snapshot.
    #[serde(default = "d_ready_handshake_timeout_secs")]
    pub ready_handshake_timeout_secs: u64,
    /// A subscriber that hasn't polled in this long is dropped.
    #[serde(default = "d_subscriber_idle_timeout_secs")]
    pub subscriber_idle_timeout_secs: u64,
    /// How long a completed [`crate::model::MessageGenerationState`] stays
    /// available for reconnect-replay before it is evicted.
    #[serde(default = "d_state_ttl_secs")]
    pub state_ttl_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ready_handshake_timeout_secs: d_ready_handshake_timeout_secs(),
            subscriber_idle_timeout_secs: d_subscriber_idle_timeout_secs(),
            state_ttl_secs: d_state_ttl_secs(),
        }
    }
}

fn d_ready_handshake_timeout_secs() -> u64 {
    5
}
fn d_subscriber_idle_timeout_secs() -> u64 {
    30
}
fn d_state_ttl_secs() -> u64 {
    60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.ready_handshake_timeout_secs, 5);
        assert_eq!(cfg.subscriber_idle_timeout_secs, 30);
        assert_eq!(cfg.state_ttl_secs, 3600);
    }
}
