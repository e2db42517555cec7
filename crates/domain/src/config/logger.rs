use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Logger
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tuning for the conversation-scoped [`crate::model::LogEntry`] pipeline
///, distinct from operator `tracing` output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// How long a `LogEntry` is retained in the durable store.
    #[serde(default = "d_log_ttl_secs")]
    pub log_ttl_secs: u64,
    /// Flush a batch to the durable store after this many seconds even if
    /// `flush_batch_size` hasn't been reached.
    #[serde(default = "d_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Flush a batch once this many entries have accumulated.
    #[serde(default = "d_flush_batch_size")]
    pub flush_batch_size: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_ttl_secs: d_log_ttl_secs(),
            flush_interval_secs: d_flush_interval_secs(),
            flush_batch_size: d_flush_batch_size(),
        }
    }
}

fn d_log_ttl_secs() -> u64 {
    // ~6 months
    182 * 24 * 60 * 60
}
fn d_flush_interval_secs() -> u64 {
    5
}
fn d_flush_batch_size() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = LoggerConfig::default();
        assert_eq!(cfg.flush_interval_secs, 5);
        assert_eq!(cfg.flush_batch_size, 100);
    }
}
