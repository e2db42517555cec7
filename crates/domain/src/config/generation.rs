use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Generation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tuning for the single-in-flight-generation-per-conversation guard
///.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// A `generating` pointer older than this is considered abandoned
    /// (e.g. the node that owned it crashed) and may be reclaimed by a
    /// new request for the same conversation.
    #[serde(default = "d_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    /// How long a completed/errored generation record is retained before
    /// it is eligible for pruning.
    #[serde(default = "d_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: d_stale_threshold_secs(),
            ttl_secs: d_ttl_secs(),
        }
    }
}

fn d_stale_threshold_secs() -> u64 {
    5 * 60
}
fn d_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = GenerationConfig::default();
        assert_eq!(cfg.stale_threshold_secs, 300);
        assert_eq!(cfg.ttl_secs, 30 * 24 * 60 * 60);
    }
}
