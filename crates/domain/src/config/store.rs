use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Durable store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Backing path for the append-only JSONL durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "d_data_dir")]
    pub data_dir: String,
    /// Number of most-recent records to keep in a rewritten segment file
    /// when pruning; older records are dropped from disk (not just the
    /// in-memory index).
    #[serde(default = "d_prune_keep")]
    pub prune_keep: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
            prune_keep: d_prune_keep(),
        }
    }
}

fn d_data_dir() -> String {
    "./data".into()
}
fn d_prune_keep() -> usize {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.data_dir, "./data");
        assert_eq!(cfg.prune_keep, 10_000);
    }
}
