use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connection settings for the pub/sub + KV bus backing cross-node
/// coordination, tool RPC, and SSE fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Connection URL. `"memory://"` selects the in-process implementation;
    /// anything else is a future external-backend hook.
    #[serde(default = "d_bus_url")]
    pub url: String,
    /// Key prefix namespace, so multiple deployments can share one backend.
    #[serde(default = "d_namespace")]
    pub namespace: String,
    /// Per-channel broadcast capacity before the slowest subscriber starts
    /// missing messages.
    #[serde(default = "d_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: d_bus_url(),
            namespace: d_namespace(),
            channel_capacity: d_channel_capacity(),
        }
    }
}

fn d_bus_url() -> String {
    "memory://".into()
}
fn d_namespace() -> String {
    "ra".into()
}
fn d_channel_capacity() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = BusConfig::default();
        assert_eq!(cfg.url, "memory://");
        assert_eq!(cfg.namespace, "ra");
        assert_eq!(cfg.channel_capacity, 256);
    }

    #[test]
    fn deserializes_with_missing_fields() {
        let cfg: BusConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.namespace, "ra");
    }
}
