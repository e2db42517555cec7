use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token-budgeted context assembly and hot-cache tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Hard ceiling on assembled prompt context, including the cushion.
    #[serde(default = "d_max_context_tokens")]
    pub max_context_tokens: u32,
    /// Reserved headroom subtracted from `max_context_tokens` before
    /// packing messages, so the completion always has room to land.
    #[serde(default = "d_summary_cushion_tokens")]
    pub summary_cushion_tokens: u32,
    /// Maximum number of conversations kept resident in the hot cache.
    #[serde(default = "d_hot_cache_cap")]
    pub hot_cache_cap: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: d_max_context_tokens(),
            summary_cushion_tokens: d_summary_cushion_tokens(),
            hot_cache_cap: d_hot_cache_cap(),
        }
    }
}

fn d_max_context_tokens() -> u32 {
    30_000
}
fn d_summary_cushion_tokens() -> u32 {
    2_000
}
fn d_hot_cache_cap() -> usize {
    100
}
