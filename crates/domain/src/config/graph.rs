use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Graph
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Planner/executor looping limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Maximum number of tool-executing steps the executor node will run
    /// for a single plan before forcing a `respond` step.
    #[serde(default = "d_max_tool_loop")]
    pub max_tool_loop: usize,
    /// Maximum number of times the planner may be re-invoked mid-turn
    /// (e.g. after a tool error) before falling back to a direct response.
    #[serde(default = "d_replan_cap")]
    pub replan_cap: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_tool_loop: d_max_tool_loop(),
            replan_cap: d_replan_cap(),
        }
    }
}

fn d_max_tool_loop() -> usize {
    8
}
fn d_replan_cap() -> usize {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = GraphConfig::default();
        assert_eq!(cfg.replan_cap, 3);
        assert_eq!(cfg.max_tool_loop, 8);
    }
}
