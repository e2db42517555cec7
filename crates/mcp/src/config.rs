//! Identifies the bus-transport MCP servers this runtime talks to.
//!
//! Transport moved onto the bus, so there's no command/args/env to
//! configure per server anymore — a server is just a logical id that
//! derives its request/response channel names.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            servers: ["web", "system", "rag", "context"]
                .into_iter()
                .map(|id| McpServerConfig { id: id.to_string() })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
}

impl McpServerConfig {
    pub fn request_channel(&self) -> String {
        format!("mcp:server:{}:request", self.id)
    }

    /// Each connecting client gets its own response channel so replies
    /// are never delivered to the wrong caller.
    pub fn response_channel(&self, client_id: &str) -> String {
        format!("mcp:server:{}:response:{client_id}", self.id)
    }
}
