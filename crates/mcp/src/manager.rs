//! Manages connections to every configured MCP server and exposes a
//! unified tool-discovery and dispatch surface.

use std::collections::HashMap;
use std::sync::Arc;

use ra_bus::Bus;
use serde_json::Value;

use crate::client::BusMcpClient;
use crate::config::McpConfig;
use crate::protocol::{McpToolDef, ToolCallResult};

/// Holds one [`BusMcpClient`] per successfully-connected server.
///
/// Servers that fail to connect are logged and skipped rather than
/// aborting startup — the runtime boots with whichever tool families
/// are actually reachable.
pub struct McpManager {
    clients: HashMap<String, BusMcpClient>,
}

impl McpManager {
    /// A manager with no connected servers.
    pub fn empty() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    /// Connect to every server in `config`, running the handshake for
    /// each. `client_id` should be unique per connecting process.
    pub async fn from_config(bus: Arc<dyn Bus>, config: &McpConfig, client_id: &str) -> Self {
        let mut clients = HashMap::new();

        for server in &config.servers {
            match BusMcpClient::connect(bus.clone(), &server.id, client_id).await {
                Ok(client) => {
                    tracing::info!(
                        server_id = %server.id,
                        tool_count = client.tools().len(),
                        "connected to MCP server"
                    );
                    clients.insert(server.id.clone(), client);
                }
                Err(error) => {
                    tracing::warn!(
                        server_id = %server.id,
                        %error,
                        "failed to connect to MCP server, skipping"
                    );
                }
            }
        }

        Self { clients }
    }

    /// Connect to a single server and add it to the manager, running the
    /// handshake. Replaces any existing connection for the same id.
    pub async fn connect_server(
        &mut self,
        bus: Arc<dyn Bus>,
        server_id: &str,
        client_id: &str,
    ) -> Result<(), McpError> {
        let client = BusMcpClient::connect(bus, server_id, client_id).await?;
        tracing::info!(
            server_id,
            tool_count = client.tools().len(),
            "connected to MCP server"
        );
        self.clients.insert(server_id.to_string(), client);
        Ok(())
    }

    /// List every tool advertised by every connected server, paired with
    /// the server id that owns it.
    pub fn list_tools(&self) -> Vec<(&str, &McpToolDef)> {
        self.clients
            .iter()
            .flat_map(|(server_id, client)| {
                client
                    .tools()
                    .iter()
                    .map(move |tool| (server_id.as_str(), tool))
            })
            .collect()
    }

    /// Call a tool on a specific server.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
        meta: Option<Value>,
    ) -> Result<ToolCallResult, McpError> {
        let client = self
            .clients
            .get(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;
        if !client.is_alive() {
            return Err(McpError::ServerDown(server_id.to_string()));
        }
        client.call_tool(tool_name, arguments, meta).await
    }

    /// Number of connected servers.
    pub fn server_count(&self) -> usize {
        self.clients.len()
    }

    /// Total number of tools across all connected servers.
    pub fn tool_count(&self) -> usize {
        self.clients.values().map(|c| c.tools().len()).sum()
    }

    /// Whether no servers are connected.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Shut down every connected client, rejecting any in-flight calls.
    pub fn shutdown(&self) {
        for client in self.clients.values() {
            client.shutdown();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("bus error: {0}")]
    Bus(ra_domain::error::Error),
    #[error("json error: {0}")]
    Json(serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("MCP server not found: {0}")]
    ServerNotFound(String),
    #[error("MCP server is down: {0}")]
    ServerDown(String),
}

impl From<McpError> for ra_domain::error::Error {
    fn from(e: McpError) -> Self {
        ra_domain::error::Error::ToolRpc(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::McpServerConfig;
    use crate::protocol::ToolCallContent;
    use crate::server::BusMcpServer;
    use ra_bus::InMemoryBus;
    use std::time::Duration;

    fn ping_tool() -> McpToolDef {
        McpToolDef {
            name: "ping".to_string(),
            description: "Replies pong".to_string(),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    fn spawn_echo_server(bus: Arc<dyn Bus>, server_id: &str) {
        let request_channel = format!("mcp:server:{server_id}:request");
        tokio::spawn(async move {
            BusMcpServer::serve(bus, &request_channel, vec![ping_tool()], |name, _args| async move {
                ToolCallResult {
                    content: vec![ToolCallContent {
                        content_type: "text".to_string(),
                        text: format!("called {name}"),
                    }],
                    is_error: false,
                }
            })
            .await
            .unwrap();
        });
    }

    #[tokio::test]
    async fn from_config_connects_to_every_server() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        spawn_echo_server(bus.clone(), "alpha");
        spawn_echo_server(bus.clone(), "beta");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let config = McpConfig {
            servers: vec![
                McpServerConfig { id: "alpha".to_string() },
                McpServerConfig { id: "beta".to_string() },
            ],
        };
        let manager = McpManager::from_config(bus, &config, "client-1").await;
        assert_eq!(manager.server_count(), 2);
        assert_eq!(manager.tool_count(), 2);
        assert_eq!(manager.list_tools().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn from_config_skips_unreachable_servers() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        spawn_echo_server(bus.clone(), "alpha");

        let config = McpConfig {
            servers: vec![
                McpServerConfig { id: "alpha".to_string() },
                McpServerConfig { id: "nobody-home".to_string() },
            ],
        };
        let connecting =
            tokio::spawn(async move { McpManager::from_config(bus, &config, "client-1").await });
        tokio::time::advance(Duration::from_secs(31)).await;
        let manager = connecting.await.unwrap();
        assert_eq!(manager.server_count(), 1);
        assert!(manager.call_tool("nobody-home", "ping", serde_json::json!({}), None).await.is_err());
    }

    #[tokio::test]
    async fn call_tool_dispatches_to_the_right_server() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        spawn_echo_server(bus.clone(), "alpha");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let config = McpConfig {
            servers: vec![McpServerConfig { id: "alpha".to_string() }],
        };
        let manager = McpManager::from_config(bus, &config, "client-1").await;
        let result = manager
            .call_tool("alpha", "ping", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(result.content[0].text, "called ping");
    }

    #[tokio::test]
    async fn call_tool_on_unknown_server_errors() {
        let manager = McpManager::empty();
        let result = manager.call_tool("missing", "ping", serde_json::json!({}), None).await;
        assert!(matches!(result, Err(McpError::ServerNotFound(_))));
    }

    #[test]
    fn empty_manager_has_no_servers() {
        let manager = McpManager::empty();
        assert!(manager.is_empty());
        assert_eq!(manager.server_count(), 0);
        assert_eq!(manager.tool_count(), 0);
    }
}
