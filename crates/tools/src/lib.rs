//! `ra-tools` — the tool registry: discovers MCP tool servers, maintains
//! an in-memory name→server index, and wraps every tool call with
//! `tool_start`/`tool_progress`/(`tool_complete`|`tool_error`) event
//! publication on the bus.
//!
//! Built on [`ra_mcp::McpManager`] for connection management
//! (`server_count`/`tool_count`/`is_empty`/`list_tools`/`call_tool`
//! carry the same shape here); this crate adds the event-wrapping layer
//! around every call.

use std::sync::Arc;

use chrono::Utc;
use ra_bus::Bus;
use ra_domain::model::ToolEvent;
use ra_mcp::{McpConfig, McpError, McpManager, McpToolDef};
use serde_json::Value;

/// Tool families whose calls never publish `tool:event:*` notifications
/// — internal bookkeeping the UI doesn't need to see as "tool activity".
fn is_infrastructure_tool(server_id: &str, tool_name: &str) -> bool {
    server_id == "context" || matches!(tool_name, "add_document" | "delete_documents")
}

/// Correlates a tool call with the turn that triggered it. `message_id`
/// selects the `tool:event:<message_id>` channel; the rest is folded
/// into the emitted events' `metadata` field.
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    pub conversation_id: String,
    pub generation_id: String,
    pub message_id: String,
}

impl ToolCallContext {
    fn metadata(&self) -> Value {
        serde_json::json!({
            "conversationId": self.conversation_id,
            "generationId": self.generation_id,
            "messageId": self.message_id,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("no tool registered with name '{0}'")]
    NotFound(String),
    #[error(transparent)]
    Mcp(#[from] McpError),
}

/// Discovers tool servers over MCP and dispatches calls by tool name,
/// publishing lifecycle events for every non-infrastructure call.
pub struct ToolRegistry {
    bus: Arc<dyn Bus>,
    manager: McpManager,
}

impl ToolRegistry {
    /// An empty registry with no connected servers.
    pub fn empty(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            manager: McpManager::empty(),
        }
    }

    /// Connect to every server in `config` and build the registry.
    pub async fn from_config(bus: Arc<dyn Bus>, config: &McpConfig, client_id: &str) -> Self {
        let manager = McpManager::from_config(bus.clone(), config, client_id).await;
        Self { bus, manager }
    }

    /// Connect one additional server and add it to the index.
    pub async fn register_server(&mut self, server_id: &str, client_id: &str) -> Result<(), ToolError> {
        self.manager
            .connect_server(self.bus.clone(), server_id, client_id)
            .await?;
        Ok(())
    }

    /// Linear scan across every connected server for a tool by name.
    pub fn find_tool(&self, name: &str) -> Option<(&str, &McpToolDef)> {
        self.manager
            .list_tools()
            .into_iter()
            .find(|(_, tool)| tool.name == name)
    }

    /// All tools across all connected servers.
    pub fn list_tools(&self) -> Vec<(&str, &McpToolDef)> {
        self.manager.list_tools()
    }

    pub fn server_count(&self) -> usize {
        self.manager.server_count()
    }

    pub fn tool_count(&self) -> usize {
        self.manager.tool_count()
    }

    pub fn is_empty(&self) -> bool {
        self.manager.is_empty()
    }

    /// Call a tool by name, wrapping the call with `tool_start`/
    /// `tool_complete`/`tool_error` events on `tool:event:<message_id>`
    /// (skipped entirely for infrastructure tools — see
    /// [`is_infrastructure_tool`]).
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        ctx: &ToolCallContext,
    ) -> Result<ra_mcp::protocol::ToolCallResult, ToolError> {
        let server_id = self
            .find_tool(name)
            .map(|(server_id, _)| server_id.to_string())
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let emit_events = !is_infrastructure_tool(&server_id, name);
        let tool_id = format!("{name}_{}", Utc::now().timestamp_millis());
        let started_at = Utc::now();

        if emit_events {
            self.publish(
                &ctx.message_id,
                &ToolEvent::ToolStart {
                    tool_id: tool_id.clone(),
                    tool_type: name.to_string(),
                    tool_name: name.to_string(),
                    timestamp: started_at,
                    metadata: ctx.metadata(),
                },
            )
            .await;
        }

        let result = self.manager.call_tool(&server_id, name, arguments, Some(ctx.metadata())).await;
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds();

        match result {
            Ok(call_result) => {
                if emit_events {
                    let mut metadata = ctx.metadata();
                    merge_duration(&mut metadata, duration_ms);
                    self.publish(
                        &ctx.message_id,
                        &ToolEvent::ToolComplete {
                            tool_id,
                            result: serde_json::to_value(&call_result).unwrap_or(Value::Null),
                            timestamp: finished_at,
                            metadata,
                        },
                    )
                    .await;
                }
                Ok(call_result)
            }
            Err(error) => {
                if emit_events {
                    let mut metadata = ctx.metadata();
                    merge_duration(&mut metadata, duration_ms);
                    self.publish(
                        &ctx.message_id,
                        &ToolEvent::ToolError {
                            tool_id,
                            error: error.to_string(),
                            timestamp: finished_at,
                            metadata,
                        },
                    )
                    .await;
                }
                Err(ToolError::Mcp(error))
            }
        }
    }

    /// Publish an intermediate progress update for an in-flight call.
    /// Skipped for infrastructure tools by the same rule as start/complete.
    pub async fn report_progress(
        &self,
        message_id: &str,
        tool_id: &str,
        step: impl Into<String>,
        progress: Option<f32>,
    ) {
        self.publish(
            message_id,
            &ToolEvent::ToolProgress {
                tool_id: tool_id.to_string(),
                step: step.into(),
                progress,
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    /// Disconnect every server. Safe to call more than once.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    async fn publish(&self, message_id: &str, event: &ToolEvent) {
        let channel = format!("tool:event:{message_id}");
        match serde_json::to_string(event) {
            Ok(payload) => {
                if let Err(error) = self.bus.publish(&channel, &payload).await {
                    tracing::warn!(%channel, %error, "failed to publish tool event");
                }
            }
            Err(error) => {
                tracing::warn!(%error, "failed to serialize tool event");
            }
        }
    }
}

fn merge_duration(metadata: &mut Value, duration_ms: i64) {
    if let Value::Object(map) = metadata {
        map.insert("durationMs".to_string(), Value::from(duration_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use ra_bus::InMemoryBus;
    use ra_mcp::protocol::{McpToolDef, ToolCallContent, ToolCallResult};
    use ra_mcp::server::BusMcpServer;
    use std::time::Duration;

    fn ctx(message_id: &str) -> ToolCallContext {
        ToolCallContext {
            conversation_id: "conv-1".to_string(),
            generation_id: "gen-1".to_string(),
            message_id: message_id.to_string(),
        }
    }

    fn search_tool() -> McpToolDef {
        McpToolDef {
            name: "web_search".to_string(),
            description: "Searches the web".to_string(),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    fn store_message_tool() -> McpToolDef {
        McpToolDef {
            name: "store_message".to_string(),
            description: "Stores a message".to_string(),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    async fn registry_with(bus: Arc<dyn Bus>, server_id: &str, tools: Vec<McpToolDef>) -> ToolRegistry {
        let request_channel = format!("mcp:server:{server_id}:request");
        let server_bus = bus.clone();
        tokio::spawn(async move {
            BusMcpServer::serve(server_bus, &request_channel, tools, |_name, _args| async move {
                ToolCallResult {
                    content: vec![ToolCallContent {
                        content_type: "text".to_string(),
                        text: "ok".to_string(),
                    }],
                    is_error: false,
                }
            })
            .await
            .unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let config = ra_mcp::McpConfig {
            servers: vec![ra_mcp::McpServerConfig { id: server_id.to_string() }],
        };
        ToolRegistry::from_config(bus, &config, "client-1").await
    }

    #[tokio::test]
    async fn call_tool_emits_start_and_complete_events() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let registry = registry_with(bus.clone(), "web", vec![search_tool()]).await;

        let mut events = bus.subscribe("tool:event:msg-1").await.unwrap();
        let result = registry
            .call_tool("web_search", serde_json::json!({"query": "rust"}), &ctx("msg-1"))
            .await
            .unwrap();
        assert!(!result.is_error);

        let first: ToolEvent = serde_json::from_str(&events.next().await.unwrap()).unwrap();
        assert!(matches!(first, ToolEvent::ToolStart { .. }));
        let second: ToolEvent = serde_json::from_str(&events.next().await.unwrap()).unwrap();
        assert!(matches!(second, ToolEvent::ToolComplete { .. }));
    }

    #[tokio::test]
    async fn infrastructure_tools_skip_event_publication() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let registry = registry_with(bus.clone(), "context", vec![store_message_tool()]).await;

        let mut events = bus.subscribe("tool:event:msg-2").await.unwrap();
        registry
            .call_tool("store_message", serde_json::json!({}), &ctx("msg-2"))
            .await
            .unwrap();

        // Publish a marker so we can assert the channel stayed silent
        // without hanging on an empty stream.
        bus.publish("tool:event:msg-2", "marker").await.unwrap();
        let first = events.next().await.unwrap();
        assert_eq!(first, "marker");
    }

    #[tokio::test]
    async fn call_tool_on_unknown_name_errors() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let registry = ToolRegistry::empty(bus);
        let result = registry
            .call_tool("nonexistent", serde_json::json!({}), &ctx("msg-3"))
            .await;
        assert!(matches!(result, Err(ToolError::NotFound(_))));
    }

    #[tokio::test]
    async fn find_tool_scans_all_servers() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let registry = registry_with(bus, "web", vec![search_tool()]).await;
        let found = registry.find_tool("web_search");
        assert!(found.is_some());
        assert_eq!(found.unwrap().0, "web");
        assert!(registry.find_tool("missing").is_none());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let registry = registry_with(bus, "web", vec![search_tool()]).await;
        registry.shutdown();
        registry.shutdown();
    }
}
