//! `BusMcpClient` — one connection to a bus-transport MCP server.
//!
//! Built on [`ra_bus::BusRequestClient`]: the same request-id-keyed
//! pending map and per-call timeout as a stdio transport would use, just
//! publishing a request envelope instead of writing a line to a child
//! process's stdin. Runs the three-step handshake (`initialize` →
//! `notifications/initialized` → `tools/list`) on connect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ra_bus::{Bus, BusRequestClient};
use serde_json::Value;

use crate::protocol::{self, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpToolDef, ToolCallResult, ToolsListResult};
use crate::McpError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A connected MCP server: the tools it advertised at handshake time,
/// and the request channel to call them on.
pub struct BusMcpClient {
    bus: Arc<dyn Bus>,
    server_id: String,
    request_channel: String,
    client: BusRequestClient,
    next_id: AtomicU64,
    alive: AtomicBool,
    tools: Vec<McpToolDef>,
}

impl BusMcpClient {
    /// Connect to `server_id` and run the handshake. `client_id` should
    /// be unique per connecting process (a UUID is fine) so replies land
    /// on a response channel nobody else is listening on.
    pub async fn connect(bus: Arc<dyn Bus>, server_id: &str, client_id: &str) -> Result<Self, McpError> {
        let request_channel = format!("mcp:server:{server_id}:request");
        let response_channel = format!("mcp:server:{server_id}:response:{client_id}");
        let client = BusRequestClient::connect(bus.clone(), &response_channel)
            .await
            .map_err(McpError::Bus)?;

        let mut connection = Self {
            bus,
            server_id: server_id.to_string(),
            request_channel,
            client,
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            tools: Vec::new(),
        };

        let init_params = serde_json::to_value(protocol::initialize_params())
            .map_err(|e| McpError::Protocol(format!("failed to serialize initialize params: {e}")))?;
        let response = connection.send_request("initialize", Some(init_params)).await?;
        if response.is_error() {
            let error = response.error.unwrap();
            return Err(McpError::Protocol(format!("initialize failed: {error}")));
        }
        tracing::debug!(server_id, "MCP initialize response received");

        connection.send_notification("notifications/initialized").await?;
        tracing::debug!(server_id, "sent notifications/initialized");

        let tools_response = connection.send_request("tools/list", None).await?;
        connection.tools = if tools_response.is_error() {
            tracing::warn!(server_id, "tools/list returned error, server will have no tools");
            Vec::new()
        } else {
            let result = tools_response.result.unwrap_or(Value::Null);
            match serde_json::from_value::<ToolsListResult>(result) {
                Ok(parsed) => parsed.tools,
                Err(error) => {
                    tracing::warn!(server_id, %error, "failed to parse tools/list result");
                    Vec::new()
                }
            }
        };

        tracing::info!(server_id, tool_count = connection.tools.len(), "MCP server connected");
        Ok(connection)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn tools(&self) -> &[McpToolDef] {
        &self.tools
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        meta: Option<Value>,
    ) -> Result<ToolCallResult, McpError> {
        if !self.is_alive() {
            return Err(McpError::ServerDown(self.server_id.clone()));
        }
        let mut params = serde_json::json!({ "name": tool_name, "arguments": arguments });
        if let Some(meta) = meta {
            if let Value::Object(ref mut map) = params {
                map.insert("_meta".to_string(), meta);
            }
        }
        let response = self.send_request("tools/call", Some(params)).await?;
        if response.is_error() {
            let error = response.error.unwrap();
            return Err(McpError::Protocol(format!("tools/call failed: {error}")));
        }
        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("failed to parse tools/call result: {e}")))
    }

    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.client.reject_all_pending("MCP client shut down");
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let payload = serde_json::to_string(&request).map_err(McpError::Json)?;
        let reply = self
            .client
            .request(&self.request_channel, &id.to_string(), &payload, REQUEST_TIMEOUT, method)
            .await
            .map_err(McpError::Bus)?;
        serde_json::from_str(&reply).map_err(McpError::Json)
    }

    async fn send_notification(&self, method: &str) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method);
        let payload = serde_json::to_string(&notification).map_err(McpError::Json)?;
        self.bus.publish(&self.request_channel, &payload).await.map_err(McpError::Bus)?;
        Ok(())
    }
}
