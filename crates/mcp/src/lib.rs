//! `ra-mcp` — MCP (Model Context Protocol) client/server over the bus.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types for communicating with MCP servers.
//! - [`BusMcpClient`], which runs the MCP handshake and tool dispatch
//!   over [`ra_bus::Bus`] pub/sub instead of a stdio child process.
//! - [`BusMcpServer`], the matching server half.
//! - [`McpManager`], which connects to every configured server and
//!   orchestrates tool discovery and dispatch across all of them.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ra_mcp::{McpConfig, McpManager};
//!
//! let config: McpConfig = /* from TOML */;
//! let manager = McpManager::from_config(bus, &config, "gateway-1").await;
//!
//! // List all discovered tools.
//! for (server_id, tool) in manager.list_tools() {
//!     println!("mcp:{server_id}:{}", tool.name);
//! }
//!
//! // Call a tool.
//! let result = manager.call_tool("rag", "search", json!({"query": "..."}), None).await?;
//! ```

pub mod client;
pub mod config;
pub mod manager;
pub mod protocol;
pub mod server;

// Re-exports for convenience.
pub use client::BusMcpClient;
pub use config::{McpConfig, McpServerConfig};
pub use manager::{McpError, McpManager};
pub use protocol::McpToolDef;
pub use server::BusMcpServer;
