//! MCP Client — JSON-RPC over stdio for a fleet of tool servers.
//!
//! This module handles:
//! - Loading server launch specs from a JSON or YAML config
//! - Spawning MCP server child processes and the initialization handshake
//! - Pipelined JSON-RPC 2.0 communication over process stdio
//! - Tool discovery and aggregation across all servers
//! - Tool call routing, argument validation, and teardown

pub mod catalog;
pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod requirements;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use catalog::{Tool, ToolArguments, ToolCatalog};
pub use client::{CallHandle, MultiServerClient, DEFAULT_CALL_TIMEOUT};
pub use config::{
    load_servers_config, parse_servers_config, ConfigFormat, ServerSpec, ServerSpecs, SkippedEntry,
    TransportKind,
};
pub use connection::{ConnectionState, ServerConnection, ServerStatus, DEFAULT_CONNECT_TIMEOUT};
pub use errors::McpError;
pub use types::ToolOutput;
