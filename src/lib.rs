//! toolmux — run a set of MCP tool servers as one.
//!
//! Launches independently configured stdio tool servers, discovers the tools
//! each one exposes, merges them into a single catalog and routes calls by
//! name to the owning server.
//!
//! ```no_run
//! use std::time::Duration;
//! use toolmux::mcp_client::{load_servers_config, MultiServerClient};
//!
//! # async fn run() -> Result<(), toolmux::mcp_client::McpError> {
//! let specs = load_servers_config("mcp_servers.json".as_ref())?;
//! let client = MultiServerClient::new();
//! let results = client.connect_all(&specs, Duration::from_secs(30)).await;
//! println!("{results:?}");
//!
//! let output = client.call("fetch.fetch", serde_json::json!({"url": "https://example.com"})).await?;
//! println!("{}", output.text().unwrap_or_default());
//!
//! client.disconnect_all().await;
//! # Ok(())
//! # }
//! ```

pub mod logging;
pub mod mcp_client;
