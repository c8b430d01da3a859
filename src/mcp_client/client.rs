//! MCP Client — the public API for managing multiple tool servers.
//!
//! `MultiServerClient` connects a set of servers concurrently, aggregates
//! their tools into one catalog, and routes calls by tool name to the server
//! that owns the tool.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::task::JoinHandle;

use super::catalog::{Tool, ToolCatalog};
use super::config::ServerSpecs;
use super::connection::{duration_ms, ConnectionState, ServerConnection, ServerStatus};
use super::errors::McpError;
use super::types::ToolOutput;

/// Default timeout for a single tool call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Connects, tracks and routes to a set of MCP servers.
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct MultiServerClient {
    connections: RwLock<BTreeMap<String, Arc<ServerConnection>>>,
    /// Whole-snapshot replacement only; readers never see a partial catalog.
    catalog: RwLock<Arc<ToolCatalog>>,
    call_timeout: Duration,
}

impl Default for MultiServerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiServerClient {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            catalog: RwLock::new(Arc::new(ToolCatalog::new())),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Use `timeout` as the default bound for `call`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn set_call_timeout(&mut self, timeout: Duration) {
        self.call_timeout = timeout;
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    // ─── Connecting ──────────────────────────────────────────────────────

    /// Connect every server in `specs` concurrently, each bounded by `timeout`.
    ///
    /// Returns, for every spec name, whether that server ended up connected.
    /// Individual failures never fail the whole call. An earlier connection
    /// with the same name is disconnected and replaced.
    pub async fn connect_all(
        &self,
        specs: &ServerSpecs,
        timeout: Duration,
    ) -> BTreeMap<String, bool> {
        let replaced: Vec<Arc<ServerConnection>> = {
            let mut connections = self.write_connections();
            specs
                .iter()
                .filter_map(|spec| connections.remove(&spec.name))
                .collect()
        };
        if !replaced.is_empty() {
            tracing::debug!(count = replaced.len(), "replacing existing connections");
            join_all(replaced.iter().map(|c| c.disconnect())).await;
        }

        let fresh: Vec<Arc<ServerConnection>> = specs
            .iter()
            .map(|spec| Arc::new(ServerConnection::new(Arc::clone(spec))))
            .collect();
        {
            let mut connections = self.write_connections();
            for conn in &fresh {
                connections.insert(conn.name().to_string(), Arc::clone(conn));
            }
        }

        // One task per server so a slow handshake never holds up the others.
        let attempts: Vec<(Arc<ServerConnection>, JoinHandle<bool>)> = fresh
            .into_iter()
            .map(|conn| {
                let attempt = Arc::clone(&conn);
                let handle =
                    tokio::spawn(async move { attempt.connect_within(timeout).await.is_ok() });
                (conn, handle)
            })
            .collect();

        let mut results = BTreeMap::new();
        for (conn, handle) in attempts {
            let connected = match handle.await {
                Ok(connected) => connected,
                Err(e) => {
                    tracing::error!(server = %conn.name(), error = %e, "connection attempt panicked");
                    conn.disconnect().await;
                    false
                }
            };
            results.insert(conn.name().to_string(), connected);
        }

        let catalog = self.refresh_catalog();
        let connected = results.values().filter(|ok| **ok).count();
        tracing::info!(
            connected,
            failed = results.len() - connected,
            tools = catalog.len(),
            "connect_all complete"
        );
        if connected == 0 && !results.is_empty() {
            tracing::warn!("no servers connected, running without tools");
        }

        results
    }

    /// Rebuild the catalog from the connections that are currently connected.
    pub fn refresh_catalog(&self) -> Arc<ToolCatalog> {
        let mut catalog = ToolCatalog::new();
        for conn in self.connections_snapshot() {
            if conn.is_connected() {
                catalog.add_all(conn.name(), conn.tools());
            }
        }

        let catalog = Arc::new(catalog);
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&catalog);
        catalog
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// Names of servers currently connected, sorted.
    pub fn get_connected_servers(&self) -> Vec<String> {
        self.read_connections()
            .values()
            .filter(|c| c.is_connected())
            .map(|c| c.name().to_string())
            .collect()
    }

    /// True when no server is connected; collaborators fall back to a
    /// no-tool mode.
    pub fn is_offline(&self) -> bool {
        self.get_connected_servers().is_empty()
    }

    pub fn connection_status(&self) -> BTreeMap<String, ConnectionState> {
        self.read_connections()
            .iter()
            .map(|(name, c)| (name.clone(), c.state()))
            .collect()
    }

    pub fn server_status(&self) -> Vec<ServerStatus> {
        self.connections_snapshot()
            .iter()
            .map(|c| c.status())
            .collect()
    }

    /// Tools of one server; `None` if the server is unknown.
    pub fn server_tools(&self, name: &str) -> Option<Vec<Tool>> {
        self.connection(name).map(|c| c.tools())
    }

    pub fn connection(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.read_connections().get(name).cloned()
    }

    /// Current catalog snapshot.
    pub fn catalog(&self) -> Arc<ToolCatalog> {
        Arc::clone(&self.catalog.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Every catalog tool, ordered by (server, tool name).
    pub fn list_tools(&self) -> Vec<Tool> {
        self.catalog().list_all().into_iter().cloned().collect()
    }

    // ─── Calling ─────────────────────────────────────────────────────────

    /// Call a tool by qualified or bare name with the default timeout.
    pub async fn call(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, McpError> {
        self.call_within(tool_name, arguments, self.call_timeout).await
    }

    /// Call a tool, bounded by `timeout`.
    ///
    /// Failures are surfaced as-is; nothing is retried.
    pub async fn call_within(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolOutput, McpError> {
        let started = Instant::now();

        // 1. Resolve
        let tool = match self.catalog().resolve(tool_name) {
            Ok(tool) => tool.clone(),
            Err(e @ McpError::UnknownTool { .. }) => {
                return Err(self.unavailable_owner(tool_name).unwrap_or(e));
            }
            Err(e) => return Err(e),
        };

        // 2. Validate
        let arguments = tool.validate_arguments(arguments)?;

        // 3. Route
        let connection = self
            .connection(&tool.server_name)
            .ok_or_else(|| McpError::NotConnected {
                name: tool.server_name.clone(),
                state: ConnectionState::Closed,
            })?;

        tracing::debug!(tool = %tool.qualified_name, "routing tool call");
        let payload = match connection.call(&tool.name, arguments, timeout).await {
            Ok(payload) => payload,
            Err(e) => {
                if matches!(e, McpError::ServerCrashed { .. }) {
                    self.refresh_catalog();
                }
                tracing::warn!(tool = %tool.qualified_name, error = %e, "tool call failed");
                return Err(e);
            }
        };

        let execution_time_ms = duration_ms(started.elapsed());
        tracing::info!(
            tool = %tool.qualified_name,
            elapsed_ms = execution_time_ms,
            "tool call completed"
        );

        Ok(ToolOutput {
            tool: tool.qualified_name,
            server: tool.server_name,
            payload,
            execution_time_ms,
        })
    }

    /// Run a call on its own task and hand back a handle to await or abort.
    pub fn spawn_call(self: &Arc<Self>, tool_name: &str, arguments: serde_json::Value) -> CallHandle {
        let client = Arc::clone(self);
        let tool = tool_name.to_string();
        let handle = tokio::spawn(async move { client.call(&tool, arguments).await });
        CallHandle {
            tool: tool_name.to_string(),
            handle,
        }
    }

    /// A name like `server.tool` whose server is known but not connected.
    fn unavailable_owner(&self, tool_name: &str) -> Option<McpError> {
        self.read_connections()
            .values()
            .filter(|c| !c.is_connected())
            .filter(|c| {
                tool_name
                    .strip_prefix(c.name())
                    .is_some_and(|rest| rest.starts_with('.'))
            })
            .max_by_key(|c| c.name().len())
            .map(|c| McpError::NotConnected {
                name: c.name().to_string(),
                state: c.state(),
            })
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Disconnect one server and drop its tools from the catalog.
    ///
    /// Returns `false` if no server has that name.
    pub async fn disconnect_server(&self, name: &str) -> bool {
        let Some(conn) = self.connection(name) else {
            return false;
        };
        conn.disconnect().await;
        self.refresh_catalog();
        true
    }

    /// Tear down every connection concurrently and clear the catalog.
    ///
    /// Safe to call repeatedly and with nothing connected.
    pub async fn disconnect_all(&self) {
        let connections = self.connections_snapshot();
        join_all(connections.iter().map(|c| c.disconnect())).await;

        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(ToolCatalog::new());
        tracing::info!(count = connections.len(), "all servers disconnected");
    }

    fn connections_snapshot(&self) -> Vec<Arc<ServerConnection>> {
        self.read_connections().values().cloned().collect()
    }

    fn read_connections(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<ServerConnection>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_connections(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<ServerConnection>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── CallHandle ──────────────────────────────────────────────────────────────

/// A tool call running on its own task.
///
/// Dropping the handle detaches the call; `abort` cancels it.
pub struct CallHandle {
    tool: String,
    handle: JoinHandle<Result<ToolOutput, McpError>>,
}

impl CallHandle {
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Cancel the call. The server is told to abandon the request.
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the call. An aborted call yields `Cancelled`.
    pub async fn join(self) -> Result<ToolOutput, McpError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(McpError::Cancelled { tool: self.tool }),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::ServerSpec;

    fn broken_specs() -> ServerSpecs {
        ServerSpecs::from_specs(vec![
            ServerSpec::stdio("b", "/nonexistent", Vec::<String>::new()).unwrap(),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_empty_client() {
        let client = MultiServerClient::new();
        assert!(client.get_connected_servers().is_empty());
        assert!(client.is_offline());
        assert!(client.catalog().is_empty());
        assert_eq!(client.call_timeout(), DEFAULT_CALL_TIMEOUT);

        client.disconnect_all().await;
        client.disconnect_all().await;
        assert!(!client.disconnect_server("missing").await);
    }

    #[tokio::test]
    async fn test_connect_all_with_no_specs() {
        let client = MultiServerClient::new();
        let results = client
            .connect_all(&ServerSpecs::default(), Duration::from_secs(1))
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_failed_server_is_reported_and_absent() {
        let client = MultiServerClient::new();
        let results = client.connect_all(&broken_specs(), Duration::from_secs(5)).await;

        assert_eq!(results.get("b"), Some(&false));
        assert!(client.is_offline());
        assert_eq!(client.connection_status()["b"], ConnectionState::Failed);
        assert_eq!(client.server_tools("b"), Some(Vec::new()));
        assert!(client.server_tools("nope").is_none());

        let status = client.server_status();
        assert_eq!(status.len(), 1);
        assert!(status[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_call_on_failed_server_is_not_connected() {
        let client = MultiServerClient::new();
        client.connect_all(&broken_specs(), Duration::from_secs(5)).await;

        let err = client.call("b.anything", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            McpError::NotConnected { ref name, state: ConnectionState::Failed } if name == "b"
        ));

        let unknown = client.call("anything", serde_json::json!({})).await.unwrap_err();
        assert!(unknown.is_tool_not_found());
    }

    #[tokio::test]
    async fn test_spawned_call_surfaces_errors() {
        let client = Arc::new(MultiServerClient::new().with_call_timeout(Duration::from_secs(1)));
        let handle = client.spawn_call("nothing.here", serde_json::Value::Null);
        assert_eq!(handle.tool(), "nothing.here");

        let err = handle.join().await.unwrap_err();
        assert!(err.is_tool_not_found());
    }
}
