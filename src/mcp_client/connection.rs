//! Per-server connection lifecycle.
//!
//! A `ServerConnection` owns one MCP server child process and its JSON-RPC
//! channel. It spawns the process, performs the initialization handshake,
//! discovers the server's tools, routes calls, and tears everything down.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──▶ Connected ──disconnect──▶ Closed
//!                                └──────▶ Failed ────disconnect──▶ Closed
//! ```
//!
//! A failed connection is never retried; `Closed` is terminal.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use super::catalog::{Tool, ToolArguments};
use super::config::ServerSpec;
use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{initialize_params, InitializeResult, ListToolsResult};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Bound on a standalone `connect()` (spawn, handshake and discovery).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a failure waits for the child's stderr to drain.
const STDERR_GRACE: Duration = Duration::from_millis(500);

/// Stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Cap on the stderr excerpt attached to error messages.
const STDERR_EXCERPT_CHARS: usize = 2000;

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a server connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    /// Torn down. Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Teardown is allowed from every state, including `Closed` itself.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (_, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a connection, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub pid: Option<u32>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    transport: Option<Arc<StdioTransport>>,
    tools: Vec<Tool>,
    last_error: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    pid: Option<u32>,
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

// ─── ServerConnection ────────────────────────────────────────────────────────

/// One MCP server process and the channel used to talk to it.
pub struct ServerConnection {
    spec: Arc<ServerSpec>,
    inner: RwLock<Inner>,
    process: tokio::sync::Mutex<Option<Child>>,
    stderr_tail: StderrTail,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerConnection {
    pub fn new(spec: Arc<ServerSpec>) -> Self {
        Self {
            spec,
            inner: RwLock::new(Inner::default()),
            process: tokio::sync::Mutex::new(None),
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
            stderr_task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &Arc<ServerSpec> {
        &self.spec
    }

    pub fn state(&self) -> ConnectionState {
        self.read_inner().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Tools discovered during connect. Empty unless `Connected`.
    pub fn tools(&self) -> Vec<Tool> {
        self.read_inner().tools.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.read_inner().last_error.clone()
    }

    pub fn status(&self) -> ServerStatus {
        let inner = self.read_inner();
        ServerStatus {
            name: self.spec.name.clone(),
            state: inner.state,
            tool_count: inner.tools.len(),
            pid: inner.pid,
            connected_at: inner.connected_at,
            last_error: inner.last_error.clone(),
        }
    }

    /// Connect with the default bound.
    pub async fn connect(&self) -> Result<(), McpError> {
        self.connect_within(DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Spawn the server, handshake and discover tools, all within `timeout`.
    ///
    /// Valid only from `Disconnected`. Any failure (including expiry of the
    /// bound) kills and reaps the child and leaves the connection `Failed`.
    pub async fn connect_within(&self, timeout: Duration) -> Result<(), McpError> {
        self.begin_connect()?;
        tracing::debug!(server = %self.spec.name, command = %self.spec.command, "connecting");

        let outcome = match tokio::time::timeout(timeout, self.establish(timeout)).await {
            Ok(result) => result,
            Err(_) => {
                let stderr = self.stderr_excerpt();
                if !stderr.is_empty() {
                    tracing::warn!(server = %self.spec.name, stderr = %stderr, "server stderr captured on timeout");
                }
                Err(McpError::Timeout {
                    server: self.spec.name.clone(),
                    operation: "connect".into(),
                    timeout_ms: duration_ms(timeout),
                })
            }
        };

        match outcome {
            Ok((transport, tools)) => {
                let torn_down = {
                    let mut inner = self.write_inner();
                    if inner.state == ConnectionState::Connecting {
                        inner.state = ConnectionState::Connected;
                        inner.transport = Some(transport);
                        inner.connected_at = Some(Utc::now());
                        inner.last_error = None;
                        inner.tools = tools;
                        tracing::info!(
                            server = %self.spec.name,
                            tools = inner.tools.len(),
                            pid = ?inner.pid,
                            "server connected"
                        );
                        None
                    } else {
                        Some(inner.state)
                    }
                };

                // Torn down while the handshake was in flight.
                if let Some(state) = torn_down {
                    self.release().await;
                    return Err(McpError::InvalidState {
                        name: self.spec.name.clone(),
                        operation: "connect",
                        state,
                    });
                }
                Ok(())
            }
            Err(e) => {
                self.release().await;
                let mut inner = self.write_inner();
                if inner.state == ConnectionState::Connecting {
                    inner.state = ConnectionState::Failed;
                }
                inner.last_error = Some(e.to_string());
                tracing::warn!(server = %self.spec.name, error = %e, "server failed to connect");
                Err(e)
            }
        }
    }

    fn begin_connect(&self) -> Result<(), McpError> {
        let mut inner = self.write_inner();
        if !inner.state.can_transition_to(ConnectionState::Connecting) {
            return Err(McpError::InvalidState {
                name: self.spec.name.clone(),
                operation: "connect",
                state: inner.state,
            });
        }
        inner.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Spawn, handshake and discover. The child is registered before the
    /// first await so a cancelled attempt can still be reaped.
    async fn establish(
        &self,
        timeout: Duration,
    ) -> Result<(Arc<StdioTransport>, Vec<Tool>), McpError> {
        let mut child = self.spawn_child()?;
        let name = self.spec.name.as_str();

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            let task = tokio::spawn(drain_stderr(
                name.to_string(),
                stderr,
                Arc::clone(&self.stderr_tail),
            ));
            *self.stderr_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        }

        self.write_inner().pid = child.id();
        *self.process.lock().await = Some(child);

        let transport = Arc::new(StdioTransport::new(name, stdin, stdout));

        if let Err(e) = handshake(name, &transport, timeout).await {
            self.settle_stderr().await;
            let stderr = self.stderr_excerpt();
            if !stderr.is_empty() {
                tracing::warn!(server = %name, stderr = %stderr, "server stderr captured on failure");
            }
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!("{e}{}", format_stderr_suffix(&stderr)),
            });
        }

        let tools = match fetch_tools(name, &transport, timeout).await {
            Ok(tools) => tools,
            Err(e @ (McpError::TransportError { .. } | McpError::Timeout { .. })) => return Err(e),
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "tool discovery failed, continuing with no tools");
                Vec::new()
            }
        };

        Ok((transport, tools))
    }

    fn spawn_child(&self) -> Result<Child, McpError> {
        let spec = &self.spec;
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);

        if let Some(env) = &spec.env {
            cmd.envs(env);
        }
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: spec.name.clone(),
            reason: format!("{}: {e}", spec.command),
        })
    }

    /// Re-run tool discovery on a connected server.
    ///
    /// On failure the tool list is left empty; the connection stays up.
    pub async fn load_tools(&self) -> Result<usize, McpError> {
        let transport = self.connected_transport()?;
        match fetch_tools(&self.spec.name, &transport, DEFAULT_CONNECT_TIMEOUT).await {
            Ok(tools) => {
                let count = tools.len();
                self.write_inner().tools = tools;
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(server = %self.spec.name, error = %e, "tool discovery failed");
                self.write_inner().tools.clear();
                Err(e)
            }
        }
    }

    /// Invoke `tool` on this server and return its `result` payload unmodified.
    ///
    /// A closed channel means the process died: the connection is torn down
    /// and the failure surfaces as `ServerCrashed`.
    pub async fn call(
        &self,
        tool: &str,
        arguments: ToolArguments,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let transport = self.connected_transport()?;
        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments.into_value(),
        });

        match transport.request("tools/call", Some(params), timeout).await {
            Ok(response) => extract_result(&self.spec.name, response),
            Err(McpError::TransportError { reason, .. }) => {
                self.settle_stderr().await;
                let reason = format!("{reason}{}", format_stderr_suffix(&self.stderr_excerpt()));
                tracing::warn!(server = %self.spec.name, tool, reason = %reason, "server channel lost during call");
                self.write_inner().last_error = Some(reason.clone());
                drop(transport);
                self.disconnect().await;
                Err(McpError::ServerCrashed {
                    name: self.spec.name.clone(),
                    reason,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn connected_transport(&self) -> Result<Arc<StdioTransport>, McpError> {
        let inner = self.read_inner();
        match (&inner.transport, inner.state) {
            (Some(transport), ConnectionState::Connected) => Ok(Arc::clone(transport)),
            (_, state) => Err(McpError::NotConnected {
                name: self.spec.name.clone(),
                state,
            }),
        }
    }

    /// Tear down the channel and the process. Idempotent, valid from any state.
    ///
    /// A connected server gets its stdin closed and up to five seconds to
    /// exit before it is killed; anything else is killed straight away.
    pub async fn disconnect(&self) {
        let (transport, previous) = {
            let mut inner = self.write_inner();
            let previous = inner.state;
            inner.state = ConnectionState::Closed;
            inner.tools.clear();
            (inner.transport.take(), previous)
        };

        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            match &transport {
                Some(transport) => {
                    transport.close();
                    match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                        Ok(Ok(status)) => {
                            tracing::debug!(server = %self.spec.name, %status, "server exited");
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(server = %self.spec.name, error = %e, "failed to wait for server exit");
                            kill_child(&self.spec.name, &mut child).await;
                        }
                        Err(_) => {
                            tracing::warn!(server = %self.spec.name, "server did not exit in time, killing");
                            kill_child(&self.spec.name, &mut child).await;
                        }
                    }
                }
                None => kill_child(&self.spec.name, &mut child).await,
            }
        }
        drop(transport);

        if previous != ConnectionState::Closed {
            tracing::info!(server = %self.spec.name, from = %previous, "server disconnected");
        }
    }

    /// Kill and reap whatever a failed attempt left behind.
    async fn release(&self) {
        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            kill_child(&self.spec.name, &mut child).await;
        }
    }

    /// Give the stderr reader a moment to catch the child's last words.
    async fn settle_stderr(&self) {
        let task = self
            .stderr_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(STDERR_GRACE, task).await;
        }
    }

    fn stderr_excerpt(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
        let joined = tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        if joined.chars().count() > STDERR_EXCERPT_CHARS {
            let mut cut: String = joined.chars().take(STDERR_EXCERPT_CHARS).collect();
            cut.push_str("...(truncated)");
            cut
        } else {
            joined
        }
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("name", &self.spec.name)
            .field("state", &self.state())
            .finish()
    }
}

// ─── Protocol Steps ──────────────────────────────────────────────────────────

/// `initialize` followed by `notifications/initialized`.
async fn handshake(
    server: &str,
    transport: &StdioTransport,
    timeout: Duration,
) -> Result<InitializeResult, McpError> {
    let response = transport
        .request("initialize", Some(initialize_params()), timeout)
        .await?;
    let result = extract_result(server, response)?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::ProtocolError {
            server: server.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    transport.notify("notifications/initialized", None)?;

    let info = init.server_info.as_ref();
    tracing::debug!(
        server,
        protocol_version = init.protocol_version.as_deref().unwrap_or("unknown"),
        server_name = info.and_then(|i| i.name.as_deref()).unwrap_or("unknown"),
        server_version = info.and_then(|i| i.version.as_deref()).unwrap_or("unknown"),
        "handshake complete"
    );
    Ok(init)
}

/// `tools/list`, following `nextCursor` until the server stops paging.
async fn fetch_tools(
    server: &str,
    transport: &StdioTransport,
    timeout: Duration,
) -> Result<Vec<Tool>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen_cursors = HashSet::new();

    loop {
        let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
        let response = transport.request("tools/list", params, timeout).await?;
        let result = extract_result(server, response)?;

        let page: ListToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::ProtocolError {
                server: server.to_string(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;

        tools.extend(page.tools.into_iter().map(|def| Tool::from_definition(server, def)));

        match page.next_cursor {
            Some(next) if !next.is_empty() => {
                if !seen_cursors.insert(next.clone()) {
                    return Err(McpError::ProtocolError {
                        server: server.to_string(),
                        reason: format!("tools/list repeated cursor '{next}'"),
                    });
                }
                cursor = Some(next);
            }
            _ => break,
        }
    }

    tracing::debug!(server, count = tools.len(), "discovered tools");
    Ok(tools)
}

// ─── Process Helpers ─────────────────────────────────────────────────────────

async fn kill_child(server: &str, child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!(server, error = %e, "failed to kill server process");
    }
}

/// Forward the child's stderr to the log and keep its last lines.
async fn drain_stderr(server: String, stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(server = %server, line = %line, "server stderr");
                let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "stopped reading server stderr");
                break;
            }
        }
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
