//! MCP Client error types.

use thiserror::Error;

use super::connection::ConnectionState;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Configuration error (unreadable file, bad root, invalid server entry).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// A connect attempt or request exceeded its bound.
    #[error("server '{server}' timed out during {operation} after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Operation requires a connected server.
    #[error("server '{name}' is not connected (state: {state})")]
    NotConnected {
        name: String,
        state: ConnectionState,
    },

    /// Tool not found in the aggregated catalog.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
        suggestions: Vec<String>,
    },

    /// A bare tool name is exposed by more than one connected server.
    #[error("ambiguous tool name '{name}': use one of {}", .candidates.join(", "))]
    AmbiguousTool {
        name: String,
        candidates: Vec<String>,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// A server sent a response that does not follow the protocol.
    #[error("protocol error from server '{server}': {reason}")]
    ProtocolError { server: String, reason: String },

    /// JSON-RPC communication error (serialization, I/O, closed pipe).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Server process exited while a request was outstanding.
    #[error("server '{name}' crashed: {reason}")]
    ServerCrashed { name: String, reason: String },

    /// Lifecycle operation attempted from a state that does not allow it.
    #[error("server '{name}' cannot {operation} while {state}")]
    InvalidState {
        name: String,
        operation: &'static str,
        state: ConnectionState,
    },

    /// A spawned tool call was aborted before it finished.
    #[error("tool call '{tool}' was cancelled")]
    Cancelled { tool: String },
}

impl McpError {
    /// Launch or handshake failure for a single server.
    pub fn is_connect_error(&self) -> bool {
        matches!(self, Self::SpawnFailed { .. } | Self::InitFailed { .. })
    }

    /// Unknown or ambiguous tool name.
    pub fn is_tool_not_found(&self) -> bool {
        matches!(self, Self::UnknownTool { .. } | Self::AmbiguousTool { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_message_lists_candidates() {
        let err = McpError::AmbiguousTool {
            name: "search".into(),
            candidates: vec!["a.search".into(), "b.search".into()],
        };
        assert_eq!(
            err.to_string(),
            "ambiguous tool name 'search': use one of a.search, b.search"
        );
        assert!(err.is_tool_not_found());
    }

    #[test]
    fn test_not_connected_message_includes_state() {
        let err = McpError::NotConnected {
            name: "fetch".into(),
            state: ConnectionState::Failed,
        };
        assert_eq!(err.to_string(), "server 'fetch' is not connected (state: failed)");
    }

    #[test]
    fn test_classification() {
        let spawn = McpError::SpawnFailed {
            name: "x".into(),
            reason: "not found".into(),
        };
        assert!(spawn.is_connect_error());
        assert!(!spawn.is_timeout());

        let timeout = McpError::Timeout {
            server: "x".into(),
            operation: "connect".into(),
            timeout_ms: 10,
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_connect_error());
    }
}
