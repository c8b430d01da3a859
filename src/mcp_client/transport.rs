//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing JSON-RPC requests and notifications to stdin
//! - Reading JSON-RPC messages from stdout and correlating responses by id
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! Requests are pipelined: a background reader task owns stdout and hands each
//! response to the waiter registered under its id, and a background writer
//! task owns stdin so a cancelled caller can never leave half a line behind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{
    classify, error_codes, Incoming, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};

/// What the reader hands a waiter: the response, or why it could not be decoded.
type Reply = Result<JsonRpcResponse, String>;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mark the channel dead and wake every waiter with a closed-channel error.
fn fail_pending(server: &str, pending: &PendingMap, closed: &AtomicBool) {
    closed.store(true, Ordering::SeqCst);
    let abandoned: Vec<_> = lock_pending(pending).drain().collect();
    if !abandoned.is_empty() {
        tracing::debug!(server = %server, count = abandoned.len(), "failing in-flight requests");
    }
}

/// Work item for the writer task.
enum Outgoing {
    Line(String),
    Close,
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    next_id: AtomicU64,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a transport over a process's stdin (`writer`) and stdout (`reader`).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer_task = tokio::spawn(write_loop(
            server_name.to_string(),
            writer,
            outgoing_rx,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));
        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            BufReader::new(reader),
            Arc::clone(&pending),
            outgoing.clone(),
            Arc::clone(&closed),
        ));

        Self {
            server_name: server_name.to_string(),
            next_id: AtomicU64::new(1),
            outgoing,
            pending,
            closed,
            reader_task,
            writer_task,
        }
    }

    /// Send a JSON-RPC request and wait for the response with the same `id`.
    ///
    /// On timeout the waiter is released and `notifications/cancelled` is
    /// sent, so a late reply is discarded and the channel stays usable.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = self.encode(&JsonRpcRequest::new(id, method, params), "request")?;

        let (tx, rx) = oneshot::channel();
        let mut slot = PendingSlot::register(self, id, tx);

        // Both background tasks mark the channel closed before draining
        // waiters, so a slot registered after the drain is caught here.
        if self.is_closed() {
            slot.settle();
            return Err(self.closed_error());
        }

        if let Err(e) = self.send_line(line) {
            slot.settle();
            return Err(e);
        }
        tracing::trace!(server = %self.server_name, id, method, "sent request");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => {
                slot.settle();
                Ok(response)
            }
            Ok(Ok(Err(reason))) => {
                slot.settle();
                Err(McpError::ProtocolError {
                    server: self.server_name.clone(),
                    reason,
                })
            }
            Ok(Err(_)) => {
                slot.settle();
                Err(self.closed_error())
            }
            Err(_) => {
                slot.cancel_reason = "request timed out";
                drop(slot);
                Err(McpError::Timeout {
                    server: self.server_name.clone(),
                    operation: method.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        let line = self.encode(&JsonRpcNotification::new(method, params), "notification")?;
        self.send_line(line)
    }

    /// Tell the server to abandon request `id`.
    fn cancel(&self, id: u64, reason: &str) {
        let params = serde_json::json!({ "requestId": id, "reason": reason });
        if let Err(e) = self.notify("notifications/cancelled", Some(params)) {
            tracing::debug!(server = %self.server_name, id, error = %e, "failed to send cancellation");
        }
    }

    /// Close the server's stdin once queued writes are flushed.
    pub fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }

    /// Whether the server's stdout (or stdin) has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    fn encode<T: serde::Serialize>(&self, message: &T, kind: &str) -> Result<String, McpError> {
        let mut json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize {kind}: {e}"),
        })?;
        json.push('\n');
        Ok(json)
    }

    fn send_line(&self, line: String) -> Result<(), McpError> {
        self.outgoing
            .send(Outgoing::Line(line))
            .map_err(|_| McpError::TransportError {
                server: self.server_name.clone(),
                reason: "server stdin closed".into(),
            })
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: "server channel closed (process may have exited)".into(),
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

/// A registered waiter.
///
/// Dropping an unsettled slot (timeout, or the caller's future was dropped)
/// deregisters it and tells the server to abandon the request.
struct PendingSlot<'a> {
    transport: &'a StdioTransport,
    id: u64,
    settled: bool,
    cancel_reason: &'static str,
}

impl<'a> PendingSlot<'a> {
    fn register(
        transport: &'a StdioTransport,
        id: u64,
        tx: oneshot::Sender<Reply>,
    ) -> Self {
        lock_pending(&transport.pending).insert(id, tx);
        Self {
            transport,
            id,
            settled: false,
            cancel_reason: "request abandoned by caller",
        }
    }

    /// The request finished one way or another; nothing to cancel.
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock_pending(&self.transport.pending).remove(&self.id);
        if !self.settled && !self.transport.is_closed() {
            self.transport.cancel(self.id, self.cancel_reason);
        }
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

async fn write_loop<W>(
    server: String,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        match message {
            Outgoing::Line(line) => {
                let written = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.flush().await
                }
                .await;

                if let Err(e) = written {
                    tracing::warn!(server = %server, error = %e, "failed to write to server stdin");
                    fail_pending(&server, &pending, &closed);
                    break;
                }
            }
            Outgoing::Close => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
}

async fn read_loop<R>(
    server: String,
    mut reader: BufReader<R>,
    pending: PendingMap,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut line_buf = Vec::new();

    loop {
        line_buf.clear();
        match reader.read_until(b'\n', &mut line_buf).await {
            Ok(0) => {
                tracing::debug!(server = %server, "server stdout closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "failed to read from server stdout");
                break;
            }
        }

        let Ok(line) = std::str::from_utf8(&line_buf) else {
            tracing::trace!(server = %server, bytes = line_buf.len(), "skipping non-UTF-8 output");
            continue;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // Not JSON — could be server log output. Skip and keep reading.
        let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            tracing::trace!(server = %server, line = trimmed, "skipping non-JSON output");
            continue;
        };

        match classify(value) {
            Some(Incoming::Response(response)) => {
                let waiter = lock_pending(&pending).remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => {
                        tracing::debug!(
                            server = %server,
                            id = response.id,
                            "discarding response for unknown or cancelled request"
                        );
                    }
                }
            }
            Some(Incoming::Malformed { id, reason }) => {
                tracing::warn!(server = %server, id, reason = %reason, "undecodable response");
                if let Some(tx) = lock_pending(&pending).remove(&id) {
                    let _ = tx.send(Err(reason));
                }
            }
            Some(Incoming::Request { id, method }) => {
                let reply = reply_to_server_request(id, &method);
                let _ = outgoing.send(Outgoing::Line(format!("{reply}\n")));
            }
            Some(Incoming::Notification { method }) => {
                tracing::debug!(server = %server, method = %method, "server notification");
            }
            None => {
                tracing::debug!(server = %server, "skipping unrecognized message");
            }
        }
    }

    fail_pending(&server, &pending, &closed);
}

/// Answer a server-initiated request. Only `ping` is supported.
fn reply_to_server_request(id: serde_json::Value, method: &str) -> serde_json::Value {
    if method == "ping" {
        serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} })
    } else {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("method not supported by client: {method}"),
            },
        })
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(
    server: &str,
    response: JsonRpcResponse,
) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or_else(|| McpError::ProtocolError {
        server: server.to_string(),
        reason: "response missing both result and error".into(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
