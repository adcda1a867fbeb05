//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with a worker process:
//! - Writing JSON-RPC requests and notifications to stdin
//! - A background reader that decodes stdout and routes responses by id
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! Requests are multiplexed: any number may be in flight on one connection,
//! each parked on its own oneshot channel until the reader delivers the
//! matching response, the call times out, or the stream closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{
    error_codes, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, MessageKind,
};

/// Read half of a worker connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of a worker connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type Reply = Result<Value, McpError>;

// ─── Pending Requests ────────────────────────────────────────────────────────

/// A request that has been written and is waiting for its response.
struct PendingRequest {
    method: String,
    issued_at: Instant,
    reply: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
    /// Set once the stream is gone; new requests are refused with this reason.
    closed: Option<String>,
}

/// State shared between the transport handle and its reader task.
struct Shared {
    context: String,
    pending: Mutex<PendingTable>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    closed: Notify,
    /// Bumped on every `notifications/tools/list_changed`.
    tools_epoch: AtomicU64,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, id: u64, method: &str) -> Result<oneshot::Receiver<Reply>, McpError> {
        let mut table = self.table();
        if let Some(reason) = &table.closed {
            return Err(McpError::WorkerCrashed {
                context: self.context.clone(),
                reason: reason.clone(),
            });
        }
        let (tx, rx) = oneshot::channel();
        table.entries.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                issued_at: Instant::now(),
                reply: tx,
            },
        );
        Ok(rx)
    }

    fn retire(&self, id: u64) -> bool {
        self.table().entries.remove(&id).is_some()
    }

    /// Deliver a reply to the waiter registered under `id`.
    ///
    /// Returns `false` when no such request is pending (already retired).
    fn resolve(&self, id: u64, reply: Reply) -> bool {
        let Some(pending) = self.table().entries.remove(&id) else {
            return false;
        };
        tracing::debug!(
            context = %self.context,
            id,
            method = %pending.method,
            latency_ms = u64::try_from(pending.issued_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            ok = reply.is_ok(),
            "response received"
        );
        // The waiter may have been cancelled in the meantime.
        let _ = pending.reply.send(reply);
        true
    }

    /// Mark the stream closed and fail everything still waiting on it.
    fn close(&self, reason: &str) {
        let drained: Vec<PendingRequest> = {
            let mut table = self.table();
            if table.closed.is_none() {
                table.closed = Some(reason.to_string());
            }
            table.entries.drain().map(|(_, p)| p).collect()
        };

        if !drained.is_empty() {
            tracing::warn!(
                context = %self.context,
                failed = drained.len(),
                reason,
                "failing pending requests on closed worker"
            );
        }
        for pending in drained {
            let _ = pending.reply.send(Err(McpError::WorkerCrashed {
                context: self.context.clone(),
                reason: reason.to_string(),
            }));
        }
        self.closed.notify_waiters();
    }

    async fn write_line<T: Serialize>(&self, message: &T) -> Result<(), String> {
        let mut json =
            serde_json::to_string(message).map_err(|e| format!("failed to serialize: {e}"))?;
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| "stdin already closed".to_string())?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| format!("failed to write to stdin: {e}"))?;
        writer
            .flush()
            .await
            .map_err(|e| format!("failed to flush stdin: {e}"))
    }

    fn dispatch(self: &Arc<Self>, message: JsonRpcMessage) {
        match message.kind() {
            MessageKind::Response => {
                let Some(id) = message.id.as_ref().and_then(response_id) else {
                    tracing::debug!(
                        context = %self.context,
                        id = ?message.id,
                        "response with foreign id, dropping"
                    );
                    return;
                };
                if !self.resolve(id, extract_result(message)) {
                    tracing::debug!(
                        context = %self.context,
                        id,
                        "late response for retired request, dropping"
                    );
                }
            }
            MessageKind::Request => self.answer_server_request(message),
            MessageKind::Notification => self.handle_notification(&message),
            MessageKind::Invalid => {
                tracing::debug!(context = %self.context, "ignoring malformed JSON-RPC message");
            }
        }
    }

    /// Reply to a request initiated by the worker.
    ///
    /// Only `ping` is supported; the reply is written from its own task so the
    /// reader never blocks on stdin.
    fn answer_server_request(self: &Arc<Self>, message: JsonRpcMessage) {
        let id = message.id.unwrap_or(Value::Null);
        let method = message.method.unwrap_or_default();
        let response = if method == "ping" {
            JsonRpcResponse::success(id, serde_json::json!({}))
        } else {
            tracing::debug!(context = %self.context, method = %method, "unsupported server request");
            JsonRpcResponse::failure(
                id,
                JsonRpcError::new(
                    error_codes::METHOD_NOT_FOUND,
                    format!("method not supported by client: {method}"),
                ),
            )
        };

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(reason) = shared.write_line(&response).await {
                tracing::debug!(context = %shared.context, reason = %reason, "failed to answer server request");
            }
        });
    }

    fn handle_notification(&self, message: &JsonRpcMessage) {
        match message.method.as_deref() {
            Some("notifications/tools/list_changed") => {
                self.tools_epoch.fetch_add(1, Ordering::SeqCst);
                tracing::info!(context = %self.context, "worker tool list changed");
            }
            Some("notifications/message") => {
                tracing::debug!(
                    context = %self.context,
                    params = ?message.params,
                    "worker log message"
                );
            }
            Some(other) => {
                tracing::trace!(context = %self.context, method = other, "worker notification");
            }
            None => {}
        }
    }
}

/// Retires a pending request when the waiting call goes away, whether it
/// completed, timed out or was cancelled by its caller.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.shared.retire(self.id) {
            tracing::trace!(context = %self.shared.context, id = self.id, "retired pending request");
        }
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a worker's stdio.
pub struct StdioTransport {
    shared: Arc<Shared>,
    /// Correlation ids are per worker and never reused.
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a transport and start its background reader.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(context: &str, stdin: BoxedWriter, stdout: BoxedReader) -> Self {
        let shared = Arc::new(Shared {
            context: context.to_string(),
            pending: Mutex::new(PendingTable::default()),
            writer: tokio::sync::Mutex::new(Some(stdin)),
            closed: Notify::new(),
            tools_epoch: AtomicU64::new(0),
        });
        let reader = tokio::spawn(read_loop(Arc::clone(&shared), stdout));

        Self {
            shared,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// On timeout the request is retired locally; a late response for it is
    /// dropped by the reader.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.shared.register(id, method)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(reason) = self.shared.write_line(&request).await {
            // A broken stdin pipe means the process is gone.
            self.shared.close(&reason);
            return Err(McpError::WorkerCrashed {
                context: self.shared.context.clone(),
                reason,
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(McpError::WorkerCrashed {
                context: self.shared.context.clone(),
                reason: self
                    .close_reason()
                    .unwrap_or_else(|| "reply channel dropped".into()),
            }),
            Err(_) => {
                tracing::warn!(
                    context = %self.shared.context,
                    id,
                    method,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "request timed out"
                );
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        self.shared
            .write_line(&notification)
            .await
            .map_err(|reason| McpError::TransportError {
                context: self.shared.context.clone(),
                reason,
            })
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.table().entries.len()
    }

    /// Whether the worker's output stream has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.table().closed.is_some()
    }

    /// Why the stream closed, if it has.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.table().closed.clone()
    }

    /// Counter bumped whenever the worker announces a changed tool list.
    pub fn tools_epoch(&self) -> u64 {
        self.shared.tools_epoch.load(Ordering::SeqCst)
    }

    /// Close the worker's stdin, signalling it to exit.
    pub async fn close_stdin(&self) {
        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// Fail all pending requests and refuse new ones.
    pub fn fail_pending(&self, reason: &str) {
        self.shared.close(reason);
    }

    /// Resolves once the stream has closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.shared.closed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ─── Reader ──────────────────────────────────────────────────────────────────

async fn read_loop(shared: Arc<Shared>, stdout: BoxedReader) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    let reason = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break "stdout closed (process may have exited)".to_string(),
            Ok(_) => {}
            Err(e) => break format!("failed to read from stdout: {e}"),
        }

        let line = trim_ascii(&buf);
        if line.is_empty() {
            continue;
        }

        match serde_json::from_slice::<JsonRpcMessage>(line) {
            Ok(message) => shared.dispatch(message),
            Err(_) => {
                // Not JSON-RPC; servers sometimes log to stdout.
                tracing::debug!(
                    context = %shared.context,
                    line = %String::from_utf8_lossy(&line[..line.len().min(200)]),
                    "skipping non-JSON-RPC stdout line"
                );
            }
        }
    };

    tracing::debug!(context = %shared.context, reason = %reason, "worker stream closed");
    shared.close(&reason);
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Our requests always carry numeric ids; echoing peers sometimes stringify them.
fn response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcMessage) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::RemoteError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::RemoteError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
