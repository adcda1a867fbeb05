//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur while managing workers and relaying requests.
#[derive(Debug, Error)]
pub enum McpError {
    /// A worker process failed to start.
    #[error("failed to spawn worker for context '{context}': {reason}")]
    SpawnFailed {
        context: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("worker for context '{context}' failed the initialize handshake: {reason}")]
    HandshakeFailed {
        context: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for context '{context}': {reason}")]
    TransportError {
        context: String,
        reason: String,
    },

    /// The backend returned a JSON-RPC error response.
    #[error("remote error [{code}]: {message}")]
    RemoteError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No matching response arrived within the per-call timeout.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// The worker process exited while requests were outstanding.
    #[error("worker for context '{context}' crashed: {reason}")]
    WorkerCrashed {
        context: String,
        reason: String,
    },

    /// Every pool slot stayed busy for the whole acquire wait.
    #[error("all {capacity} worker slots busy; gave up after {waited_ms}ms")]
    PoolExhausted {
        capacity: usize,
        waited_ms: u64,
    },

    /// The pool has been shut down.
    #[error("process pool is shut down")]
    PoolClosed,
}
