//! MCP Client: JSON-RPC over stdio to per-context backend workers.
//!
//! This module handles:
//! - Spawning backend processes with a context's environment
//! - JSON-RPC 2.0 communication over process stdio, multiplexed by request id
//! - A bounded pool of workers with LRU eviction of idle ones
//! - Relaying tool calls and discovering each worker's tools
//! - Worker lifecycle (handshake, crash detection, graceful shutdown)

pub mod errors;
pub mod lifecycle;
pub mod pool;
pub mod relay;
pub mod transport;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use errors::McpError;
pub use lifecycle::{CommandLauncher, LaunchedProcess, Launcher};
pub use pool::{PoolOptions, ProcessPool, WorkerLease};
pub use relay::Relay;
pub use types::RemoteTool;
pub use worker::{Worker, WorkerSnapshot, WorkerState};
