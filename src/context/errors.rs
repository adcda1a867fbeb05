//! Context session error types.

use thiserror::Error;

use crate::mcp_client::McpError;

/// Errors surfaced by context-level operations.
#[derive(Debug, Error)]
pub enum ContextError {
    /// No context of that name is configured.
    #[error("unknown context '{name}' (available: {})", available.join(", "))]
    NotFound {
        name: String,
        available: Vec<String>,
    },

    /// No context has been selected yet.
    #[error("no active context; call switch_context first")]
    NoActiveContext,

    /// Pool or relay failure while serving the current context.
    #[error(transparent)]
    Mcp(#[from] McpError),
}
