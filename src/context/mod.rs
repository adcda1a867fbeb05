//! Contexts: the validated registry of named environments and the session
//! that tracks which one is current.

pub mod errors;
pub mod registry;
pub mod session;

pub use errors::ContextError;
pub use registry::{Context, ContextRegistry, ServerTemplate};
pub use session::{ContextSession, ContextSummary, CurrentContext, SwitchOutcome};
