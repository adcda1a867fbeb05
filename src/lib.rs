//! ctxrelay: an MCP proxy that serves many environment contexts through one
//! stable process.
//!
//! Each context binds a backend MCP server command to an environment
//! (credentials, region, cluster). The proxy keeps a bounded pool of backend
//! processes, one per context, and relays tool calls to the one for the
//! current context.

pub mod config;
pub mod context;
pub mod logging;
pub mod mcp_client;
pub mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;

use context::ContextSession;
use mcp_client::CommandLauncher;

/// Startup options collected by the binary.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit config path; otherwise the usual search order applies.
    pub config: Option<PathBuf>,
    /// Overrides `pool.max_processes` from the config file.
    pub max_processes: Option<usize>,
}

/// Load configuration, serve MCP on stdio until the client disconnects or
/// the process is interrupted, then stop every worker.
pub async fn run(options: RunOptions) -> anyhow::Result<()> {
    let (mut config, path) =
        config::load(options.config.as_deref()).context("failed to load configuration")?;
    if let Some(max) = options.max_processes {
        config.pool.max_processes = max;
    }

    let session = Arc::new(
        ContextSession::from_config(&config, Arc::new(CommandLauncher))
            .context("invalid configuration")?,
    );
    tracing::info!(
        config = %path.map(|p| p.display().to_string()).unwrap_or_else(|| "none".into()),
        contexts = session.registry().len(),
        current = session.current_context().as_deref().unwrap_or("none"),
        "serving on stdio"
    );

    let served = tokio::select! {
        result = server::serve(Arc::clone(&session), tokio::io::stdin(), tokio::io::stdout()) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(())
        }
    };

    session.shutdown().await;
    tracing::info!("=== ctxrelay stopped ===");
    served.context("stdio server failed")
}
