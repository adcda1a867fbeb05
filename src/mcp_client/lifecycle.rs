//! Worker process lifecycle.
//!
//! Spawns a backend for a context, performs the MCP initialization
//! handshake and hands back a ready [`Worker`]. Launching goes through the
//! [`Launcher`] trait so the pool can be driven by in-process backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::{Child, Command};

use super::errors::McpError;
use super::transport::{BoxedReader, BoxedWriter};
use super::types::{InitializeResult, MCP_PROTOCOL_VERSION};
use super::worker::{Worker, WorkerState};
use crate::context::Context;

/// How long to wait for stderr after a failed handshake.
const STDERR_COLLECT_WAIT: Duration = Duration::from_millis(500);

/// Grace period when tearing down a worker whose handshake failed.
const FAILED_START_GRACE: Duration = Duration::from_secs(1);

// ─── Launching ───────────────────────────────────────────────────────────────

/// The stdio handles of a freshly started backend.
pub struct LaunchedProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    /// `None` for backends that are not OS processes.
    pub child: Option<Child>,
}

/// Starts the backend for a context.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, context: &Context) -> Result<LaunchedProcess, McpError>;
}

/// Launches the context's server template as a child process, with the
/// context's effective environment layered over the inherited one.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self, context: &Context) -> Result<LaunchedProcess, McpError> {
        let template = &context.template;
        let mut cmd = Command::new(&template.command);
        cmd.args(&template.args);
        cmd.envs(&context.env);

        if let Some(dir) = &template.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let spawn_failed = |reason: String| McpError::SpawnFailed {
            context: context.name.clone(),
            reason,
        };

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_failed(format!("{}: {e}", template.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("failed to capture stdout".into()))?;
        let stderr = child.stderr.take();

        tracing::info!(
            context = %context.name,
            server = %template.name,
            command = %template.command_line(),
            pid = child.id(),
            "spawned worker process"
        );

        Ok(LaunchedProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            child: Some(child),
        })
    }
}

// ─── Starting ────────────────────────────────────────────────────────────────

/// Launch a worker for `context` and complete the MCP handshake.
///
/// On handshake failure the process is torn down and its stderr tail is
/// attached to the error.
pub async fn start_worker(
    launcher: &dyn Launcher,
    context: &Context,
    handshake_timeout: Duration,
) -> Result<Arc<Worker>, McpError> {
    let launched = launcher.launch(context).await?;
    let worker = Arc::new(Worker::new(&context.name, launched));
    worker.transition(WorkerState::Handshaking);

    match initialize(&worker, handshake_timeout).await {
        Ok(()) => {
            worker.transition(WorkerState::Idle);
            let snapshot = worker.snapshot();
            tracing::info!(
                context = %context.name,
                instance = %snapshot.instance_id,
                pid = snapshot.pid,
                server = snapshot.server_name.as_deref().unwrap_or("unknown"),
                "worker ready"
            );
            Ok(worker)
        }
        Err(e) => {
            let stderr = worker.collect_stderr(STDERR_COLLECT_WAIT).await;
            if !stderr.is_empty() {
                tracing::warn!(
                    context = %context.name,
                    stderr = %stderr,
                    "worker stderr captured on failure"
                );
            }
            worker.shutdown(FAILED_START_GRACE).await;

            let reason = match e {
                McpError::Timeout { timeout_ms, .. } => {
                    format!("initialization timed out after {timeout_ms}ms")
                }
                other => other.to_string(),
            };
            Err(McpError::HandshakeFailed {
                context: context.name.clone(),
                reason: format!("{reason}{}", format_stderr_suffix(&stderr)),
            })
        }
    }
}

/// Perform the MCP initialization handshake.
async fn initialize(worker: &Worker, timeout: Duration) -> Result<(), McpError> {
    let params = json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    });
    let result = worker
        .transport()
        .request("initialize", Some(params), timeout)
        .await?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::HandshakeFailed {
            context: worker.context().to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(version) = init.protocol_version.as_deref() {
        if version != MCP_PROTOCOL_VERSION {
            tracing::debug!(
                context = %worker.context(),
                version,
                "worker negotiated a different protocol version"
            );
        }
    }
    worker.set_server_info(init.server_info);

    worker
        .transport()
        .notify("notifications/initialized", None)
        .await
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
