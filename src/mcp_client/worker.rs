//! Worker: one backend process bound to a context.
//!
//! A worker owns the child process, its JSON-RPC transport, a tail of its
//! stderr and the bookkeeping the pool needs for LRU eviction. Its state
//! moves through `Spawning → Handshaking → Idle ⇄ Busy → Dead`; only the
//! pool, the relay and the lifecycle code drive those transitions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::lifecycle::LaunchedProcess;
use super::transport::{BoxedReader, StdioTransport};
use super::types::{RemoteTool, ServerInfo};

/// Stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 40;

/// Longest stderr excerpt attached to an error message.
const STDERR_EXCERPT_CHARS: usize = 2000;

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Handshaking,
    Idle,
    Busy,
    Dead,
}

impl WorkerState {
    fn can_become(self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            (Dead, _) => false,
            (_, Dead) => true,
            (Spawning, Handshaking) | (Handshaking, Idle) | (Idle, Busy) | (Busy, Idle) => true,
            _ => false,
        }
    }
}

struct Status {
    state: WorkerState,
    leases: usize,
    last_used: DateTime<Utc>,
    server_info: Option<ServerInfo>,
}

struct CachedTools {
    epoch: u64,
    tools: Arc<Vec<RemoteTool>>,
}

/// Point-in-time view of a worker, safe to hand to callers.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub context: String,
    pub instance_id: Uuid,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub last_used: DateTime<Utc>,
    pub leases: usize,
    pub pending_requests: usize,
    pub consecutive_timeouts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
}

// ─── Worker ──────────────────────────────────────────────────────────────────

/// A spawned backend process plus its transport.
pub struct Worker {
    context: String,
    instance_id: Uuid,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    started: Instant,
    transport: StdioTransport,
    process: tokio::sync::Mutex<Option<Child>>,
    status: Mutex<Status>,
    consecutive_timeouts: AtomicU32,
    tools: Mutex<Option<CachedTools>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_drain: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Wrap a freshly launched process. The worker starts in `Spawning`.
    pub(crate) fn new(context: &str, launched: LaunchedProcess) -> Self {
        let LaunchedProcess {
            stdin,
            stdout,
            stderr,
            child,
        } = launched;

        let pid = child.as_ref().and_then(Child::id);
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_drain = stderr.map(|stream| {
            tokio::spawn(drain_stderr(
                context.to_string(),
                stream,
                Arc::clone(&stderr_tail),
            ))
        });

        Self {
            context: context.to_string(),
            instance_id: Uuid::new_v4(),
            pid,
            started_at: Utc::now(),
            started: Instant::now(),
            transport: StdioTransport::new(context, stdin, stdout),
            process: tokio::sync::Mutex::new(child),
            status: Mutex::new(Status {
                state: WorkerState::Spawning,
                leases: 0,
                last_used: Utc::now(),
                server_info: None,
            }),
            consecutive_timeouts: AtomicU32::new(0),
            tools: Mutex::new(None),
            stderr_tail,
            stderr_drain: Mutex::new(stderr_drain),
        }
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Identity of this process instance; changes on every respawn.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn transport(&self) -> &StdioTransport {
        &self.transport
    }

    pub fn state(&self) -> WorkerState {
        self.status().state
    }

    pub fn leases(&self) -> usize {
        self.status().leases
    }

    pub fn pending_count(&self) -> usize {
        self.transport.pending_count()
    }

    // ─── Transitions ─────────────────────────────────────────────────────

    /// Move to `next` if the state machine allows it.
    pub(crate) fn transition(&self, next: WorkerState) -> bool {
        let mut status = self.status();
        let current = status.state;
        if current == next {
            return true;
        }
        if !current.can_become(next) {
            tracing::debug!(
                context = %self.context,
                from = ?current,
                to = ?next,
                "rejected worker state transition"
            );
            return false;
        }
        status.state = next;
        tracing::trace!(context = %self.context, from = ?current, to = ?next, "worker state");
        true
    }

    pub(crate) fn set_server_info(&self, info: Option<ServerInfo>) {
        self.status().server_info = info;
    }

    /// Take a lease: `Idle`/`Busy` → `Busy`. Fails on a worker that is not ready.
    pub(crate) fn lease(&self) -> bool {
        let mut status = self.status();
        match status.state {
            WorkerState::Idle | WorkerState::Busy => {
                status.state = WorkerState::Busy;
                status.leases += 1;
                true
            }
            _ => false,
        }
    }

    /// Return a lease; the last one out stamps `last_used` and goes `Idle`.
    ///
    /// Returns the number of leases still held.
    pub(crate) fn unlease(&self) -> usize {
        let mut status = self.status();
        status.leases = status.leases.saturating_sub(1);
        if status.leases == 0 {
            status.last_used = Utc::now();
            if status.state == WorkerState::Busy {
                status.state = WorkerState::Idle;
            }
        }
        status.leases
    }

    /// Check liveness, moving to `Dead` when the stream closed or the
    /// process has exited.
    pub fn is_alive(&self) -> bool {
        if self.state() == WorkerState::Dead {
            return false;
        }

        let exited = self.transport.is_closed()
            || self
                .process
                .try_lock()
                .ok()
                .and_then(|mut guard| guard.as_mut().map(|c| matches!(c.try_wait(), Ok(Some(_)))))
                .unwrap_or(false);

        if exited {
            self.mark_dead();
            return false;
        }
        true
    }

    pub(crate) fn mark_dead(&self) {
        if self.transition(WorkerState::Dead) {
            let reason = self
                .transport
                .close_reason()
                .unwrap_or_else(|| "process exited".into());
            tracing::info!(
                context = %self.context,
                instance = %self.instance_id,
                reason = %reason,
                "worker marked dead"
            );
        }
    }

    /// Alive, unleased and with nothing in flight: safe to evict.
    pub fn is_idle(&self) -> bool {
        self.is_alive() && self.state() == WorkerState::Idle && self.pending_count() == 0
    }

    // ─── Timeouts ────────────────────────────────────────────────────────

    /// Count a timed-out call. Returns the running streak.
    pub(crate) fn record_timeout(&self) -> u32 {
        self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_response(&self) {
        self.consecutive_timeouts.store(0, Ordering::Relaxed);
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::Relaxed)
    }

    // ─── Discovery cache ─────────────────────────────────────────────────

    /// Cached tool list, unless the worker announced a change since.
    pub(crate) fn cached_tools(&self) -> Option<Arc<Vec<RemoteTool>>> {
        let cache = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .as_ref()
            .filter(|c| c.epoch == self.transport.tools_epoch())
            .map(|c| Arc::clone(&c.tools))
    }

    pub(crate) fn store_tools(&self, epoch: u64, tools: Arc<Vec<RemoteTool>>) {
        *self.tools.lock().unwrap_or_else(|e| e.into_inner()) = Some(CachedTools { epoch, tools });
    }

    // ─── Diagnostics ─────────────────────────────────────────────────────

    /// The captured stderr tail, truncated for error messages.
    pub fn stderr_excerpt(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        let mut text = tail.iter().cloned().collect::<Vec<_>>().join("\n");
        if text.len() > STDERR_EXCERPT_CHARS {
            let cut = text
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|&i| i <= STDERR_EXCERPT_CHARS)
                .last()
                .unwrap_or(0);
            text.truncate(cut);
            text.push_str("...(truncated)");
        }
        text
    }

    /// Wait briefly for the stderr drain to finish, then return the excerpt.
    pub(crate) async fn collect_stderr(&self, wait: Duration) -> String {
        let handle = self
            .stderr_drain
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(wait, handle).await;
        }
        self.stderr_excerpt()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let status = self.status();
        let info = status.server_info.clone();
        WorkerSnapshot {
            context: self.context.clone(),
            instance_id: self.instance_id,
            pid: self.pid,
            state: status.state,
            started_at: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
            last_used: status.last_used,
            leases: status.leases,
            pending_requests: self.transport.pending_count(),
            consecutive_timeouts: self.consecutive_timeouts(),
            server_name: info.as_ref().and_then(|i| i.name.clone()),
            server_version: info.and_then(|i| i.version),
        }
    }

    // ─── Shutdown ────────────────────────────────────────────────────────

    /// Stop the worker: close stdin, give it `grace` to exit, then kill and
    /// reap it. Anything still pending fails.
    pub async fn shutdown(&self, grace: Duration) {
        self.transition(WorkerState::Dead);
        self.transport.close_stdin().await;

        let child = self.process.lock().await.take();
        match child {
            Some(mut child) => match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(
                        context = %self.context,
                        instance = %self.instance_id,
                        status = %status,
                        "worker exited"
                    );
                }
                _ => {
                    tracing::warn!(
                        context = %self.context,
                        instance = %self.instance_id,
                        grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                        "worker did not exit after stdin close, killing"
                    );
                    // `kill` also waits, so the process is reaped.
                    if let Err(e) = child.kill().await {
                        tracing::error!(context = %self.context, error = %e, "failed to kill worker");
                    }
                }
            },
            None => {
                if tokio::time::timeout(grace, self.transport.closed())
                    .await
                    .is_err()
                {
                    tracing::warn!(context = %self.context, "worker stream still open after grace period");
                }
            }
        }

        self.transport.fail_pending("worker shut down");
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("context", &self.context)
            .field("instance_id", &self.instance_id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

async fn drain_stderr(context: String, stderr: BoxedReader, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "ctxrelay::worker_stderr", context = %context, "{line}");
        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
