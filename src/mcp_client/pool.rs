//! Process pool: a bounded, LRU-evicting set of workers keyed by context.
//!
//! At most `capacity` workers are live at once. Acquiring a context that has
//! no worker either fills a free slot or evicts the least-recently-used idle
//! worker; a worker with a lease or with requests in flight is never evicted.
//! When every slot is busy the caller waits, up to `acquire_timeout`, for one
//! to free up.
//!
//! Pool bookkeeping sits behind a synchronous mutex that is never held across
//! an await. Spawning and shutting down workers happen outside it, with a
//! `Spawning` placeholder holding the slot in the meantime. A worker that
//! left the table but whose process is still being reaped keeps counting
//! against capacity until the reap finishes.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::errors::McpError;
use super::lifecycle::{start_worker, Launcher};
use super::types::RemoteTool;
use super::worker::{Worker, WorkerSnapshot};
use crate::config::PoolConfig;
use crate::context::Context;

// ─── Options ─────────────────────────────────────────────────────────────────

/// Sizing and timing knobs for a [`ProcessPool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub capacity: usize,
    pub acquire_timeout: Duration,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from_config(&PoolConfig::default())
    }
}

impl PoolOptions {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            capacity: config.max_processes,
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

enum Slot {
    /// Reserved while a worker is being started outside the lock.
    Spawning,
    Ready {
        worker: Arc<Worker>,
        /// Logical time of last use; the smallest idle tick is evicted first.
        tick: u64,
    },
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<String, Slot>,
    /// Workers removed from `slots` whose process has not been reaped yet.
    reaping: usize,
    clock: u64,
    closed: bool,
}

impl PoolState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Slots in use, counting processes still being reaped.
    fn occupied(&self) -> usize {
        self.slots.len() + self.reaping
    }
}

struct PoolShared {
    launcher: Arc<dyn Launcher>,
    options: PoolOptions,
    state: Mutex<PoolState>,
    /// Signalled whenever a slot frees up, a lease is returned or a spawn ends.
    changed: Notify,
}

enum Plan {
    Leased(WorkerLease),
    Spawn { victim: Option<Arc<Worker>> },
    WaitForSpawn,
    WaitForSlot,
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide how to satisfy an acquire for `name`, under the pool lock.
    fn plan(self: &Arc<Self>, name: &str) -> Result<Plan, McpError> {
        let mut state = self.state();
        if state.closed {
            return Err(McpError::PoolClosed);
        }
        self.purge_dead(&mut state);

        let tick = state.tick();
        match state.slots.get(name) {
            Some(Slot::Ready { worker, .. }) => {
                let worker = Arc::clone(worker);
                if worker.lease() {
                    if let Some(Slot::Ready { tick: used, .. }) = state.slots.get_mut(name) {
                        *used = tick;
                    }
                    tracing::debug!(context = name, instance = %worker.instance_id(), "reusing worker");
                    return Ok(Plan::Leased(WorkerLease {
                        worker,
                        pool: Arc::clone(self),
                    }));
                }
                // Died since the purge above.
                state.slots.remove(name);
                self.reap(&mut state, worker);
            }
            Some(Slot::Spawning) => return Ok(Plan::WaitForSpawn),
            None => {}
        }

        if state.occupied() < self.options.capacity {
            state.slots.insert(name.to_string(), Slot::Spawning);
            return Ok(Plan::Spawn { victim: None });
        }

        let victim = state
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready { worker, tick } if worker.is_idle() => Some((*tick, key.clone())),
                _ => None,
            })
            .min();

        match victim {
            Some((_, key)) => {
                let Some(Slot::Ready { worker, .. }) = state.slots.remove(&key) else {
                    return Ok(Plan::WaitForSlot);
                };
                state.slots.insert(name.to_string(), Slot::Spawning);
                tracing::info!(
                    evicted = %key,
                    instance = %worker.instance_id(),
                    incoming = name,
                    "evicting least recently used worker"
                );
                Ok(Plan::Spawn {
                    victim: Some(worker),
                })
            }
            None => Ok(Plan::WaitForSlot),
        }
    }

    /// Drop slots whose worker has exited, reaping them in the background.
    fn purge_dead(self: &Arc<Self>, state: &mut PoolState) {
        let dead: Vec<String> = state
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready { worker, .. } if !worker.is_alive() => Some(key.clone()),
                _ => None,
            })
            .collect();

        for key in dead {
            if let Some(Slot::Ready { worker, .. }) = state.slots.remove(&key) {
                tracing::warn!(
                    context = %key,
                    instance = %worker.instance_id(),
                    "removing dead worker from pool"
                );
                self.reap(state, worker);
            }
        }
    }

    /// Shut `worker` down in the background. Its slot stays counted in
    /// `reaping` until the process is gone.
    fn reap(self: &Arc<Self>, state: &mut PoolState, worker: Arc<Worker>) {
        state.reaping += 1;
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            worker.shutdown(shared.options.shutdown_grace).await;
            shared.state().reaping -= 1;
            tracing::debug!(
                context = %worker.context(),
                instance = %worker.instance_id(),
                "worker reaped"
            );
            shared.changed.notify_waiters();
        });
    }

    /// Put a freshly started worker into its reserved slot and lease it.
    fn install(
        self: &Arc<Self>,
        mut reservation: Reservation,
        worker: Arc<Worker>,
    ) -> Result<WorkerLease, McpError> {
        let mut state = self.state();
        if state.closed {
            reservation.armed = false;
            self.reap(&mut state, worker);
            return Err(McpError::PoolClosed);
        }

        worker.lease();
        let tick = state.tick();
        state.slots.insert(
            reservation.context.clone(),
            Slot::Ready {
                worker: Arc::clone(&worker),
                tick,
            },
        );
        reservation.armed = false;
        drop(state);

        self.watch(&worker);
        self.changed.notify_waiters();
        Ok(WorkerLease {
            worker,
            pool: Arc::clone(self),
        })
    }

    /// Remove the worker's slot as soon as its stream closes.
    fn watch(self: &Arc<Self>, worker: &Arc<Worker>) {
        let pool: Weak<PoolShared> = Arc::downgrade(self);
        let worker = Arc::clone(worker);
        tokio::spawn(async move {
            worker.transport().closed().await;
            worker.mark_dead();
            if let Some(pool) = pool.upgrade() {
                pool.forget(&worker);
            }
        });
    }

    /// Move the worker's slot to `reaping` once its stream has closed.
    fn forget(self: &Arc<Self>, worker: &Arc<Worker>) {
        let mut state = self.state();
        let same = matches!(
            state.slots.get(worker.context()),
            Some(Slot::Ready { worker: current, .. }) if Arc::ptr_eq(current, worker)
        );
        if same && state.slots.remove(worker.context()).is_some() {
            tracing::warn!(
                context = %worker.context(),
                instance = %worker.instance_id(),
                "worker stream closed, reaping process"
            );
            self.reap(&mut state, Arc::clone(worker));
        }
    }

    fn release(&self, worker: &Arc<Worker>) {
        let mut state = self.state();
        if worker.unlease() == 0 {
            let tick = state.tick();
            if let Some(Slot::Ready {
                worker: current,
                tick: used,
            }) = state.slots.get_mut(worker.context())
            {
                if Arc::ptr_eq(current, worker) {
                    *used = tick;
                }
            }
        }
        drop(state);
        self.changed.notify_waiters();
    }
}

/// Holds a `Spawning` slot; dropping it without installing a worker frees it.
struct Reservation {
    shared: Arc<PoolShared>,
    context: String,
    armed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.shared.state();
            if matches!(state.slots.get(&self.context), Some(Slot::Spawning)) {
                state.slots.remove(&self.context);
            }
        }
        self.shared.changed.notify_waiters();
    }
}

// ─── Lease ───────────────────────────────────────────────────────────────────

/// Exclusive-from-eviction access to a worker. Dropping it returns the worker
/// to the pool.
pub struct WorkerLease {
    worker: Arc<Worker>,
    pool: Arc<PoolShared>,
}

impl WorkerLease {
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Return the worker to the pool now.
    pub fn release(self) {}
}

impl Deref for WorkerLease {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        &self.worker
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.pool.release(&self.worker);
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WorkerLease").field(&self.worker).finish()
    }
}

// ─── Pool ────────────────────────────────────────────────────────────────────

/// Bounded pool of workers, at most one per context.
#[derive(Clone)]
pub struct ProcessPool {
    shared: Arc<PoolShared>,
}

impl ProcessPool {
    pub fn new(launcher: Arc<dyn Launcher>, options: PoolOptions) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                launcher,
                options,
                state: Mutex::new(PoolState::default()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.options.capacity
    }

    /// Lease the worker for `context`, starting one if needed.
    pub async fn acquire(&self, context: &Arc<Context>) -> Result<WorkerLease, McpError> {
        let started = Instant::now();
        let deadline = started + self.shared.options.acquire_timeout;

        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.shared.plan(&context.name)? {
                Plan::Leased(lease) => return Ok(lease),
                Plan::Spawn { victim } => return self.spawn(context, victim).await,
                Plan::WaitForSpawn => notified.await,
                Plan::WaitForSlot => {
                    tracing::debug!(context = %context.name, "all worker slots busy, waiting");
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let waited_ms =
                            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                        tracing::warn!(
                            context = %context.name,
                            capacity = self.capacity(),
                            waited_ms,
                            "worker pool exhausted"
                        );
                        return Err(McpError::PoolExhausted {
                            capacity: self.capacity(),
                            waited_ms,
                        });
                    }
                }
            }
        }
    }

    async fn spawn(
        &self,
        context: &Arc<Context>,
        victim: Option<Arc<Worker>>,
    ) -> Result<WorkerLease, McpError> {
        let reservation = Reservation {
            shared: Arc::clone(&self.shared),
            context: context.name.clone(),
            armed: true,
        };

        // The evicted process is gone before its replacement starts.
        if let Some(victim) = victim {
            victim.shutdown(self.shared.options.shutdown_grace).await;
        }

        let worker = start_worker(
            self.shared.launcher.as_ref(),
            context,
            self.shared.options.handshake_timeout,
        )
        .await?;
        self.shared.install(reservation, worker)
    }

    /// Snapshot of the worker bound to `context`, if one is loaded.
    pub fn snapshot(&self, context: &str) -> Option<WorkerSnapshot> {
        match self.shared.state().slots.get(context) {
            Some(Slot::Ready { worker, .. }) => Some(worker.snapshot()),
            _ => None,
        }
    }

    /// Tools the loaded worker for `context` has already reported, if any.
    pub fn cached_tools(&self, context: &str) -> Option<Arc<Vec<RemoteTool>>> {
        match self.shared.state().slots.get(context) {
            Some(Slot::Ready { worker, .. }) => worker.cached_tools(),
            _ => None,
        }
    }

    pub fn is_loaded(&self, context: &str) -> bool {
        matches!(
            self.shared.state().slots.get(context),
            Some(Slot::Ready { worker, .. }) if worker.is_alive()
        )
    }

    /// Contexts with a live worker, ordered by name.
    pub fn loaded_contexts(&self) -> Vec<String> {
        let state = self.shared.state();
        let mut names: Vec<String> = state
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready { worker, .. } if worker.is_alive() => Some(key.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    /// Live worker processes, including ones still being reaped.
    pub fn live_count(&self) -> usize {
        let reaping = self.shared.state().reaping;
        self.loaded_contexts().len() + reaping
    }

    /// Stop every worker and refuse further acquires. Safe to call twice.
    pub async fn shutdown(&self) {
        let workers: Vec<Arc<Worker>> = {
            let mut state = self.shared.state();
            state.closed = true;
            state
                .slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready { worker, .. } => Some(worker),
                    Slot::Spawning => None,
                })
                .collect()
        };
        self.shared.changed.notify_waiters();

        if !workers.is_empty() {
            tracing::info!(count = workers.len(), "shutting down workers");
            let grace = self.shared.options.shutdown_grace;
            futures::future::join_all(workers.iter().map(|w| w.shutdown(grace))).await;
        }

        // Background reaps finish within their own grace period.
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.state().reaping == 0 {
                return;
            }
            notified.await;
        }
    }

}

// ─── Tests ───────────────────────────────────────────────────────────────────
