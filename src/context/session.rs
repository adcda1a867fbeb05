//! Context session: the current context plus the operations the outward
//! tool surface calls through to.
//!
//! Switching only changes which name the session resolves to; workers are
//! acquired lazily by the operations that need one. Each operation reads
//! the current context once, when it starts.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::errors::ContextError;
use super::registry::{Context, ContextRegistry};
use crate::config::{ConfigError, ProxyConfig};
use crate::mcp_client::{Launcher, PoolOptions, ProcessPool, Relay, RemoteTool, WorkerSnapshot};

// ─── Views ───────────────────────────────────────────────────────────────────

/// One entry of `list_contexts`.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSummary {
    pub name: String,
    pub server: String,
    pub command: String,
    /// The context's own overrides (defaults are not repeated here).
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub active: bool,
    /// Whether a worker for this context is currently pooled.
    pub loaded: bool,
}

/// Result of `get_current_context`.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentContext {
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Present only when a worker is already running; never spawns one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerSnapshot>,
    /// Filled from the worker's discovery cache once tools have been listed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_available: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of `switch_context`.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchOutcome {
    pub context: String,
    pub previous: Option<String>,
    pub server: String,
    pub changed: bool,
    /// Whether a worker is already pooled; otherwise the next call starts one.
    pub loaded: bool,
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// The orchestration surface over the registry, pool and relay.
pub struct ContextSession {
    registry: Arc<ContextRegistry>,
    pool: ProcessPool,
    relay: Relay,
    current: RwLock<Option<String>>,
}

impl ContextSession {
    /// Build a session starting at the registry's declared default context.
    pub fn new(registry: Arc<ContextRegistry>, pool: ProcessPool, relay: Relay) -> Self {
        let current = registry.default_context().map(str::to_string);
        Self {
            registry,
            pool,
            relay,
            current: RwLock::new(current),
        }
    }

    /// Validate `config` and wire a session around `launcher`.
    ///
    /// Fails before any process is spawned when the configuration is
    /// inconsistent.
    pub fn from_config(
        config: &ProxyConfig,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self, ConfigError> {
        let registry = ContextRegistry::from_config(config)?;

        let pool_config = &config.pool;
        if pool_config.max_processes == 0 {
            return Err(ConfigError::Invalid {
                reason: "pool.max_processes must be at least 1".into(),
            });
        }
        if pool_config.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                reason: "pool.call_timeout_secs must be at least 1".into(),
            });
        }

        tracing::info!(
            contexts = registry.len(),
            default = registry.default_context().unwrap_or("none"),
            max_processes = pool_config.max_processes,
            "context session ready"
        );

        Ok(Self::new(
            Arc::new(registry),
            ProcessPool::new(launcher, PoolOptions::from_config(pool_config)),
            Relay::new(Duration::from_secs(pool_config.call_timeout_secs)),
        ))
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &ProcessPool {
        &self.pool
    }

    /// Name of the current context, if one is selected.
    pub fn current_context(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn current(&self) -> Result<Arc<Context>, ContextError> {
        let name = self.current_context().ok_or(ContextError::NoActiveContext)?;
        self.registry.resolve(&name)
    }

    // ─── Operations ──────────────────────────────────────────────────────

    /// All configured contexts, ordered by name.
    pub fn list_contexts(&self) -> Vec<ContextSummary> {
        let current = self.current_context();
        self.registry
            .list()
            .into_iter()
            .map(|ctx| ContextSummary {
                name: ctx.name.clone(),
                server: ctx.template.name.clone(),
                command: ctx.template.command_line(),
                env: ctx.overrides.clone(),
                description: ctx.description.clone(),
                active: current.as_deref() == Some(ctx.name.as_str()),
                loaded: self.pool.is_loaded(&ctx.name),
            })
            .collect()
    }

    /// Describe the current context without starting a worker for it.
    pub fn get_current_context(&self) -> CurrentContext {
        let Some(name) = self.current_context() else {
            return CurrentContext {
                context: None,
                server: None,
                description: None,
                env: BTreeMap::new(),
                worker: None,
                tools_available: None,
                tool_names: None,
                message: Some("no context active".into()),
            };
        };

        let ctx = self.registry.resolve(&name).ok();
        let worker = self.pool.snapshot(&name);
        let tool_names: Option<Vec<String>> = self
            .pool
            .cached_tools(&name)
            .map(|tools| tools.iter().map(|t| t.name.clone()).collect());
        let message = worker
            .is_none()
            .then(|| "no worker running; the next call starts one".to_string());

        CurrentContext {
            server: ctx.as_ref().map(|c| c.template.name.clone()),
            description: ctx.as_ref().and_then(|c| c.description.clone()),
            env: ctx.map(|c| c.overrides.clone()).unwrap_or_default(),
            context: Some(name),
            worker,
            tools_available: tool_names.as_ref().map(Vec::len),
            tool_names,
            message,
        }
    }

    /// Make `name` the current context. Does not start a worker.
    pub fn switch_context(&self, name: &str) -> Result<SwitchOutcome, ContextError> {
        let ctx = self.registry.resolve(name)?;

        let previous = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            current.replace(name.to_string())
        };
        let changed = previous.as_deref() != Some(name);
        if changed {
            tracing::info!(
                from = previous.as_deref().unwrap_or("none"),
                to = name,
                "switched context"
            );
        }

        Ok(SwitchOutcome {
            context: name.to_string(),
            previous,
            server: ctx.template.name.clone(),
            changed,
            loaded: self.pool.is_loaded(name),
        })
    }

    /// Tools advertised by the current context's backend.
    pub async fn list_proxied_tools(&self) -> Result<Arc<Vec<RemoteTool>>, ContextError> {
        let ctx = self.current()?;
        let lease = self.pool.acquire(&ctx).await?;
        Ok(self.relay.list_operations(&lease).await?)
    }

    /// Invoke `tool_name` on the current context's backend.
    ///
    /// The lease is released when this returns, whatever the outcome.
    pub async fn proxy_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, ContextError> {
        let ctx = self.current()?;
        let lease = self.pool.acquire(&ctx).await?;
        tracing::debug!(context = %ctx.name, tool = tool_name, "proxying tool call");
        Ok(self.relay.call_tool(&lease, tool_name, arguments).await?)
    }

    /// Stop all workers.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
