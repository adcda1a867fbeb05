//! Request relay: forwards calls to a leased worker and discovers its tools.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::errors::McpError;
use super::types::{ListToolsPage, RemoteTool};
use super::worker::Worker;

/// Upper bound on `tools/list` pages followed for one discovery.
const MAX_LIST_PAGES: usize = 100;

/// Forwards requests to workers with a per-call timeout.
#[derive(Debug, Clone)]
pub struct Relay {
    call_timeout: Duration,
}

impl Relay {
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }

    /// Send one request to `worker` and wait for its result.
    ///
    /// A timeout leaves the worker usable; a broken stream marks it dead so
    /// the pool replaces it on the next acquire.
    pub async fn send(
        &self,
        worker: &Worker,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        match worker
            .transport()
            .request(method, params, self.call_timeout)
            .await
        {
            Ok(value) => {
                worker.record_response();
                Ok(value)
            }
            Err(McpError::Timeout { method, timeout_ms }) => {
                let streak = worker.record_timeout();
                tracing::warn!(
                    context = %worker.context(),
                    method = %method,
                    timeout_ms,
                    consecutive = streak,
                    "worker call timed out"
                );
                Err(McpError::Timeout { method, timeout_ms })
            }
            Err(e @ McpError::RemoteError { .. }) => {
                worker.record_response();
                Err(e)
            }
            Err(e @ McpError::WorkerCrashed { .. }) => {
                worker.mark_dead();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Invoke a tool on `worker` through `tools/call`.
    pub async fn call_tool(
        &self,
        worker: &Worker,
        name: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        tracing::debug!(context = %worker.context(), tool = name, "relaying tool call");
        self.send(
            worker,
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// The worker's tool list, following pagination.
    ///
    /// Served from the worker's cache until it announces a change.
    pub async fn list_operations(&self, worker: &Worker) -> Result<Arc<Vec<RemoteTool>>, McpError> {
        if let Some(cached) = worker.cached_tools() {
            return Ok(cached);
        }

        // Read before fetching so a change announced mid-fetch invalidates it.
        let epoch = worker.transport().tools_epoch();
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.send(worker, "tools/list", params).await?;
            let page: ListToolsPage =
                serde_json::from_value(result).map_err(|e| McpError::TransportError {
                    context: worker.context().to_string(),
                    reason: format!("malformed tools/list result: {e}"),
                })?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => {
                    cursor = None;
                    break;
                }
            }
        }

        if cursor.is_some() {
            tracing::warn!(
                context = %worker.context(),
                pages = MAX_LIST_PAGES,
                "tools/list pagination did not terminate, using partial list"
            );
        }

        tracing::debug!(context = %worker.context(), count = tools.len(), "discovered worker tools");
        let tools = Arc::new(tools);
        worker.store_tools(epoch, Arc::clone(&tools));
        Ok(tools)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
