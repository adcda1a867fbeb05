//! In-process MCP backends for tests.
//!
//! [`MockLauncher`] hands out backends that run as tokio tasks over duplex
//! pipes. Each backend reports which context and which spawn it belongs to,
//! so tests can tell reuse from respawn and check environment isolation.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinSet;

use super::errors::McpError;
use super::lifecycle::{LaunchedProcess, Launcher};
use crate::config::ProxyConfig;
use crate::context::{Context, ContextRegistry};

/// Tools advertised per `tools/list` page.
const PAGE_SIZE: usize = 4;

/// Build a registry from YAML, panicking on invalid input.
pub(crate) fn registry(yaml: &str) -> ContextRegistry {
    ContextRegistry::from_config(&ProxyConfig::from_yaml(yaml).unwrap()).unwrap()
}

/// YAML declaring one mock-backed context per name, each with
/// `REGION=region-<name>`, and the first one current.
pub(crate) fn mock_yaml(names: &[&str]) -> String {
    let mut yaml = String::from(
        "defaults:\n  SHARED: from-defaults\nservers:\n  mock:\n    command: mock-mcp\ncontexts:\n",
    );
    for name in names {
        yaml.push_str(&format!(
            "  {name}:\n    server: mock\n    env:\n      REGION: region-{name}\n"
        ));
    }
    if let Some(first) = names.first() {
        yaml.push_str(&format!("current_context: {first}\n"));
    }
    yaml
}

pub(crate) fn mock_registry(names: &[&str]) -> ContextRegistry {
    registry(&mock_yaml(names))
}

/// One call to [`MockLauncher::launch`].
#[derive(Debug, Clone)]
pub(crate) struct SpawnRecord {
    pub context: String,
    pub env: BTreeMap<String, String>,
    /// 1-based launch sequence number across the launcher.
    pub ordinal: usize,
}

#[derive(Default)]
struct MockState {
    spawns: Mutex<Vec<SpawnRecord>>,
    live: AtomicUsize,
    peak: AtomicUsize,
    fail_launch: Mutex<HashSet<String>>,
    fail_handshake: Mutex<HashSet<String>>,
    hang_handshake: Mutex<HashSet<String>>,
    launch_delay: Mutex<Duration>,
}

/// A [`Launcher`] backed by in-process fake servers.
#[derive(Clone, Default)]
pub(crate) struct MockLauncher {
    state: Arc<MockState>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_launch_for(&self, context: &str) {
        self.state.fail_launch.lock().unwrap().insert(context.into());
    }

    pub fn allow_launch_for(&self, context: &str) {
        self.state.fail_launch.lock().unwrap().remove(context);
    }

    pub fn fail_handshake_for(&self, context: &str) {
        self.state.fail_handshake.lock().unwrap().insert(context.into());
    }

    pub fn hang_handshake_for(&self, context: &str) {
        self.state.hang_handshake.lock().unwrap().insert(context.into());
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        *self.state.launch_delay.lock().unwrap() = delay;
    }

    pub fn spawns(&self) -> Vec<SpawnRecord> {
        self.state.spawns.lock().unwrap().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.state.spawns.lock().unwrap().len()
    }

    pub fn spawns_for(&self, context: &str) -> usize {
        self.spawns().iter().filter(|s| s.context == context).count()
    }

    /// Backends currently running.
    pub fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Highest number of backends ever running at once.
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(&self, context: &Context) -> Result<LaunchedProcess, McpError> {
        if self.state.fail_launch.lock().unwrap().contains(&context.name) {
            return Err(McpError::SpawnFailed {
                context: context.name.clone(),
                reason: "mock launch refused".into(),
            });
        }

        let delay = *self.state.launch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let ordinal = {
            let mut spawns = self.state.spawns.lock().unwrap();
            let ordinal = spawns.len() + 1;
            spawns.push(SpawnRecord {
                context: context.name.clone(),
                env: context.env.clone(),
                ordinal,
            });
            ordinal
        };

        let handshake = if self.state.hang_handshake.lock().unwrap().contains(&context.name) {
            Handshake::Hang
        } else if self.state.fail_handshake.lock().unwrap().contains(&context.name) {
            Handshake::Fail
        } else {
            Handshake::Normal
        };

        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(live, Ordering::SeqCst);

        let (client_w, backend_r) = tokio::io::duplex(64 * 1024);
        let (backend_w, client_r) = tokio::io::duplex(64 * 1024);
        let backend = Arc::new(Backend {
            context: context.name.clone(),
            ordinal,
            region: context.env.get("REGION").cloned(),
            handshake,
            extra_tools: AtomicBool::new(false),
        });
        let guard = LiveGuard(Arc::clone(&self.state));
        tokio::spawn(run_backend(backend, backend_r, backend_w, guard));

        Ok(LaunchedProcess {
            stdin: Box::new(client_w),
            stdout: Box::new(client_r),
            stderr: None,
            child: None,
        })
    }
}

struct LiveGuard(Arc<MockState>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ─── Backend ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Handshake {
    Normal,
    Fail,
    Hang,
}

struct Backend {
    context: String,
    ordinal: usize,
    region: Option<String>,
    handshake: Handshake,
    extra_tools: AtomicBool,
}

type Writer = Arc<tokio::sync::Mutex<DuplexStream>>;
type CallResult = Result<Value, (i64, String)>;

impl Backend {
    fn tool_names(&self) -> Vec<&'static str> {
        let mut names = vec!["whoami", "sleep", "never", "crash", "fail", "touch_tools"];
        if self.extra_tools.load(Ordering::SeqCst) {
            names.push("extra");
        }
        names
    }

    fn list_page(&self, cursor: Option<&str>) -> Value {
        let names = self.tool_names();
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let end = (start + PAGE_SIZE).min(names.len());
        let tools: Vec<Value> = names[start.min(end)..end]
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "description": format!("mock {name}"),
                    "inputSchema": {"type": "object"}
                })
            })
            .collect();
        let mut page = json!({ "tools": tools });
        if end < names.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }

    async fn call(&self, name: &str, args: &Value, writer: &Writer) -> CallResult {
        match name {
            "whoami" => {
                let identity = json!({
                    "context": self.context,
                    "ordinal": self.ordinal,
                    "region": self.region,
                });
                Ok(json!({
                    "content": [{"type": "text", "text": identity.to_string()}],
                    "structuredContent": identity,
                }))
            }
            "sleep" => {
                let ms = args["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(text(&format!("slept {ms}ms in {}", self.context)))
            }
            "never" => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            "fail" => Err((-32000, format!("backend failure in {}", self.context))),
            "touch_tools" => {
                self.extra_tools.store(true, Ordering::SeqCst);
                write_json(
                    writer,
                    &json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}),
                )
                .await;
                Ok(text("touched"))
            }
            "extra" => Ok(text("extra")),
            other => Err((-32602, format!("unknown tool: {other}"))),
        }
    }
}

fn text(s: &str) -> Value {
    json!({"content": [{"type": "text", "text": s}]})
}

async fn write_json(writer: &Writer, value: &Value) {
    let mut line = value.to_string();
    line.push('\n');
    let _ = writer.lock().await.write_all(line.as_bytes()).await;
}

async fn reply(writer: &Writer, id: Value, result: CallResult) {
    let message = match result {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => {
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        }
    };
    write_json(writer, &message).await;
}

async fn run_backend(
    backend: Arc<Backend>,
    requests: DuplexStream,
    responses: DuplexStream,
    live: LiveGuard,
) {
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(responses));
    let mut lines = BufReader::new(requests).lines();
    let mut tasks = JoinSet::new();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let method = message["method"].as_str().unwrap_or_default();

        match method {
            "initialize" => match backend.handshake {
                Handshake::Normal => {
                    let result = json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {"tools": {"listChanged": true}},
                        "serverInfo": {"name": "mock-backend", "version": "0.0.1"}
                    });
                    reply(&writer, id, Ok(result)).await;
                }
                Handshake::Fail => {
                    reply(&writer, id, Err((-32603, "credentials rejected".into()))).await;
                }
                Handshake::Hang => {}
            },
            "tools/list" => {
                let page = backend.list_page(message["params"]["cursor"].as_str());
                reply(&writer, id, Ok(page)).await;
            }
            "tools/call" => {
                let name = message["params"]["name"].as_str().unwrap_or_default().to_string();
                if name == "crash" {
                    break;
                }
                let args = message["params"]["arguments"].clone();
                let backend = Arc::clone(&backend);
                let writer = Arc::clone(&writer);
                tasks.spawn(async move {
                    let result = backend.call(&name, &args, &writer).await;
                    reply(&writer, id, result).await;
                });
            }
            "ping" => reply(&writer, id, Ok(json!({}))).await,
            other => {
                reply(&writer, id, Err((-32601, format!("method not found: {other}")))).await;
            }
        }
    }

    tasks.shutdown().await;
    // Count the backend as gone before the client sees end-of-stream.
    drop(live);
    drop(writer);
}
