//! Outward MCP server over the proxy's own stdio.
//!
//! Reads newline-delimited JSON-RPC from `input`, handles each request on its
//! own task and writes responses through one shared writer. A request named
//! by `notifications/cancelled` has its task aborted and gets no response.
//! Returns once the input ends and every remaining request has been answered.

pub mod tools;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinError, JoinSet};

use crate::context::ContextSession;
use crate::mcp_client::types::{
    error_codes, JsonRpcError, JsonRpcMessage, JsonRpcResponse, MessageKind, MCP_PROTOCOL_VERSION,
};

/// Protocol revisions the proxy accepts from clients.
const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

type SharedWriter<W> = Arc<Mutex<W>>;

/// Serve MCP requests until `input` reaches end-of-stream.
pub async fn serve<R, W>(
    session: Arc<ContextSession>,
    input: R,
    output: W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer: SharedWriter<W> = Arc::new(Mutex::new(output));
    let mut lines = BufReader::new(input).lines();
    let mut tasks = JoinSet::new();
    // Request id (as JSON text) -> handler task, for cancellation.
    let mut in_flight: HashMap<String, AbortHandle> = HashMap::new();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match handle_line(&session, &line) {
                    Some(Inbound::Reply { request, pending }) => {
                        let handle = tasks.spawn(respond(Arc::clone(&writer), pending));
                        if let Some(request) = request {
                            in_flight.insert(request, handle);
                        }
                    }
                    Some(Inbound::Cancel { request }) => match in_flight.remove(&request) {
                        Some(handle) => {
                            tracing::debug!(request = %request, "client cancelled request, aborting");
                            handle.abort();
                        }
                        None => tracing::debug!(request = %request, "cancel for unknown or finished request"),
                    },
                    None => {}
                },
                Ok(None) => {
                    tracing::info!(in_flight = tasks.len(), "client closed input");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to read from client");
                    break;
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                log_join(joined);
                in_flight.retain(|_, handle| !handle.is_finished());
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        log_join(joined);
    }
    let flushed = writer.lock().await.flush().await;
    flushed
}

fn log_join(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!(error = %e, "request handler failed"),
    }
}

type PendingResponse = Pin<Box<dyn Future<Output = JsonRpcResponse> + Send + 'static>>;

/// What one input line asks the serve loop to do.
enum Inbound {
    /// Run `pending` and write its response. `request` is the id key used
    /// for cancellation, absent for replies to malformed input.
    Reply {
        request: Option<String>,
        pending: PendingResponse,
    },
    /// Abort the request with this id key.
    Cancel { request: String },
}

impl Inbound {
    fn immediate(response: JsonRpcResponse) -> Self {
        Inbound::Reply {
            request: None,
            pending: Box::pin(async move { response }),
        }
    }
}

/// Key under which a request id is tracked; `1` and `"1"` stay distinct.
fn request_key(id: &Value) -> String {
    id.to_string()
}

/// Classify one input line.
fn handle_line(session: &Arc<ContextSession>, line: &str) -> Option<Inbound> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let message = match serde_json::from_str::<JsonRpcMessage>(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable message from client");
            return Some(Inbound::immediate(JsonRpcResponse::failure(
                Value::Null,
                JsonRpcError::new(error_codes::PARSE_ERROR, format!("parse error: {e}")),
            )));
        }
    };

    match message.kind() {
        MessageKind::Request => {
            let id = message.id.unwrap_or(Value::Null);
            let request = request_key(&id);
            let method = message.method.unwrap_or_default();
            let params = message.params.unwrap_or(Value::Null);
            let session = Arc::clone(session);
            Some(Inbound::Reply {
                request: Some(request),
                pending: Box::pin(async move {
                    match handle_request(&session, &method, params).await {
                        Ok(result) => JsonRpcResponse::success(id, result),
                        Err(error) => {
                            tracing::debug!(method = %method, code = error.code, "request failed");
                            JsonRpcResponse::failure(id, error)
                        }
                    }
                }),
            })
        }
        MessageKind::Notification => {
            handle_notification(message.method.as_deref().unwrap_or_default(), &message.params)
                .map(|request| Inbound::Cancel { request })
        }
        MessageKind::Response => {
            tracing::debug!(id = ?message.id, "ignoring response from client");
            None
        }
        MessageKind::Invalid => {
            Some(Inbound::immediate(JsonRpcResponse::failure(
                message.id.unwrap_or(Value::Null),
                JsonRpcError::new(error_codes::INVALID_REQUEST, "invalid request"),
            )))
        }
    }
}

async fn respond<W>(writer: SharedWriter<W>, pending: PendingResponse)
where
    W: AsyncWrite + Unpin,
{
    let response = pending.await;
    if let Err(e) = write_message(&writer, &response).await {
        tracing::error!(error = %e, "failed to write response");
    }
}

async fn write_message<W, T>(writer: &SharedWriter<W>, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn handle_request(
    session: &ContextSession,
    method: &str,
    params: Value,
) -> Result<Value, JsonRpcError> {
    match method {
        "initialize" => {
            let requested = params["protocolVersion"].as_str().unwrap_or_default();
            let version = if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested) {
                requested
            } else {
                MCP_PROTOCOL_VERSION
            };
            tracing::info!(
                client = params["clientInfo"]["name"].as_str().unwrap_or("unknown"),
                protocol = version,
                "client initialized"
            );
            Ok(json!({
                "protocolVersion": version,
                "capabilities": {"tools": {"listChanged": false}},
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }))
        }
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tools::definitions() })),
        "tools/call" => {
            let name = params["name"].as_str().ok_or_else(|| {
                JsonRpcError::new(error_codes::INVALID_PARAMS, "missing tool name")
            })?;
            let arguments = match params.get("arguments") {
                Some(Value::Null) | None => json!({}),
                Some(args) => args.clone(),
            };
            tracing::debug!(tool = name, "tools/call");
            tools::dispatch(session, name, arguments).await
        }
        other => Err(JsonRpcError::new(
            error_codes::METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        )),
    }
}

/// Log a client notification; a cancellation yields the id key to abort.
fn handle_notification(method: &str, params: &Option<Value>) -> Option<String> {
    match method {
        "notifications/initialized" => {
            tracing::debug!("client finished initialization");
            None
        }
        "notifications/cancelled" => {
            let request = params.as_ref().and_then(|p| p.get("requestId"));
            match request {
                Some(id) if !id.is_null() => {
                    tracing::debug!(
                        request = %id,
                        reason = params.as_ref().and_then(|p| p["reason"].as_str()).unwrap_or(""),
                        "client cancelled a request"
                    );
                    Some(request_key(id))
                }
                _ => {
                    tracing::warn!(params = ?params, "cancellation without requestId");
                    None
                }
            }
        }
        other => {
            tracing::trace!(method = other, "ignoring client notification");
            None
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::mcp_client::test_support::{mock_yaml, MockLauncher};
    use std::time::Duration;
    use tokio::io::{DuplexStream, Lines};
    use tokio::task::JoinHandle;

    struct Client {
        writer: DuplexStream,
        reader: Lines<BufReader<DuplexStream>>,
    }

    impl Client {
        async fn send(&mut self, message: Value) {
            self.send_raw(&message.to_string()).await;
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.reader.next_line())
                .await
                .expect("response timed out")
                .unwrap()
                .expect("server closed output");
            serde_json::from_str(&line).unwrap()
        }

        async fn request(&mut self, id: u64, method: &str, params: Value) -> Value {
            self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
                .await;
            let response = self.recv().await;
            assert_eq!(response["id"], id);
            response
        }

        async fn call_tool(&mut self, id: u64, name: &str, arguments: Value) -> Value {
            self.request(id, "tools/call", json!({"name": name, "arguments": arguments}))
                .await
        }
    }

    fn start(names: &[&str]) -> (Client, JoinHandle<std::io::Result<()>>, MockLauncher) {
        let (client, handle, launcher, _session) = start_with_session(names);
        (client, handle, launcher)
    }

    fn start_with_session(
        names: &[&str],
    ) -> (
        Client,
        JoinHandle<std::io::Result<()>>,
        MockLauncher,
        Arc<ContextSession>,
    ) {
        let launcher = MockLauncher::new();
        let config = ProxyConfig::from_yaml(&mock_yaml(names)).unwrap();
        let session =
            Arc::new(ContextSession::from_config(&config, Arc::new(launcher.clone())).unwrap());

        let (client_w, server_r) = tokio::io::duplex(64 * 1024);
        let (server_w, client_r) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(serve(Arc::clone(&session), server_r, server_w));
        let client = Client {
            writer: client_w,
            reader: BufReader::new(client_r).lines(),
        };
        (client, handle, launcher, session)
    }

    async fn wait_for(mut ready: impl FnMut() -> bool) {
        for _ in 0..200 {
            if ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn text_json(result: &Value) -> Value {
        serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_and_list_tools() {
        let (mut client, _server, _launcher) = start(&["a"]);

        let init = client
            .request(1, "initialize", json!({"protocolVersion": "2025-03-26", "capabilities": {}}))
            .await;
        assert_eq!(init["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(init["result"]["serverInfo"]["name"], "ctxrelay");

        client
            .send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;

        let list = client.request(2, "tools/list", json!({})).await;
        assert_eq!(list["result"]["tools"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_protocol_version_gets_ours() {
        let (mut client, _server, _launcher) = start(&["a"]);
        let init = client
            .request(1, "initialize", json!({"protocolVersion": "1999-01-01"}))
            .await;
        assert_eq!(init["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_context_tools_round_trip() {
        let (mut client, _server, launcher) = start(&["a", "b"]);

        let listed = client.call_tool(1, "list_contexts", json!({})).await;
        let contexts = text_json(&listed["result"]);
        assert_eq!(contexts[0]["name"], "a");
        assert_eq!(contexts[0]["active"], true);

        let switched = client
            .call_tool(2, "switch_context", json!({"context_name": "b"}))
            .await;
        assert_eq!(text_json(&switched["result"])["context"], "b");

        let called = client
            .call_tool(3, "proxy_tool", json!({"tool_name": "whoami"}))
            .await;
        assert_eq!(called["result"]["structuredContent"]["region"], "region-b");
        assert_eq!(launcher.spawn_count(), 1);

        let current = client.call_tool(4, "get_current_context", json!({})).await;
        let current = text_json(&current["result"]);
        assert_eq!(current["context"], "b");
        assert_eq!(current["worker"]["state"], "idle");

        let tools = client.call_tool(5, "list_proxied_tools", json!({})).await;
        let tools = text_json(&tools["result"]);
        assert!(tools
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t["name"] == "whoami" && t["input_schema"]["type"] == "object"));
    }

    #[tokio::test]
    async fn test_backend_error_is_passed_through() {
        let (mut client, _server, _launcher) = start(&["a"]);
        let response = client
            .call_tool(1, "proxy_tool", json!({"tool_name": "fail", "arguments": {}}))
            .await;
        assert_eq!(response["error"]["code"], -32000);
        assert!(response["error"]["message"].as_str().unwrap().contains("a"));
    }

    #[tokio::test]
    async fn test_operation_failures_are_tool_errors() {
        let (mut client, _server, _launcher) = start(&["a"]);
        let response = client
            .call_tool(1, "switch_context", json!({"context_name": "nope"}))
            .await;
        assert_eq!(response["result"]["isError"], true);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("nope") && text.contains("a"));
    }

    #[tokio::test]
    async fn test_invalid_calls_are_rpc_errors() {
        let (mut client, _server, _launcher) = start(&["a"]);

        let missing = client.call_tool(1, "switch_context", json!({})).await;
        assert_eq!(missing["error"]["code"], error_codes::INVALID_PARAMS);

        let bad_args = client
            .call_tool(2, "proxy_tool", json!({"tool_name": "whoami", "arguments": [1]}))
            .await;
        assert_eq!(bad_args["error"]["code"], error_codes::INVALID_PARAMS);

        let unknown = client.call_tool(3, "nope", json!({})).await;
        assert_eq!(unknown["error"]["code"], error_codes::INVALID_PARAMS);

        let method = client.request(4, "resources/list", json!({})).await;
        assert_eq!(method["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_parse_error_and_invalid_request() {
        let (mut client, _server, _launcher) = start(&["a"]);

        client.send_raw("{not json").await;
        let parse = client.recv().await;
        assert_eq!(parse["error"]["code"], error_codes::PARSE_ERROR);
        assert!(parse["id"].is_null());

        client.send(json!({"jsonrpc": "2.0", "id": 8})).await;
        let invalid = client.recv().await;
        assert_eq!(invalid["error"]["code"], error_codes::INVALID_REQUEST);
        assert_eq!(invalid["id"], 8);
    }

    #[tokio::test]
    async fn test_requests_are_handled_concurrently() {
        let (mut client, _server, _launcher) = start(&["a"]);

        client
            .send(json!({
                "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "proxy_tool", "arguments": {"tool_name": "sleep", "arguments": {"ms": 300}}}
            }))
            .await;
        client
            .send(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
            .await;

        let first = client.recv().await;
        assert_eq!(first["id"], 2, "ping should not wait behind the slow call");
        let second = client.recv().await;
        assert_eq!(second["id"], 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_is_abandoned() {
        let (mut client, _server, _launcher, session) = start_with_session(&["a"]);

        client
            .send(json!({
                "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "proxy_tool", "arguments": {"tool_name": "sleep", "arguments": {"ms": 600}}}
            }))
            .await;
        let pool = session.pool().clone();
        wait_for(|| pool.snapshot("a").is_some_and(|s| s.pending_requests == 1)).await;

        client
            .send(json!({
                "jsonrpc": "2.0", "method": "notifications/cancelled",
                "params": {"requestId": 1, "reason": "user pressed stop"}
            }))
            .await;
        wait_for(|| {
            pool.snapshot("a")
                .is_some_and(|s| s.leases == 0 && s.pending_requests == 0)
        })
        .await;

        // The next line after the backend would have answered is the ping.
        tokio::time::sleep(Duration::from_millis(700)).await;
        client.request(2, "ping", json!({})).await;
    }

    #[tokio::test]
    async fn test_cancel_for_unknown_request_is_ignored() {
        let (mut client, _server, _launcher) = start(&["a"]);
        client
            .send(json!({"jsonrpc": "2.0", "method": "notifications/cancelled", "params": {"requestId": 42}}))
            .await;
        client
            .send(json!({"jsonrpc": "2.0", "method": "notifications/cancelled", "params": {}}))
            .await;
        client.request(1, "ping", json!({})).await;
    }

    #[tokio::test]
    async fn test_eof_finishes_in_flight_requests() {
        let (mut client, server, _launcher) = start(&["a"]);

        client
            .send(json!({
                "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "proxy_tool", "arguments": {"tool_name": "sleep", "arguments": {"ms": 100}}}
            }))
            .await;
        let Client { writer, mut reader } = client;
        drop(writer);

        server.await.unwrap().unwrap();
        let line = reader.next_line().await.unwrap().unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["id"], 1);
        assert!(response["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .starts_with("slept"));
    }
}
