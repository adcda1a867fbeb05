//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types and MCP protocol structures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol revision announced in the `initialize` handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message sent to a worker.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an id).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// The id is kept as a raw JSON value: peers may use numbers or strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Any inbound JSON-RPC message, before it is classified.
///
/// Both directions of the relay read lines into this shape and then decide
/// whether they hold a request, a notification or a response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// Classification of a [`JsonRpcMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
    Invalid,
}

impl JsonRpcMessage {
    pub fn kind(&self) -> MessageKind {
        match (&self.id, &self.method) {
            (Some(_), Some(_)) => MessageKind::Request,
            (None, Some(_)) => MessageKind::Notification,
            (Some(_), None) if self.result.is_some() || self.error.is_some() => {
                MessageKind::Response
            }
            _ => MessageKind::Invalid,
        }
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// A callable operation advertised by a worker through `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: Value,
}

/// One page of a `tools/list` result.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsPage {
    #[serde(default)]
    pub tools: Vec<RemoteTool>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = JsonRpcNotification::new("notifications/initialized", None);
        let json = serde_json::to_string(&note).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_message_kinds() {
        let req: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"a","method":"ping"}"#).unwrap();
        assert_eq!(req.kind(), MessageKind::Request);

        let note: JsonRpcMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#,
        )
        .unwrap();
        assert_eq!(note.kind(), MessageKind::Notification);

        let resp: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":{}}"#).unwrap();
        assert_eq!(resp.kind(), MessageKind::Response);

        let junk: JsonRpcMessage = serde_json::from_str(r#"{"id":7}"#).unwrap();
        assert_eq!(junk.kind(), MessageKind::Invalid);
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcMessage = serde_json::from_str(json).unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_failure_response_omits_result() {
        let resp = JsonRpcResponse::failure(
            serde_json::json!(3),
            JsonRpcError::new(error_codes::INVALID_PARAMS, "bad"),
        );
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["code"], -32602);
    }

    #[test]
    fn test_remote_tool_accepts_camel_case_schema() {
        let json = r#"{"name": "list_clusters", "inputSchema": {"type": "object"}}"#;
        let tool: RemoteTool = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "list_clusters");
        assert!(tool.description.is_none());
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn test_list_tools_page_cursor() {
        let json = r#"{"tools": [{"name": "a"}], "nextCursor": "p2"}"#;
        let page: ListToolsPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.tools.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("p2"));
    }
}
