//! The five tools the proxy exposes, and their dispatch onto the session.

use serde::Serialize;
use serde_json::{json, Value};

use crate::context::{ContextError, ContextSession};
use crate::mcp_client::types::{error_codes, JsonRpcError};
use crate::mcp_client::McpError;

/// Tool definitions returned from `tools/list`.
pub fn definitions() -> Vec<Value> {
    let no_args = json!({"type": "object", "properties": {}});
    vec![
        json!({
            "name": "list_contexts",
            "description": "List all configured contexts, showing which is active and which have a running backend.",
            "inputSchema": no_args,
        }),
        json!({
            "name": "switch_context",
            "description": "Switch the active context. Later tool calls use the backend running with that context's environment.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "context_name": {"type": "string", "description": "Name of the context to switch to"}
                },
                "required": ["context_name"]
            },
        }),
        json!({
            "name": "get_current_context",
            "description": "Describe the active context and its backend process, if one is running.",
            "inputSchema": no_args,
        }),
        json!({
            "name": "list_proxied_tools",
            "description": "List the tools offered by the active context's backend server.",
            "inputSchema": no_args,
        }),
        json!({
            "name": "proxy_tool",
            "description": "Call a tool on the active context's backend server.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tool_name": {"type": "string", "description": "Name of the backend tool"},
                    "arguments": {"type": "object", "description": "Arguments passed to the backend tool"}
                },
                "required": ["tool_name"]
            },
        }),
    ]
}

/// Run one `tools/call`.
///
/// Failures of the operation itself come back as tool results with
/// `isError: true`; malformed calls and backend JSON-RPC errors come back as
/// JSON-RPC errors.
pub async fn dispatch(
    session: &ContextSession,
    name: &str,
    arguments: Value,
) -> Result<Value, JsonRpcError> {
    match name {
        "list_contexts" => json_result(&session.list_contexts()),
        "get_current_context" => json_result(&session.get_current_context()),
        "switch_context" => {
            let context_name = required_str(&arguments, "context_name")?;
            match session.switch_context(context_name) {
                Ok(outcome) => json_result(&outcome),
                Err(e) => Ok(error_result(&e)),
            }
        }
        "list_proxied_tools" => match session.list_proxied_tools().await {
            Ok(tools) => {
                let listed: Vec<Value> = tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.input_schema,
                        })
                    })
                    .collect();
                json_result(&listed)
            }
            Err(e) => Ok(error_result(&e)),
        },
        "proxy_tool" => {
            let tool_name = required_str(&arguments, "tool_name")?;
            let forwarded = match arguments.get("arguments") {
                None | Some(Value::Null) => json!({}),
                Some(Value::Object(map)) => Value::Object(map.clone()),
                Some(_) => {
                    return Err(JsonRpcError::new(
                        error_codes::INVALID_PARAMS,
                        "'arguments' must be an object",
                    ))
                }
            };
            match session.proxy_tool(tool_name, forwarded).await {
                Ok(result) => Ok(result),
                Err(ContextError::Mcp(McpError::RemoteError {
                    code,
                    message,
                    data,
                })) => Err(JsonRpcError {
                    code,
                    message,
                    data,
                }),
                Err(e) => Ok(error_result(&e)),
            }
        }
        other => Err(JsonRpcError::new(
            error_codes::INVALID_PARAMS,
            format!("unknown tool: {other}"),
        )),
    }
}

fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, JsonRpcError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            JsonRpcError::new(
                error_codes::INVALID_PARAMS,
                format!("missing required string argument '{key}'"),
            )
        })
}

/// Wrap a serializable value as MCP text content.
fn json_result<T: Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| {
        JsonRpcError::new(error_codes::INTERNAL_ERROR, format!("failed to encode result: {e}"))
    })?;
    Ok(json!({
        "content": [{"type": "text", "text": text}],
        "isError": false,
    }))
}

fn error_result(error: &ContextError) -> Value {
    tracing::debug!(error = %error, "tool call failed");
    json!({
        "content": [{"type": "text", "text": error.to_string()}],
        "isError": true,
    })
}
