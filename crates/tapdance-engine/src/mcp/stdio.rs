//! JSON-RPC 2.0 framing and the stdio line transport.
//!
//! The dispatch here is transport-neutral; the HTTP transports feed the same
//! [`dispatch`] so a request behaves identically no matter how it arrived.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::error_codes::ErrorCode;
use super::server::{McpServer, ToolRequest};
use crate::Result;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(json!({ "code": code, "message": message.into() })),
        }
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::failure(None, ErrorCode::PARSE_ERROR, format!("Parse error: {detail}"))
    }
}

/// Route one JSON-RPC request. `None` means the request was a notification
/// and gets no response.
pub async fn dispatch(server: &McpServer, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
    if request.method.starts_with("notifications/") {
        debug!(method = %request.method, "notification acknowledged");
        return None;
    }

    let response = match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(
            request.id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "tapdance",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        ),
        "ping" => JsonRpcResponse::success(request.id, server.ping()),
        "tools/list" => {
            let tools: Vec<Value> = server
                .tool_schemas()
                .iter()
                .map(|s| {
                    json!({
                        "name": s.name,
                        "description": s.description,
                        "inputSchema": s.parameters,
                    })
                })
                .collect();
            JsonRpcResponse::success(request.id, json!({ "tools": tools }))
        }
        "tools/call" => call_tool(server, request.id, request.params).await,
        other => JsonRpcResponse::failure(
            request.id,
            ErrorCode::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        ),
    };
    Some(response)
}

async fn call_tool(
    server: &McpServer,
    id: Option<Value>,
    params: Option<Value>,
) -> JsonRpcResponse {
    let Some(params) = params else {
        return JsonRpcResponse::failure(
            id,
            ErrorCode::INVALID_PARAMS,
            "Invalid params: params required",
        );
    };
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return JsonRpcResponse::failure(
            id,
            ErrorCode::INVALID_PARAMS,
            "Invalid params: missing 'name'",
        );
    };
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    match server
        .call_tool(ToolRequest {
            tool_name: name.to_string(),
            params: arguments,
        })
        .await
    {
        Ok(response) if response.success => JsonRpcResponse::success(
            id,
            json!({
                "content": [{
                    "type": "text",
                    "text": serde_json::to_string_pretty(&response.result)
                        .unwrap_or_else(|_| response.result.to_string()),
                }]
            }),
        ),
        Ok(response) => {
            // Tool-level failure: the structured error payload travels as
            // tool output so MCP clients can read the kind and code.
            JsonRpcResponse::success(
                id,
                json!({
                    "content": [{
                        "type": "text",
                        "text": serde_json::to_string_pretty(&response.result)
                            .unwrap_or_else(|_| response.result.to_string()),
                    }],
                    "isError": true
                }),
            )
        }
        Err(e) => JsonRpcResponse::failure(
            id,
            ErrorCode::TOOL_NOT_FOUND,
            format!("Tool call failed: {e}"),
        ),
    }
}

/// Blocking stdin line loop. Each line is one JSON-RPC request; each
/// response goes out as one line on stdout.
pub async fn serve(server: Arc<McpServer>) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let outgoing = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) => dispatch(&server, request).await,
            Err(e) => Some(JsonRpcResponse::parse_error(e)),
        };
        if let Some(response) = outgoing {
            writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
            stdout.flush()?;
        }
    }
    Ok(())
}
