//! Host-facing request dispatch, shared by the stdio and SSE transports.
//!
//! Tool-level failures (unknown tool, startup timeout, upstream errors) come
//! back as tool results with `isError: true`; only malformed envelopes and
//! unsupported methods produce JSON-RPC faults. Nothing here ever terminates
//! the proxy.

use crate::modes::ExposureMode;
use crate::protocol::{
    INVALID_PARAMS, INVALID_REQUEST, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND,
    MCP_PROTOCOL_VERSION, RequestId, error_tool_result,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;

pub struct ProxyServer {
    mode: Arc<dyn ExposureMode>,
}

impl ProxyServer {
    pub fn new(mode: Arc<dyn ExposureMode>) -> Self {
        Self { mode }
    }

    /// Dispatch one raw JSON-RPC frame. Returns `None` for notifications.
    pub async fn handle_message(&self, raw: Value) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_value(raw.clone()) {
            Ok(request) => request,
            Err(e) => {
                let id = raw
                    .get("id")
                    .and_then(|v| serde_json::from_value::<RequestId>(v.clone()).ok())
                    .unwrap_or(RequestId::Number(0));
                return Some(JsonRpcResponse::error(
                    id,
                    INVALID_REQUEST,
                    format!("invalid JSON-RPC message: {e}"),
                ));
            }
        };

        let Some(id) = request.id.clone() else {
            self.handle_notification(&request);
            return None;
        };

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::ok(id, initialize_result()),
            "ping" => JsonRpcResponse::ok(id, json!({})),
            "tools/list" => {
                let tools = self.mode.tools_list().await;
                tracing::debug!(tool_count = tools.len(), "tools/list");
                JsonRpcResponse::ok(id, json!({ "tools": tools }))
            }
            "tools/call" => self.handle_tools_call(id, request.params).await,
            other => JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("unsupported method: {other}"),
            ),
        };
        Some(response)
    }

    async fn handle_tools_call(&self, id: RequestId, params: Option<Value>) -> JsonRpcResponse {
        let params = params.unwrap_or_else(|| json!({}));
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::error(
                id,
                INVALID_PARAMS,
                "tools/call requires a 'name' string",
            );
        };
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let start = Instant::now();
        match self.mode.tools_call(name, arguments).await {
            Ok(result) => {
                tracing::debug!(tool = %name, elapsed = ?start.elapsed(), "tools/call ok");
                JsonRpcResponse::ok(id, result)
            }
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, elapsed = ?start.elapsed(), "tools/call failed");
                JsonRpcResponse::ok(id, error_tool_result(format!("Error: {e}")))
            }
        }
    }

    fn handle_notification(&self, request: &JsonRpcRequest) {
        match request.method.as_str() {
            "notifications/initialized" => tracing::debug!("host session initialized"),
            "notifications/cancelled" => tracing::debug!("host cancelled a request"),
            other => tracing::debug!(method = %other, "ignoring notification"),
        }
    }
}

fn initialize_result() -> Value {
    // No listChanged: the tool surface is fixed for the life of the process
    // (config and cache are read once at startup).
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}
