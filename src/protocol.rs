//! JSON-RPC 2.0 envelope and the MCP payload shapes the proxy touches.
//!
//! Only the outer envelope is parsed. Tool input schemas and tool-call results
//! are opaque `serde_json::Value`s passed through unchanged; the proxy never
//! normalizes what upstreams declare.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// JSON-RPC request id. The protocol allows numbers and strings; ids we allocate
/// toward upstreams are always numeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// Incoming message: a request when `id` is present, a notification otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn request(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(RequestId::Number(id)),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// One tool as declared by an upstream server.
///
/// `extra` keeps fields this proxy does not interpret (annotations, output
/// schemas) flowing through the cache untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: Option<&str>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.map(str::to_string),
            input_schema,
            extra: serde_json::Map::new(),
        }
    }
}

fn default_input_schema() -> Value {
    json!({ "type": "object" })
}

/// MCP tool result carrying a single text item.
pub fn text_tool_result(text: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": text.into() }] })
}

/// MCP tool result flagged as an error. Tool-level failures use this shape
/// rather than a JSON-RPC protocol fault.
pub fn error_tool_result(text: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": text.into() }], "isError": true })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_vs_notification() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#).unwrap();
        assert_eq!(req.id, Some(RequestId::Number(7)));

        let note: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(note.id.is_none());
    }

    #[test]
    fn string_ids_round_trip() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc-1","method":"ping"}"#).unwrap();
        assert_eq!(req.id, Some(RequestId::String("abc-1".to_string())));
        let out = serde_json::to_value(&req).unwrap();
        assert_eq!(out["id"], "abc-1");
    }

    #[test]
    fn tool_schema_preserves_unknown_fields() {
        let raw = r#"{
            "name": "git_commit",
            "description": "Create a commit",
            "inputSchema": {"type":"object","properties":{"message":{"type":"string"}}},
            "outputSchema": {"type":"object"},
            "annotations": {"readOnlyHint": false}
        }"#;
        let tool: ToolSchema = serde_json::from_str(raw).unwrap();
        assert_eq!(tool.name, "git_commit");
        assert!(tool.extra.contains_key("outputSchema"));
        assert!(tool.extra.contains_key("annotations"));

        let out = serde_json::to_value(&tool).unwrap();
        assert_eq!(out["annotations"]["readOnlyHint"], false);
        assert_eq!(out["inputSchema"]["properties"]["message"]["type"], "string");
    }

    #[test]
    fn missing_input_schema_defaults_to_object() {
        let tool: ToolSchema = serde_json::from_str(r#"{"name":"bare"}"#).unwrap();
        assert_eq!(tool.input_schema, json!({ "type": "object" }));
    }

    #[test]
    fn error_result_shape() {
        let v = error_tool_result("Error: boom");
        assert_eq!(v["isError"], true);
        assert_eq!(v["content"][0]["type"], "text");
    }
}
