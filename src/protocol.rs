//! MCP JSON-RPC 2.0 message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// JSON-RPC version tag.
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version offered in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Protocol versions this client can speak.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Method names used by the client.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const SHUTDOWN: &str = "shutdown";
}

/// Standard JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Request id, numeric or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

/// JSON-RPC request.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC notification (no id, no response).
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    pub method: String,
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC response: exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Splits the response into its result or error.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

    pub fn method_not_found(method: &str) -> Self {
        Self::new(error_codes::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }
}

/// Any frame that can travel over a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            JsonRpcMessage::Response(_) => None,
        }
    }

    /// Parses one frame from text.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Parses a body that may hold a single frame or a batch.
    pub fn parse_batch(text: &str) -> serde_json::Result<Vec<Self>> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Array(items) => items.into_iter().map(serde_json::from_value).collect(),
            single => Ok(vec![serde_json::from_value(single)?]),
        }
    }
}

/// Wire shape shared by every JSON-RPC frame.
#[derive(Debug, Serialize, Deserialize)]
struct RawMessage {
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    /// `Some(Value::Null)` when the frame carries `"result": null`
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawMessage> for JsonRpcMessage {
    type Error = String;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        if raw.jsonrpc != JSONRPC_VERSION {
            return Err(format!("unsupported jsonrpc version '{}'", raw.jsonrpc));
        }

        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(JsonRpcMessage::Request(JsonRpcRequest {
                id,
                method,
                params: raw.params,
            })),
            (None, Some(method)) => Ok(JsonRpcMessage::Notification(JsonRpcNotification {
                method,
                params: raw.params,
            })),
            (Some(id), None) => {
                match (&raw.result, &raw.error) {
                    (Some(_), Some(_)) => {
                        return Err("response carries both result and error".to_string());
                    }
                    (None, None) => {
                        return Err("response carries neither result nor error".to_string());
                    }
                    _ => {}
                }
                Ok(JsonRpcMessage::Response(JsonRpcResponse {
                    id,
                    result: raw.result,
                    error: raw.error,
                }))
            }
            (None, None) => Err("frame has neither id nor method".to_string()),
        }
    }
}

impl From<JsonRpcMessage> for RawMessage {
    fn from(message: JsonRpcMessage) -> Self {
        let mut raw = RawMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match message {
            JsonRpcMessage::Request(r) => {
                raw.id = Some(r.id);
                raw.method = Some(r.method);
                raw.params = r.params;
            }
            JsonRpcMessage::Notification(n) => {
                raw.method = Some(n.method);
                raw.params = n.params;
            }
            JsonRpcMessage::Response(r) => {
                raw.id = Some(r.id);
                raw.error = r.error;
                if raw.error.is_none() {
                    raw.result = Some(r.result.unwrap_or(Value::Null));
                }
            }
        }
        raw
    }
}

/// Capabilities advertised by a server, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerCapabilities(pub BTreeMap<String, Value>);

impl ServerCapabilities {
    /// Whether the named capability is advertised.
    pub fn has(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Advertised capability names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Whether the server will push `tools/list_changed` notifications.
    pub fn tools_list_changed(&self) -> bool {
        self.flag("tools", "listChanged")
    }

    /// Capabilities that rely on server-initiated notifications.
    pub fn push_features(&self) -> Vec<String> {
        let mut features = Vec::new();
        for cap in ["tools", "resources", "prompts"] {
            if self.flag(cap, "listChanged") {
                features.push(format!("{cap}.listChanged"));
            }
        }
        if self.flag("resources", "subscribe") {
            features.push("resources.subscribe".to_string());
        }
        if self.has("logging") {
            features.push("logging".to_string());
        }
        features
    }

    fn flag(&self, capability: &str, flag: &str) -> bool {
        self.0
            .get(capability)
            .and_then(|c| c.get(flag))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Server identification from `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// MCP initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Information about a tool from the MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MCPToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Response from tools/list method.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResponse {
    #[serde(default)]
    pub tools: Vec<MCPToolInfo>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}
