//! Shared types for the worker bridge.
//!
//! JSON-RPC 2.0 framing types, tool definitions and the supervisor state.

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Outcome carried by a response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcPayload {
    Result(serde_json::Value),
    Error(JsonRpcError),
}

/// Any frame that can travel over the worker stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        id: u64,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
    Response {
        id: u64,
        payload: RpcPayload,
    },
}

impl RpcMessage {
    /// Classify a decoded JSON value as a JSON-RPC frame.
    ///
    /// Returns `None` for JSON that is not a recognizable JSON-RPC object
    /// (arrays, scalars, objects without `method`/`result`/`error`, or a
    /// response whose id is not an unsigned integer).
    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        let serde_json::Value::Object(mut obj) = value else {
            return None;
        };

        let params = obj.remove("params");
        let id = obj.get("id").and_then(|v| v.as_u64());

        if let Some(method) = obj.get("method").and_then(|m| m.as_str()) {
            let method = method.to_string();
            return Some(match id {
                Some(id) => RpcMessage::Request { id, method, params },
                None => RpcMessage::Notification { method, params },
            });
        }

        let id = id?;
        if let Some(err) = obj.remove("error").filter(|e| !e.is_null()) {
            let error = serde_json::from_value::<JsonRpcError>(err).unwrap_or(JsonRpcError {
                code: error_codes::INTERNAL_ERROR,
                message: "malformed error object".into(),
                data: None,
            });
            return Some(RpcMessage::Response {
                id,
                payload: RpcPayload::Error(error),
            });
        }

        obj.remove("result").map(|result| RpcMessage::Response {
            id,
            payload: RpcPayload::Result(result),
        })
    }

    /// Parse one line of worker output. Non-JSON lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let value = serde_json::from_str::<serde_json::Value>(line).ok()?;
        Self::from_value(value)
    }
}

// ─── Method Names ───────────────────────────────────────────────────────────

/// Method names used by the worker protocol.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const LIST_TOOLS: &str = "tools/list";
    pub const CALL_TOOL: &str = "tools/call";
}

/// Protocol revision announced in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── Tool Definitions ───────────────────────────────────────────────────────

/// A tool the worker can execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(
        default = "empty_object_schema",
        alias = "inputSchema",
        alias = "parameters",
        alias = "params_schema"
    )]
    pub parameter_schema: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, parameter_schema: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameter_schema,
        }
    }

    /// Names listed in the schema's `required` array.
    pub fn required_fields(&self) -> Vec<&str> {
        self.parameter_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Response payload of the tool-listing request.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

/// Worker identity returned by `initialize`.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Process State ──────────────────────────────────────────────────────────

/// Lifecycle state of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Ready,
    Crashed,
    Restarting,
    Stopped,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessState::NotStarted => "not_started",
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::Crashed => "crashed",
            ProcessState::Restarting => "restarting",
            ProcessState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// ─── Session Credentials ────────────────────────────────────────────────────

/// OAuth tokens handed to the worker through its environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    /// Expiry as unix milliseconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl SessionCredentials {
    /// Environment variables the worker reads its tokens from. Absent
    /// optional tokens are omitted.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![("GOOGLE_ACCESS_TOKEN", self.access_token.clone())];
        if let Some(token) = &self.refresh_token {
            vars.push(("GOOGLE_REFRESH_TOKEN", token.clone()));
        }
        if let Some(token) = &self.id_token {
            vars.push(("GOOGLE_ID_TOKEN", token.clone()));
        }
        if let Some(expires_at) = self.expires_at {
            vars.push(("GOOGLE_TOKEN_EXPIRES_AT", expires_at.to_string()));
        }
        vars
    }
}

// ─── Standard Error Codes ───────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
