//! Capability catalog: the set of tools the model may call.
//!
//! Provides:
//! - The handshake that discovers tools from the worker
//! - Atomic whole-catalog replacement (dynamic set or static fallback)
//! - Lookup and argument validation against parameter schemas
//! - Conversion into the completion API's tool format and the system prompt

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::json;

use super::errors::BridgeError;
use super::transport::RpcTransport;
use super::types::{methods, InitializeResult, ListToolsResult, ToolDefinition, PROTOCOL_VERSION};

// ─── Snapshot ───────────────────────────────────────────────────────────────

/// Where the current tool set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogSource {
    /// Nothing populated yet.
    Empty,
    /// Reported by the running worker.
    Dynamic,
    /// Compiled-in definitions used when discovery fails.
    StaticFallback,
}

/// An immutable tool set. Readers hold an `Arc` to one snapshot, so a
/// concurrent replacement never shows them a partial catalog.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    source: CatalogSource,
    tools: Vec<ToolDefinition>,
    index: HashMap<String, usize>,
}

impl CatalogSnapshot {
    fn new(source: CatalogSource, tools: Vec<ToolDefinition>) -> Self {
        // Later duplicates of a name are dropped; names stay unique.
        let mut unique = Vec::with_capacity(tools.len());
        let mut index = HashMap::new();
        for tool in tools {
            if tool.name.is_empty() || index.contains_key(&tool.name) {
                tracing::warn!(tool = %tool.name, "skipping duplicate or unnamed tool");
                continue;
            }
            index.insert(tool.name.clone(), unique.len());
            unique.push(tool);
        }
        Self {
            source,
            tools: unique,
            index,
        }
    }

    pub fn empty() -> Self {
        Self::new(CatalogSource::Empty, Vec::new())
    }

    pub fn source(&self) -> CatalogSource {
        self.source
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tools in the order the worker listed them.
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// A copy restricted to the allowlisted names. Unknown names are ignored.
    pub fn filtered(&self, allowed: &HashSet<String>) -> Self {
        let before = self.tools.len();
        let tools: Vec<ToolDefinition> = self
            .tools
            .iter()
            .filter(|t| allowed.contains(&t.name))
            .cloned()
            .collect();
        tracing::debug!(before, after = tools.len(), "filtered catalog by allowlist");
        Self::new(self.source, tools)
    }

    /// Validate a tool call: the tool exists, required fields are present
    /// and top-level fields have the declared JSON type.
    ///
    /// Full JSON Schema validation is left to the worker.
    pub fn validate_arguments(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), BridgeError> {
        let def = self.get(tool_name).ok_or_else(|| BridgeError::UnknownTool {
            name: tool_name.to_string(),
        })?;

        let invalid = |reason: String| BridgeError::InvalidArguments {
            tool: tool_name.to_string(),
            reason,
        };

        let Some(args) = arguments.as_object() else {
            return Err(invalid("arguments must be a JSON object".into()));
        };

        for field in def.required_fields() {
            if !args.contains_key(field) {
                return Err(invalid(format!("missing required field: '{field}'")));
            }
        }

        let Some(properties) = def.parameter_schema.get("properties").and_then(|p| p.as_object())
        else {
            return Ok(());
        };
        for (key, value) in args {
            let Some(expected) = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            if !json_type_matches(expected, value) {
                return Err(invalid(format!(
                    "field '{key}' should be of type {expected}"
                )));
            }
        }

        Ok(())
    }

    /// Tool definitions in the completion API's function-calling format.
    pub fn completion_tools(&self) -> Vec<crate::inference::types::ToolDefinition> {
        self.tools.iter().map(Into::into).collect()
    }

    /// One line per tool for the system prompt.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No tools are currently available.".to_string();
        }

        let mut summary = format!("Available tools ({}):", self.tools.len());
        for def in &self.tools {
            if def.description.is_empty() {
                summary.push_str(&format!("\n- {}", def.name));
            } else {
                summary.push_str(&format!("\n- {}: {}", def.name, def.description));
            }
        }
        summary
    }
}

/// `null` values are accepted for any declared type; optional fields are
/// often sent as explicit nulls.
fn json_type_matches(expected: &str, value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (expected, value) {
        (_, Value::Null) => true,
        ("string", Value::String(_)) => true,
        ("number", Value::Number(_)) => true,
        ("integer", Value::Number(n)) => n.is_i64() || n.is_u64(),
        ("boolean", Value::Bool(_)) => true,
        ("array", Value::Array(_)) => true,
        ("object", Value::Object(_)) => true,
        ("string" | "number" | "integer" | "boolean" | "array" | "object", _) => false,
        _ => true,
    }
}

// ─── CapabilityCatalog ──────────────────────────────────────────────────────

/// Shared holder of the current [`CatalogSnapshot`].
#[derive(Debug)]
pub struct CapabilityCatalog {
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl Default for CapabilityCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityCatalog {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(CatalogSnapshot::empty())),
        }
    }

    /// The current tool set.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the whole catalog.
    pub fn replace(&self, source: CatalogSource, tools: Vec<ToolDefinition>) -> Arc<CatalogSnapshot> {
        let snapshot = Arc::new(CatalogSnapshot::new(source, tools));
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot.clone();
        snapshot
    }

    pub fn install_fallback(&self) -> Arc<CatalogSnapshot> {
        self.replace(CatalogSource::StaticFallback, static_fallback_tools())
    }

    /// Run the handshake and replace the catalog with the result.
    ///
    /// On failure the static fallback set is installed and the error is
    /// still returned.
    pub async fn populate(
        &self,
        transport: &RpcTransport,
    ) -> Result<Vec<ToolDefinition>, BridgeError> {
        match Self::handshake(transport).await {
            Ok(tools) => {
                self.replace(CatalogSource::Dynamic, tools.clone());
                Ok(tools)
            }
            Err(e) => {
                tracing::warn!(
                    worker = %transport.worker_name(),
                    error = %e,
                    "tool discovery failed, installing static catalog"
                );
                self.install_fallback();
                Err(e)
            }
        }
    }

    /// `initialize`, then the `initialized` notification, then tool listing.
    /// Does not touch any catalog.
    pub async fn handshake(transport: &RpcTransport) -> Result<Vec<ToolDefinition>, BridgeError> {
        let name = transport.worker_name().to_string();
        let failed = |reason: String| BridgeError::HandshakeFailed {
            name: name.clone(),
            reason,
        };

        let init_params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let init = transport
            .send(methods::INITIALIZE, Some(init_params))
            .await
            .map_err(|e| failed(format!("initialize: {e}")))?;

        if let Ok(info) = serde_json::from_value::<InitializeResult>(init) {
            let server = info.server_info.as_ref();
            tracing::info!(
                worker = %name,
                protocol_version = ?info.protocol_version,
                server_name = ?server.and_then(|s| s.name.as_deref()),
                server_version = ?server.and_then(|s| s.version.as_deref()),
                "worker initialized"
            );
        }

        transport
            .notify(methods::INITIALIZED, None)
            .await
            .map_err(|e| failed(format!("initialized notification: {e}")))?;

        let listed = transport
            .send(methods::LIST_TOOLS, Some(json!({})))
            .await
            .map_err(|e| failed(format!("tool listing: {e}")))?;

        let result: ListToolsResult = serde_json::from_value(listed)
            .map_err(|e| failed(format!("malformed tool list: {e}")))?;

        tracing::info!(worker = %name, tool_count = result.tools.len(), "tools discovered");
        Ok(result.tools)
    }
}

// ─── Static Fallback ────────────────────────────────────────────────────────

/// The compiled-in tool set covering Drive, Gmail and Calendar.
pub fn static_fallback_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "drive_search_files",
            "Search Google Drive files by name or content",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "maxResults": { "type": "integer", "description": "Maximum number of files" }
                },
                "required": ["query"]
            }),
        ),
        ToolDefinition::new(
            "drive_read_file",
            "Read the text content of a Google Drive file",
            json!({
                "type": "object",
                "properties": {
                    "fileId": { "type": "string", "description": "Drive file id" }
                },
                "required": ["fileId"]
            }),
        ),
        ToolDefinition::new(
            "drive_create_file",
            "Create a new Google Drive file",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "File name" },
                    "content": { "type": "string", "description": "File content" },
                    "mimeType": { "type": "string", "description": "MIME type" }
                },
                "required": ["name", "content"]
            }),
        ),
        ToolDefinition::new(
            "gmail_send_message",
            "Send an email through Gmail",
            json!({
                "type": "object",
                "properties": {
                    "to": { "type": "string", "description": "Recipient address" },
                    "subject": { "type": "string", "description": "Subject line" },
                    "body": { "type": "string", "description": "Message body" }
                },
                "required": ["to", "subject", "body"]
            }),
        ),
        ToolDefinition::new(
            "gmail_list_messages",
            "List recent Gmail messages, optionally filtered by a search query",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Gmail search query" },
                    "maxResults": { "type": "integer", "description": "Maximum number of messages" }
                }
            }),
        ),
        ToolDefinition::new(
            "gmail_read_message",
            "Read a Gmail message by id",
            json!({
                "type": "object",
                "properties": {
                    "messageId": { "type": "string", "description": "Gmail message id" }
                },
                "required": ["messageId"]
            }),
        ),
        ToolDefinition::new(
            "calendar_list_events",
            "List Google Calendar events in a time range",
            json!({
                "type": "object",
                "properties": {
                    "timeMin": { "type": "string", "description": "Start of range (RFC 3339)" },
                    "timeMax": { "type": "string", "description": "End of range (RFC 3339)" },
                    "maxResults": { "type": "integer", "description": "Maximum number of events" }
                }
            }),
        ),
        ToolDefinition::new(
            "calendar_create_event",
            "Create a Google Calendar event",
            json!({
                "type": "object",
                "properties": {
                    "summary": { "type": "string", "description": "Event title" },
                    "start": { "type": "string", "description": "Start time (RFC 3339)" },
                    "end": { "type": "string", "description": "End time (RFC 3339)" },
                    "description": { "type": "string", "description": "Event description" },
                    "attendees": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Attendee email addresses"
                    }
                },
                "required": ["summary", "start", "end"]
            }),
        ),
        ToolDefinition::new(
            "calendar_get_availability",
            "Find busy and free time slots in Google Calendar",
            json!({
                "type": "object",
                "properties": {
                    "timeMin": { "type": "string", "description": "Start of range (RFC 3339)" },
                    "timeMax": { "type": "string", "description": "End of range (RFC 3339)" }
                },
                "required": ["timeMin", "timeMax"]
            }),
        ),
    ]
}

// ─── Tests ───────────────────────────────────────────────────────────────────
