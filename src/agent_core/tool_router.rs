//! ToolRouter: turns a model tool call into text.
//!
//! The router is the bridge between the model's tool call decisions and the
//! worker. It handles:
//! - Fallback to deterministic demo responses while the worker is not Ready
//!   or when the `tools/call` request fails in transport (timeout, dropped
//!   stream, JSON-RPC error object)
//! - Argument validation against the active catalog
//! - Execution via `tools/call`
//! - Normalization of heterogeneous result shapes into plain text
//!
//! It never returns an error: every problem becomes a [`ToolOutcome`].

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::watch;

use crate::mcp_client::catalog::{CapabilityCatalog, CatalogSource};
use crate::mcp_client::types::{methods, ProcessState};
use crate::mcp_client::{ProcessSupervisor, RpcTransport};

use super::types::ToolOutcome;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Maximum bytes of tool output passed back to the model.
pub const MAX_TOOL_RESULT_BYTES: usize = 6_000;

// ─── ToolRouter ─────────────────────────────────────────────────────────────

/// Routes tool calls to the worker, or to demo responses when it is
/// unavailable. Cheap to clone; holds no per-call state.
#[derive(Clone)]
pub struct ToolRouter {
    transport: Arc<RpcTransport>,
    catalog: Arc<CapabilityCatalog>,
    state: watch::Receiver<ProcessState>,
}

impl ToolRouter {
    pub fn new(
        transport: Arc<RpcTransport>,
        catalog: Arc<CapabilityCatalog>,
        state: watch::Receiver<ProcessState>,
    ) -> Self {
        Self {
            transport,
            catalog,
            state,
        }
    }

    /// A router over the supervisor's worker.
    pub fn for_supervisor(supervisor: &ProcessSupervisor) -> Self {
        Self::new(
            supervisor.transport(),
            supervisor.catalog(),
            supervisor.subscribe(),
        )
    }

    pub fn catalog(&self) -> &Arc<CapabilityCatalog> {
        &self.catalog
    }

    fn is_ready(&self) -> bool {
        *self.state.borrow() == ProcessState::Ready
    }

    /// Invoke a tool and return the text the model should see.
    pub async fn invoke(&self, name: &str, arguments: &Value) -> String {
        self.dispatch(name, arguments).await.message_text(name)
    }

    /// Invoke a tool and keep the success/failure distinction.
    pub async fn dispatch(&self, name: &str, arguments: &Value) -> ToolOutcome {
        if !self.is_ready() {
            tracing::debug!(tool = %name, "worker not ready, using demo response");
            return ToolOutcome::Success(demo_response(name, arguments));
        }

        let snapshot = self.catalog.snapshot();
        if snapshot.source() != CatalogSource::Empty {
            if let Err(e) = snapshot.validate_arguments(name, arguments) {
                tracing::warn!(tool = %name, error = %e, "tool call rejected");
                return ToolOutcome::Failure(e.to_string());
            }
        }

        let params = json!({ "name": name, "arguments": arguments });
        match self.transport.send(methods::CALL_TOOL, Some(params)).await {
            Ok(result) => {
                let is_error = result
                    .get("isError")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let text = truncate_tool_result(&normalize_result(&result), name);
                tracing::info!(tool = %name, is_error, result_len = text.len(), "tool executed");
                if is_error {
                    ToolOutcome::Failure(text)
                } else {
                    ToolOutcome::Success(text)
                }
            }
            Err(e) => {
                tracing::warn!(
                    tool = %name,
                    error = %e,
                    timeout = e.is_timeout(),
                    stream_failure = e.is_stream_failure(),
                    "tool call failed in transport, using demo response"
                );
                ToolOutcome::Success(demo_response(name, arguments))
            }
        }
    }
}

// ─── Result Normalization ───────────────────────────────────────────────────

/// Flatten a tool result into plain text.
///
/// - A list of content parts: the `text` fields joined with newlines
/// - An object with a `content` list: the same, applied to that list
/// - An object with a `text` string: that string
/// - A string: itself
/// - Anything else: its JSON form
pub fn normalize_result(value: &Value) -> String {
    match value {
        Value::Null => "No result returned.".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(parts) => join_text_parts(parts).unwrap_or_else(|| value.to_string()),
        Value::Object(obj) => {
            if let Some(text) = obj
                .get("content")
                .and_then(|c| c.as_array())
                .and_then(|parts| join_text_parts(parts))
            {
                return text;
            }
            if let Some(text) = obj.get("text").and_then(|t| t.as_str()) {
                return text.to_string();
            }
            value.to_string()
        }
        other => other.to_string(),
    }
}

fn join_text_parts(parts: &[Value]) -> Option<String> {
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|part| match part {
            Value::String(s) => Some(s.as_str()),
            other => other.get("text").and_then(|t| t.as_str()),
        })
        .collect();
    (!texts.is_empty()).then(|| texts.join("\n"))
}

/// Cap tool output at [`MAX_TOOL_RESULT_BYTES`] on a character boundary.
fn truncate_tool_result(result: &str, tool_name: &str) -> String {
    if result.len() <= MAX_TOOL_RESULT_BYTES {
        return result.to_string();
    }

    let mut end = MAX_TOOL_RESULT_BYTES;
    while end > 0 && !result.is_char_boundary(end) {
        end -= 1;
    }
    tracing::info!(
        tool = %tool_name,
        original_len = result.len(),
        truncated_to = end,
        "tool result truncated"
    );
    format!(
        "{}\n\n[... truncated: showing first {end} of {} bytes]",
        &result[..end],
        result.len()
    )
}

// ─── Demo Responses ─────────────────────────────────────────────────────────

/// Deterministic stand-in for a tool result when the worker is unavailable.
/// Same name and arguments always give the same text.
pub fn demo_response(name: &str, args: &Value) -> String {
    let text = match name {
        "gmail_send_message" => format!(
            "Email sent to {} with subject \"{}\".",
            arg(args, "to"),
            arg(args, "subject")
        ),
        "gmail_list_messages" => match args.get("query") {
            Some(_) => format!("No messages matching \"{}\" in the demo inbox.", arg(args, "query")),
            None => "The demo inbox has no recent messages.".to_string(),
        },
        "gmail_read_message" => format!("Message {} is not available in demo mode.", arg(args, "messageId")),
        "drive_search_files" => format!("No Drive files matching \"{}\" in demo mode.", arg(args, "query")),
        "drive_read_file" => format!("File {} cannot be read in demo mode.", arg(args, "fileId")),
        "drive_create_file" => format!("File \"{}\" created in Drive.", arg(args, "name")),
        "calendar_list_events" => format!(
            "No events between {} and {} in the demo calendar.",
            arg(args, "timeMin"),
            arg(args, "timeMax")
        ),
        "calendar_create_event" => format!(
            "Event \"{}\" scheduled from {} to {}.",
            arg(args, "summary"),
            arg(args, "start"),
            arg(args, "end")
        ),
        "calendar_get_availability" => format!(
            "You are free between {} and {} (demo calendar).",
            arg(args, "timeMin"),
            arg(args, "timeMax")
        ),
        _ => format!("Tool {name} was called with arguments {args}."),
    };
    format!("[Demo mode] {text}")
}

/// Display form of one argument.
fn arg(args: &Value, key: &str) -> String {
    match args.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "(not specified)".to_string(),
        Some(other) => other.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::catalog::static_fallback_tools;
    use crate::mcp_client::types::ToolDefinition;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn catalog_with(tools: Vec<ToolDefinition>) -> Arc<CapabilityCatalog> {
        let catalog = Arc::new(CapabilityCatalog::new());
        catalog.replace(CatalogSource::Dynamic, tools);
        catalog
    }

    fn echo_tool() -> ToolDefinition {
        ToolDefinition::new(
            "echo",
            "Echo text",
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        )
    }

    /// A Ready router whose fake worker answers `tools/call` with
    /// `reply(arguments)`. Returns the router and a request counter.
    fn ready_router<F>(catalog: Arc<CapabilityCatalog>, reply: F) -> (ToolRouter, Arc<AtomicUsize>)
    where
        F: Fn(&Value) -> Value + Send + 'static,
    {
        scripted_router(catalog, move |frame| {
            Some(json!({
                "jsonrpc": "2.0",
                "id": frame["id"],
                "result": reply(&frame["params"]["arguments"]),
            }))
        })
    }

    /// A Ready router whose fake worker writes `respond(request)` back for
    /// every request frame, or stays silent on `None`.
    fn scripted_router<F>(
        catalog: Arc<CapabilityCatalog>,
        respond: F,
    ) -> (ToolRouter, Arc<AtomicUsize>)
    where
        F: Fn(&Value) -> Option<Value> + Send + 'static,
    {
        let transport = Arc::new(RpcTransport::new("fake", Duration::from_millis(300)));
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        transport.attach(client_write);

        let reader = transport.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(client_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                reader.handle_line(&line);
            }
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        tokio::spawn(async move {
            let (server_read, mut server_write) = tokio::io::split(server);
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let frame: Value = serde_json::from_str(&line).unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                let Some(out) = respond(&frame) else {
                    continue;
                };
                let mut bytes = serde_json::to_vec(&out).unwrap();
                bytes.push(b'\n');
                server_write.write_all(&bytes).await.unwrap();
            }
        });

        // The receiver keeps the last value after the sender is dropped.
        let (_, rx) = watch::channel(ProcessState::Ready);
        (ToolRouter::new(transport, catalog, rx), calls)
    }

    fn offline_router(state: ProcessState) -> ToolRouter {
        let transport = Arc::new(RpcTransport::new("offline", Duration::from_millis(100)));
        let (_, rx) = watch::channel(state);
        ToolRouter::new(transport, catalog_with(vec![echo_tool()]), rx)
    }

    #[tokio::test]
    async fn test_not_ready_returns_demo_without_transport_call() {
        let router = offline_router(ProcessState::Starting);
        let args = json!({"to": "a@b.com", "subject": "S"});

        let first = router.invoke("gmail_send_message", &args).await;
        let second = router.invoke("gmail_send_message", &args).await;

        assert!(first.contains("a@b.com"));
        assert!(first.contains('S'));
        assert_eq!(first, second);
        assert_eq!(router.transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_success_normalizes_content_parts() {
        let (router, calls) = ready_router(catalog_with(vec![echo_tool()]), |args| {
            json!({"content": [
                {"type": "text", "text": args["text"]},
                {"type": "text", "text": "second part"}
            ]})
        });

        let outcome = router.dispatch("echo", &json!({"text": "hello"})).await;
        assert_eq!(outcome, ToolOutcome::Success("hello\nsecond part".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_is_error_result_becomes_failure() {
        let (router, _) = ready_router(catalog_with(vec![echo_tool()]), |_| {
            json!({"content": [{"type": "text", "text": "quota exceeded"}], "isError": true})
        });

        let text = router.invoke("echo", &json!({"text": "x"})).await;
        assert_eq!(text, "Tool 'echo' failed: quota exceeded");
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_before_sending() {
        let (router, calls) = ready_router(catalog_with(vec![echo_tool()]), |_| json!("unused"));

        let outcome = router.dispatch("echo", &json!({})).await;
        assert!(matches!(outcome, ToolOutcome::Failure(ref m) if m.contains("text")));

        let unknown = router.dispatch("nope", &json!({})).await;
        assert!(matches!(unknown, ToolOutcome::Failure(ref m) if m.contains("unknown tool")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_detached_transport_falls_back_to_demo() {
        let router = offline_router(ProcessState::Ready);
        let outcome = router.dispatch("echo", &json!({"text": "hi"})).await;
        match outcome {
            ToolOutcome::Success(text) => assert!(text.starts_with("[Demo mode]")),
            other => panic!("expected demo success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_silent_worker_times_out_into_demo_response() {
        let (router, calls) = scripted_router(catalog_with(static_fallback_tools()), |_| None);
        let args = json!({"to": "a@b.com", "subject": "S", "body": "B"});

        let text = router.invoke("gmail_send_message", &args).await;
        assert_eq!(text, demo_response("gmail_send_message", &args));
        assert!(text.contains("a@b.com"));
        assert!(text.contains('S'));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(router.transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_json_rpc_error_object_becomes_demo_response() {
        let (router, calls) = scripted_router(catalog_with(static_fallback_tools()), |frame| {
            Some(json!({
                "jsonrpc": "2.0",
                "id": frame["id"],
                "error": {"code": -32603, "message": "backend exploded"}
            }))
        });
        let args = json!({"summary": "Standup", "start": "09:00", "end": "09:15"});

        let outcome = router.dispatch("calendar_create_event", &args).await;
        assert_eq!(
            outcome,
            ToolOutcome::Success(demo_response("calendar_create_event", &args))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_large_result_is_truncated() {
        let (router, _) = ready_router(catalog_with(vec![echo_tool()]), |_| {
            json!({"text": "é".repeat(5_000)})
        });
        let text = router.invoke("echo", &json!({"text": "x"})).await;
        assert!(text.contains("[... truncated"));
        assert!(text.len() < MAX_TOOL_RESULT_BYTES + 100);
    }

    #[test]
    fn test_normalize_shapes() {
        assert_eq!(
            normalize_result(&json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}])),
            "a\nb"
        );
        assert_eq!(normalize_result(&json!({"text": "plain"})), "plain");
        assert_eq!(normalize_result(&json!("just a string")), "just a string");
        assert_eq!(normalize_result(&json!({"count": 3})), r#"{"count":3}"#);
        assert_eq!(normalize_result(&json!(42)), "42");
        assert_eq!(normalize_result(&Value::Null), "No result returned.");
        // Parts without text fall through to the JSON form.
        assert_eq!(normalize_result(&json!([{"type": "image"}])), r#"[{"type":"image"}]"#);
    }

    #[test]
    fn test_demo_responses_are_deterministic_per_tool() {
        let event = json!({"summary": "Standup", "start": "09:00", "end": "09:15"});
        let text = demo_response("calendar_create_event", &event);
        assert!(text.contains("Standup"));
        assert!(text.contains("09:15"));
        assert_eq!(text, demo_response("calendar_create_event", &event));

        let unknown = demo_response("slack_post", &json!({"b": 1, "a": 2}));
        assert!(unknown.contains("slack_post"));
        assert_eq!(unknown, demo_response("slack_post", &json!({"a": 2, "b": 1})));

        assert!(demo_response("drive_read_file", &json!({})).contains("(not specified)"));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let input = "é".repeat(MAX_TOOL_RESULT_BYTES);
        let out = truncate_tool_result(&input, "t");
        assert!(out.starts_with(&"é".repeat(MAX_TOOL_RESULT_BYTES / 2)));
        assert!(out.contains(&format!("of {} bytes", input.len())));
        assert_eq!(truncate_tool_result("short", "t"), "short");
    }
}
