//! ConversationLoop: one user turn, from message to final answer.
//!
//! Responsibilities:
//! - Assemble system prompt, history and the new user message
//! - Alternate completion calls and tool execution until the model stops
//!   asking for tools or the round cap is reached
//! - Accumulate token usage and estimate cost
//!
//! A turn is strictly sequential. Tool calls from one assistant message run
//! in the order listed, without reordering or deduplication.

use std::sync::Arc;

use serde_json::Value;

use crate::config::AgentConfig;
use crate::inference::types::{ChatMessage, CompletionOptions, ToolCallResponse};
use crate::inference::CompletionService;
use crate::mcp_client::{CatalogSnapshot, CatalogSource};

use super::errors::AgentError;
use super::tool_router::ToolRouter;
use super::types::{ToolCallRecord, ToolOutcome, TurnOutcome};
use super::usage::UsageAccumulator;

// ─── Prompts ────────────────────────────────────────────────────────────────

const DEFAULT_SYSTEM_PREAMBLE: &str = "\
You are a helpful AI assistant with access to Google Workspace tools. You can help users with:
- Google Drive: search, read and create files
- Gmail: send emails and read messages
- Google Calendar: create events, list events and check availability

When users attach files, analyze their content and provide helpful insights.
Always be helpful, accurate, and professional.";

const TOOL_GUIDANCE: &str = "\
Call a tool only when it is needed to answer. If a tool reports a failure, \
tell the user what went wrong instead of retrying indefinitely.";

/// Build the system message from the preamble and the tool set.
pub fn build_system_prompt(preamble: Option<&str>, catalog: &CatalogSnapshot) -> String {
    format!(
        "{}\n\n{}\n\n{}",
        preamble.unwrap_or(DEFAULT_SYSTEM_PREAMBLE).trim_end(),
        catalog.capability_summary(),
        TOOL_GUIDANCE
    )
}

/// Final text when the round cap ends a turn and the model gave no text.
pub fn round_cap_notice(max_rounds: usize) -> String {
    format!(
        "I reached the limit of {max_rounds} tool-calling rounds for this message \
         before finishing. Ask me to continue if you need more."
    )
}

// ─── ConversationLoop ───────────────────────────────────────────────────────

/// Drives completion calls and tool execution for one turn at a time.
///
/// Shared across turns; each turn keeps its own messages and usage.
pub struct ConversationLoop {
    completion: Arc<dyn CompletionService>,
    router: ToolRouter,
    options: CompletionOptions,
    max_tool_rounds: usize,
    system_prompt: Option<String>,
}

impl ConversationLoop {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        router: ToolRouter,
        options: CompletionOptions,
        agent: &AgentConfig,
    ) -> Self {
        Self {
            completion,
            router,
            options,
            max_tool_rounds: agent.max_tool_rounds,
            system_prompt: agent.system_prompt.clone(),
        }
    }

    pub fn router(&self) -> &ToolRouter {
        &self.router
    }

    pub fn model(&self) -> &str {
        &self.options.model
    }

    /// Run one turn.
    ///
    /// `catalog` is the tool set offered to the model (already filtered by
    /// any allowlist). A completion failure aborts the turn with no partial
    /// answer; tool failures are folded into the conversation.
    pub async fn run_turn(
        &self,
        history: &[ChatMessage],
        user_message: &str,
        catalog: &CatalogSnapshot,
    ) -> Result<TurnOutcome, AgentError> {
        let tools = catalog.completion_tools();

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(build_system_prompt(
            self.system_prompt.as_deref(),
            catalog,
        )));
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(user_message));

        tracing::info!(
            model = %self.options.model,
            history_len = history.len(),
            tool_count = tools.len(),
            "turn started"
        );

        let mut usage = UsageAccumulator::new();
        let mut tools_used = Vec::new();
        let mut records = Vec::new();
        let mut rounds = 0usize;

        let (final_text, hit_round_cap) = loop {
            let response = self
                .completion
                .complete(&messages, &tools, &self.options)
                .await
                .map_err(|e| {
                    tracing::error!(round = rounds, error = %e, "completion failed, aborting turn");
                    AgentError::from(e)
                })?;
            usage.add(&response.usage);

            if !response.has_tool_calls() {
                break (response.content.unwrap_or_default(), false);
            }

            if rounds >= self.max_tool_rounds {
                tracing::warn!(
                    rounds,
                    pending_calls = response.tool_calls.len(),
                    "tool round cap reached, ending turn"
                );
                let text = response
                    .content
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| round_cap_notice(self.max_tool_rounds));
                break (text, true);
            }
            rounds += 1;

            messages.push(ChatMessage::assistant_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                let record = self.execute_call(call, catalog).await;
                messages.push(ChatMessage::tool_result(
                    &record.call_id,
                    &record.tool_name,
                    record.outcome.message_text(&record.tool_name),
                ));
                tools_used.push(record.tool_name.clone());
                records.push(record);
            }
        };

        let usage = usage.finish(&self.options.model);
        tracing::info!(
            rounds,
            completion_calls = usage.completion_calls,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            estimated_cost = ?usage.estimated_cost,
            tools_used = tools_used.len(),
            hit_round_cap,
            "turn finished"
        );

        Ok(TurnOutcome {
            final_text,
            tools_used,
            usage,
            tool_rounds: rounds,
            hit_round_cap,
            tool_calls: records,
        })
    }

    /// Run one call. Tools missing from the offered catalog are refused
    /// without reaching the router.
    async fn execute_call(&self, call: &ToolCallResponse, offered: &CatalogSnapshot) -> ToolCallRecord {
        let name = call.function.name.clone();
        tracing::info!(tool = %name, call_id = %call.id, "executing tool call");

        let (arguments, outcome) = match parse_arguments(&call.function.arguments) {
            Ok(args) if offered.source() != CatalogSource::Empty && !offered.contains(&name) => {
                tracing::warn!(tool = %name, "tool not offered in this turn, refusing call");
                (
                    args,
                    ToolOutcome::Failure(format!("tool '{name}' is not enabled for this conversation")),
                )
            }
            Ok(args) => {
                let outcome = self.router.dispatch(&name, &args).await;
                (args, outcome)
            }
            Err(reason) => {
                tracing::warn!(tool = %name, error = %reason, "unparsable tool arguments");
                (Value::Null, ToolOutcome::Failure(reason))
            }
        };

        ToolCallRecord {
            call_id: call.id.clone(),
            tool_name: name,
            arguments,
            outcome,
        }
    }
}

/// Tool-call arguments arrive as a JSON string; blank means no arguments.
fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw).map_err(|e| format!("invalid arguments JSON: {e}"))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
