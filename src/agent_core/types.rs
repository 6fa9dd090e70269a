//! Shared types for the agent core.
//!
//! Tool outcomes, per-call records, turn results and the messages kept in
//! chat history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inference::types::{ChatMessage, Role};

// ─── Tool Calls ─────────────────────────────────────────────────────────────

/// Result of routing one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "text", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success(String),
    Failure(String),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    /// The text the model sees for this outcome.
    pub fn message_text(&self, tool_name: &str) -> String {
        match self {
            ToolOutcome::Success(text) => text.clone(),
            ToolOutcome::Failure(reason) => format!("Tool '{tool_name}' failed: {reason}"),
        }
    }
}

/// One executed tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub outcome: ToolOutcome,
}

// ─── Turn Result ────────────────────────────────────────────────────────────

/// Token usage and cost for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TurnUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Number of completion calls made.
    pub completion_calls: u32,
    /// USD, when the model has a known price.
    pub estimated_cost: Option<f64>,
}

impl TurnUsage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Everything a turn produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub final_text: String,
    /// Tool names in execution order, repeats included.
    pub tools_used: Vec<String>,
    pub usage: TurnUsage,
    /// Rounds that executed tool calls.
    pub tool_rounds: usize,
    /// `true` when the turn ended because the round cap was reached.
    pub hit_round_cap: bool,
    pub tool_calls: Vec<ToolCallRecord>,
}

// ─── History ────────────────────────────────────────────────────────────────

/// A user or assistant message as kept in chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            model: None,
            tools_used: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>, model: &str, tools_used: Vec<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            model: Some(model.to_string()),
            tools_used,
            created_at: Utc::now(),
        }
    }

    /// The completion-API form of this message.
    pub fn to_chat_message(&self) -> ChatMessage {
        match self.role {
            Role::System => ChatMessage::system(self.content.clone()),
            Role::Assistant => ChatMessage::assistant(self.content.clone()),
            Role::User | Role::Tool => ChatMessage::user(self.content.clone()),
        }
    }
}

/// Pre-extracted text of a file the user attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_text_names_the_tool() {
        let outcome = ToolOutcome::Failure("quota exceeded".into());
        assert!(!outcome.is_success());
        assert_eq!(
            outcome.message_text("drive_search_files"),
            "Tool 'drive_search_files' failed: quota exceeded"
        );
        assert_eq!(ToolOutcome::Success("ok".into()).message_text("x"), "ok");
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_value(ToolOutcome::Success("done".into())).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["text"], "done");
    }

    #[test]
    fn test_stored_message_to_chat_message() {
        let stored = StoredMessage::assistant("hi", "gpt-4", vec!["gmail_list_messages".into()]);
        let msg = stored.to_chat_message();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content.as_deref(), Some("hi"));
        assert!(msg.tool_calls.is_none());
    }
}
