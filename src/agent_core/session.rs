//! Chat sessions: history, attachments, tool allowlists and credentials
//! around a single [`ConversationLoop`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::inference::types::ChatMessage;
use crate::mcp_client::SessionCredentials;

use super::conversation::ConversationLoop;
use super::errors::AgentError;
use super::history::{ChatContext, ChatHistoryStore};
use super::types::{Attachment, StoredMessage, TurnOutcome};

/// Stored in history when the user sends only attachments.
const ATTACHMENT_ONLY_PLACEHOLDER: &str = "File upload";

/// Append extracted attachment text to the user's message.
pub fn compose_user_message(message: &str, attachments: &[Attachment]) -> String {
    let mut full = message.to_string();
    if attachments.is_empty() {
        return full;
    }
    full.push_str("\n\nAttached files:\n");
    for file in attachments {
        full.push_str(&format!("\n--- {} ---\n{}\n", file.filename, file.content));
    }
    full
}

/// Runs turns against stored chat history.
pub struct ChatSession {
    history: Arc<dyn ChatHistoryStore>,
    conversation: ConversationLoop,
    enabled_tools: Option<HashSet<String>>,
}

impl ChatSession {
    pub fn new(
        history: Arc<dyn ChatHistoryStore>,
        conversation: ConversationLoop,
        enabled_tools: Option<HashSet<String>>,
    ) -> Self {
        Self {
            history,
            conversation,
            enabled_tools,
        }
    }

    pub fn conversation(&self) -> &ConversationLoop {
        &self.conversation
    }

    pub fn history(&self) -> &Arc<dyn ChatHistoryStore> {
        &self.history
    }

    /// Handle one user message in `ctx`.
    ///
    /// The user message is stored before the turn runs; the assistant reply
    /// only when the turn succeeds. `enabled_tools` overrides the configured
    /// allowlist for this message; an empty set offers every tool.
    pub async fn handle_message(
        &self,
        ctx: &ChatContext,
        message: &str,
        attachments: &[Attachment],
        enabled_tools: Option<&HashSet<String>>,
    ) -> Result<TurnOutcome, AgentError> {
        let prior: Vec<ChatMessage> = self
            .history
            .load(ctx)
            .await?
            .iter()
            .map(StoredMessage::to_chat_message)
            .collect();

        let stored_text = if message.trim().is_empty() && !attachments.is_empty() {
            ATTACHMENT_ONLY_PLACEHOLDER
        } else {
            message
        };
        self.history
            .append(ctx, StoredMessage::user(stored_text))
            .await?;

        let snapshot = self.conversation.router().catalog().snapshot();
        let allowlist = enabled_tools.or(self.enabled_tools.as_ref());
        let catalog = match allowlist {
            Some(allowed) if !allowed.is_empty() => snapshot.filtered(allowed),
            _ => (*snapshot).clone(),
        };

        tracing::info!(
            user_id = %ctx.user_id,
            chat_id = %ctx.chat_id,
            history_len = prior.len(),
            attachments = attachments.len(),
            offered_tools = catalog.len(),
            "handling chat message"
        );

        let full_message = compose_user_message(message, attachments);
        let outcome = self
            .conversation
            .run_turn(&prior, &full_message, &catalog)
            .await?;

        self.history
            .append(
                ctx,
                StoredMessage::assistant(
                    outcome.final_text.clone(),
                    self.conversation.model(),
                    outcome.tools_used.clone(),
                ),
            )
            .await?;

        Ok(outcome)
    }
}

// ─── Credentials ────────────────────────────────────────────────────────────

/// Source of per-session OAuth credentials handed to the worker on login.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credentials(&self, session_id: &str) -> Option<SessionCredentials>;
}

/// Credentials kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    sessions: Mutex<HashMap<String, SessionCredentials>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: impl Into<String>, credentials: SessionCredentials) {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session_id.into(), credentials);
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionCredentials> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id)
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn credentials(&self, session_id: &str) -> Option<SessionCredentials> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .cloned()
    }
}
