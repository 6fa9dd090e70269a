//! Chat history storage.
//!
//! The bridge does not own persistence; it reads and appends through
//! [`ChatHistoryStore`]. [`InMemoryHistoryStore`] backs the CLI and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::AgentError;
use super::types::StoredMessage;

/// Identifies one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatContext {
    pub user_id: String,
    pub chat_id: String,
}

impl ChatContext {
    pub fn new(user_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            chat_id: chat_id.into(),
        }
    }

    /// A fresh chat for `user_id` with a random id.
    pub fn new_chat(user_id: impl Into<String>) -> Self {
        Self::new(user_id, uuid::Uuid::new_v4().to_string())
    }
}

/// Where conversation history lives.
#[async_trait]
pub trait ChatHistoryStore: Send + Sync {
    /// Messages of the chat, oldest first. Unknown chats are empty.
    async fn load(&self, ctx: &ChatContext) -> Result<Vec<StoredMessage>, AgentError>;

    async fn append(&self, ctx: &ChatContext, message: StoredMessage) -> Result<(), AgentError>;
}

/// Process-local history, lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    chats: Mutex<HashMap<ChatContext, Vec<StoredMessage>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn chats(&self) -> std::sync::MutexGuard<'_, HashMap<ChatContext, Vec<StoredMessage>>> {
        self.chats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn chat_count(&self) -> usize {
        self.chats().len()
    }
}

#[async_trait]
impl ChatHistoryStore for InMemoryHistoryStore {
    async fn load(&self, ctx: &ChatContext) -> Result<Vec<StoredMessage>, AgentError> {
        Ok(self.chats().get(ctx).cloned().unwrap_or_default())
    }

    async fn append(&self, ctx: &ChatContext, message: StoredMessage) -> Result<(), AgentError> {
        self.chats().entry(ctx.clone()).or_default().push(message);
        Ok(())
    }
}
