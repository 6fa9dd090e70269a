//! Agent core: everything between a user message and the final answer.
//!
//! Submodules:
//! - `conversation`: The completion / tool-execution loop for one turn
//! - `tool_router`: Dispatches model tool calls to the worker, with demo fallbacks
//! - `usage`: Token accumulation and cost estimation
//! - `session`: Chat sessions, attachments, allowlists and credentials
//! - `history`: The chat history store seam
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod errors;
pub mod history;
pub mod session;
pub mod tool_router;
pub mod types;
pub mod usage;

// Re-exports for convenience
pub use conversation::ConversationLoop;
pub use errors::AgentError;
pub use history::{ChatContext, ChatHistoryStore, InMemoryHistoryStore};
pub use session::{ChatSession, CredentialStore, InMemoryCredentialStore};
pub use tool_router::ToolRouter;
pub use types::{Attachment, StoredMessage, ToolCallRecord, ToolOutcome, TurnOutcome, TurnUsage};
