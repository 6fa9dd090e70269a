//! Completion client: OpenAI-compatible chat completions.
//!
//! This module handles all communication with the completion endpoint:
//! - The [`CompletionService`] trait the conversation loop depends on
//! - A non-streaming HTTP implementation with usage parsing
//! - The `model:` configuration section

pub mod client;
pub mod config;
pub mod errors;
pub mod types;

// Re-exports for convenience
pub use client::{CompletionClient, CompletionService};
pub use config::ModelConfig;
pub use errors::InferenceError;
pub use types::{
    ChatMessage, CompletionOptions, CompletionResponse, Role, TokenUsage, ToolCallResponse,
    ToolDefinition,
};
