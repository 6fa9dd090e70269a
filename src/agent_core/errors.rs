//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;

/// Errors that abort a conversation turn.
///
/// Tool failures never appear here; the router folds them into the
/// conversation as text.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The completion service failed. The turn produces no answer.
    #[error("completion service failed: {source}")]
    CompletionService {
        #[source]
        source: InferenceError,
    },

    /// Loading or appending chat history failed.
    #[error("chat history error: {reason}")]
    History { reason: String },
}

impl From<InferenceError> for AgentError {
    fn from(source: InferenceError) -> Self {
        AgentError::CompletionService { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_error_keeps_source() {
        let err: AgentError = InferenceError::HttpError {
            status: 401,
            body: "bad key".into(),
        }
        .into();
        assert!(err.to_string().contains("HTTP 401"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
