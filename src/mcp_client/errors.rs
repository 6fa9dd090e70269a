//! Worker-side error types.

use thiserror::Error;

/// Errors raised by the transport, the supervisor and the catalog.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The worker stream is unavailable or a frame could not be written.
    #[error("transport error for worker '{worker}': {reason}")]
    TransportError { worker: String, reason: String },

    /// A request passed its deadline without a response.
    #[error("request '{method}' (id {id}) timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        id: u64,
        timeout_ms: u64,
    },

    /// The worker process could not be started.
    #[error("failed to spawn worker '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The worker process exited while requests were in flight.
    #[error("worker '{name}' exited: {reason}")]
    ProcessExited { name: String, reason: String },

    /// The initialize / tool-listing exchange failed.
    #[error("worker '{name}' handshake failed: {reason}")]
    HandshakeFailed { name: String, reason: String },

    /// The worker answered with a JSON-RPC error object.
    #[error("worker error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not present in the active catalog.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// Tool arguments do not match the parameter schema.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The supervisor has been shut down and accepts no further transitions.
    #[error("worker '{name}' is stopped")]
    Stopped { name: String },

    /// Configuration error (bad command, unreadable config file).
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl BridgeError {
    /// Whether this error is a per-request deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }

    /// Whether the error means the worker stream itself is gone, as opposed
    /// to the worker rejecting a well-formed request.
    pub fn is_stream_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::TransportError { .. } | BridgeError::ProcessExited { .. }
        )
    }
}
