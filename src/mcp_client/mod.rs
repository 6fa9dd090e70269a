//! Worker client: JSON-RPC over the worker process's stdio.
//!
//! This module handles:
//! - Framing, correlation and timeouts for JSON-RPC 2.0 over a byte stream
//! - Spawning, readiness detection and restart of the worker process
//! - Tool discovery and the static fallback catalog
//!
//! The [`ToolRouter`](crate::agent_core::ToolRouter) sits on top of this
//! module and is the only caller of `tools/call`.

pub mod catalog;
pub mod errors;
pub mod lifecycle;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use catalog::{static_fallback_tools, CapabilityCatalog, CatalogSnapshot, CatalogSource};
pub use errors::BridgeError;
pub use lifecycle::{ProcessSupervisor, WorkerStatus};
pub use transport::RpcTransport;
pub use types::{ProcessState, SessionCredentials, ToolDefinition};
