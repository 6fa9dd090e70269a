//! ToolBridge: the assembled bridge.
//!
//! Owns one [`ProcessSupervisor`] and one [`ChatSession`] wired to it, and
//! exposes the operations a host application needs: start, status,
//! restart, login, turns and shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agent_core::history::{ChatContext, ChatHistoryStore, InMemoryHistoryStore};
use crate::agent_core::session::{ChatSession, CredentialStore, InMemoryCredentialStore};
use crate::agent_core::types::{Attachment, TurnOutcome};
use crate::agent_core::{AgentError, ConversationLoop, ToolRouter};
use crate::config::BridgeConfig;
use crate::inference::types::ChatMessage;
use crate::inference::CompletionService;
use crate::mcp_client::types::ProcessState;
use crate::mcp_client::{BridgeError, CatalogSource, ProcessSupervisor};

/// Catalog poll interval while waiting for the handshake.
const CATALOG_POLL: Duration = Duration::from_millis(25);

/// Health-check view of the bridge.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub state: ProcessState,
    pub ready: bool,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub catalog_source: CatalogSource,
    pub catalog_size: usize,
    pub tool_names: Vec<String>,
    pub last_started_at: Option<DateTime<Utc>>,
}

pub struct ToolBridge {
    config: BridgeConfig,
    supervisor: ProcessSupervisor,
    session: ChatSession,
    credentials: Arc<dyn CredentialStore>,
}

impl ToolBridge {
    /// A bridge with in-memory history and credential stores.
    pub fn new(config: BridgeConfig, completion: Arc<dyn CompletionService>) -> Self {
        Self::with_stores(
            config,
            completion,
            Arc::new(InMemoryHistoryStore::new()),
            Arc::new(InMemoryCredentialStore::new()),
        )
    }

    pub fn with_stores(
        config: BridgeConfig,
        completion: Arc<dyn CompletionService>,
        history: Arc<dyn ChatHistoryStore>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(config.worker.clone());
        let router = ToolRouter::for_supervisor(&supervisor);
        let conversation = ConversationLoop::new(
            completion,
            router,
            config.model.completion_options(),
            &config.agent,
        );
        let session = ChatSession::new(history, conversation, config.agent.enabled_tool_set());

        Self {
            config,
            supervisor,
            session,
            credentials,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn router(&self) -> &ToolRouter {
        self.session.conversation().router()
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    pub async fn start(&self) -> Result<(), BridgeError> {
        self.supervisor.start().await
    }

    /// Wait until the catalog has been populated (dynamically or from the
    /// fallback). Returns `false` on timeout.
    pub async fn wait_for_catalog(&self, timeout: Duration) -> bool {
        let catalog = self.supervisor.catalog();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if catalog.snapshot().source() != CatalogSource::Empty {
                return true;
            }
            if self.supervisor.state() == ProcessState::Stopped
                || tokio::time::Instant::now() >= deadline
            {
                return false;
            }
            tokio::time::sleep(CATALOG_POLL).await;
        }
    }

    pub fn status(&self) -> BridgeStatus {
        let worker = self.supervisor.status();
        let snapshot = self.supervisor.catalog().snapshot();
        BridgeStatus {
            ready: worker.state == ProcessState::Ready,
            state: worker.state,
            pid: worker.pid,
            restart_count: worker.restart_count,
            catalog_source: snapshot.source(),
            catalog_size: snapshot.len(),
            tool_names: snapshot.tool_names().into_iter().map(String::from).collect(),
            last_started_at: worker.last_started_at,
        }
    }

    pub async fn restart(&self) -> Result<(), BridgeError> {
        self.supervisor.restart().await
    }

    /// Respawn the worker with the credentials stored for `session_id`.
    ///
    /// Returns `Ok(false)` and leaves the worker untouched when the session
    /// has no credentials.
    pub async fn login(&self, session_id: &str) -> Result<bool, BridgeError> {
        let Some(credentials) = self.credentials.credentials(session_id).await else {
            tracing::warn!(session_id, "no credentials for session, worker not restarted");
            return Ok(false);
        };
        tracing::info!(session_id, "restarting worker with session credentials");
        self.supervisor
            .restart_with_credentials(Some(credentials))
            .await?;
        Ok(true)
    }

    /// Drop injected credentials and respawn the worker without them.
    pub async fn logout(&self) -> Result<(), BridgeError> {
        self.supervisor.restart_with_credentials(None).await
    }

    /// Run one turn over caller-supplied history, offering the configured
    /// tool set.
    pub async fn run_turn(
        &self,
        history: &[ChatMessage],
        user_message: &str,
    ) -> Result<TurnOutcome, AgentError> {
        let snapshot = self.supervisor.catalog().snapshot();
        let catalog = match self.config.agent.enabled_tool_set() {
            Some(allowed) if !allowed.is_empty() => snapshot.filtered(&allowed),
            _ => (*snapshot).clone(),
        };
        self.session
            .conversation()
            .run_turn(history, user_message, &catalog)
            .await
    }

    /// Run one turn against stored history. See [`ChatSession::handle_message`].
    pub async fn handle_message(
        &self,
        ctx: &ChatContext,
        message: &str,
        attachments: &[Attachment],
        enabled_tools: Option<&HashSet<String>>,
    ) -> Result<TurnOutcome, AgentError> {
        self.session
            .handle_message(ctx, message, attachments, enabled_tools)
            .await
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}
