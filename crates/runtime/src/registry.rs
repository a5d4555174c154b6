//! Session ownership and the entry points used by the presentation layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mcp::{DEFAULT_TOOL_TIMEOUT, ServerId, Tool};
use policy::AuthorizationGate;
use storage::{ConfigStore, LogMessage, ModelCredentials, ServerSpec, SessionId};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::ModelBackend;
use crate::presenter::{NullPresenter, Presenter};
use crate::servers::ServerManager;
use crate::session::{ChatSession, Generation, SessionSettings};
use crate::tool_loop::{LoopOutcome, ToolCallLoop};
use crate::{Error, Result};

/// Content reported for a cancelled generation.
pub const ABORTED_CONTENT: &str = "<aborted>";

/// Result of [`SessionRegistry::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub content: String,
    pub aborted: bool,
}

impl Reply {
    fn aborted() -> Self {
        Self {
            content: ABORTED_CONTENT.to_string(),
            aborted: true,
        }
    }
}

/// Builder for a [`SessionRegistry`].
pub struct SessionRegistryBuilder<B> {
    backend: B,
    store: Arc<dyn ConfigStore>,
    gate: Arc<AuthorizationGate>,
    servers: Option<Arc<ServerManager>>,
    presenter: Arc<dyn Presenter>,
    tool_timeout: Duration,
}

impl<B: ModelBackend> SessionRegistryBuilder<B> {
    /// Share a server manager with other registries.
    pub fn servers(mut self, servers: Arc<ServerManager>) -> Self {
        self.servers = Some(servers);
        self
    }

    pub fn presenter(mut self, presenter: Arc<dyn Presenter>) -> Self {
        self.presenter = presenter;
        self
    }

    /// Time allowed for each tool call (30s by default).
    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn build(self) -> SessionRegistry<B> {
        SessionRegistry {
            backend: self.backend,
            store: self.store,
            gate: self.gate,
            servers: self.servers.unwrap_or_default(),
            presenter: self.presenter,
            tool_timeout: self.tool_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

/// Owns every chat session and drives their generations.
pub struct SessionRegistry<B> {
    backend: B,
    store: Arc<dyn ConfigStore>,
    gate: Arc<AuthorizationGate>,
    servers: Arc<ServerManager>,
    presenter: Arc<dyn Presenter>,
    tool_timeout: Duration,
    sessions: Mutex<HashMap<SessionId, Arc<ChatSession>>>,
}

impl<B: ModelBackend> SessionRegistry<B> {
    pub fn builder(
        backend: B,
        store: Arc<dyn ConfigStore>,
        gate: Arc<AuthorizationGate>,
    ) -> SessionRegistryBuilder<B> {
        SessionRegistryBuilder {
            backend,
            store,
            gate,
            servers: None,
            presenter: Arc::new(NullPresenter),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Start a new, empty session.
    pub fn create(&self, settings: SessionSettings) -> Arc<ChatSession> {
        let session = Arc::new(ChatSession::new(
            SessionId::new(),
            self.store.clone(),
            settings,
            Vec::new(),
        ));
        self.sessions().insert(session.id(), session.clone());
        info!(session = %session.id(), "Session created");
        session
    }

    /// Reopen a session from its persisted log.
    pub fn resume(&self, id: SessionId, settings: SessionSettings) -> Result<Arc<ChatSession>> {
        if let Some(existing) = self.get(id) {
            return Ok(existing);
        }
        let log = self.store.load_messages(id)?;
        let session = Arc::new(ChatSession::new(id, self.store.clone(), settings, log));
        self.sessions().insert(id, session.clone());
        info!(session = %id, messages = session.messages().len(), "Session resumed");
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<ChatSession>> {
        self.sessions().get(&id).cloned()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions().keys().copied().collect()
    }

    /// Cancel, forget and erase a session. Returns whether it existed.
    pub fn delete(&self, id: SessionId) -> Result<bool> {
        let Some(session) = self.sessions().remove(&id) else {
            return Ok(false);
        };
        session.abort();
        self.store.delete_session(id)?;
        info!(session = %id, "Session deleted");
        Ok(true)
    }

    /// Send a user message and run the conversation to its final answer.
    ///
    /// A generation already running on the session is cancelled first and
    /// reports an aborted [`Reply`].
    pub async fn send_message(&self, id: SessionId, text: &str) -> Result<Reply> {
        let session = self.get(id).ok_or(Error::SessionNotFound(id))?;
        let credentials = self.store.model_credentials(&session.settings().model_id)?;
        let specs = self.store.active_tool_servers(id)?;

        let generation = session.begin_generation();
        let request_id = Uuid::new_v4();
        info!(session = %id, request = %request_id, "Message received");

        let user = LogMessage::user(text);
        let messages = session.compose(&user, &credentials);
        if !session.append(&generation, user) {
            return Ok(Reply::aborted());
        }

        let result = self
            .generate(&session, &generation, &credentials, &specs, request_id, messages)
            .await;
        session.finish_generation(&generation);

        match result {
            Ok(LoopOutcome::Done(content)) => Ok(Reply {
                content,
                aborted: false,
            }),
            Ok(LoopOutcome::Cancelled) => {
                info!(session = %id, request = %request_id, "Generation cancelled");
                Ok(Reply::aborted())
            }
            Err(e) => {
                warn!(session = %id, request = %request_id, "Generation failed: {e}");
                Err(e)
            }
        }
    }

    async fn generate(
        &self,
        session: &ChatSession,
        generation: &Generation,
        credentials: &ModelCredentials,
        specs: &[ServerSpec],
        request_id: Uuid,
        messages: Vec<LogMessage>,
    ) -> Result<LoopOutcome> {
        tokio::select! {
            biased;
            () = generation.token.cancelled() => return Ok(LoopOutcome::Cancelled),
            () = self.servers.ensure_active(specs) => {}
        }
        let ids: Vec<ServerId> = specs.iter().map(|s| ServerId::new(s.id.as_str())).collect();
        let catalog = self.servers.catalog().restricted_to(&ids);

        ToolCallLoop {
            backend: &self.backend,
            servers: &self.servers,
            gate: &self.gate,
            presenter: self.presenter.as_ref(),
            session,
            generation,
            credentials,
            catalog: &catalog,
            request_id,
            tool_timeout: self.tool_timeout,
        }
        .run(messages)
        .await
    }

    /// Cancel the session's running generation. Returns whether one was running.
    pub fn abort(&self, id: SessionId) -> bool {
        self.get(id).is_some_and(|session| session.abort())
    }

    /// Answer an authorization request.
    pub fn submit_decision(&self, correlation_id: Uuid, authorized: bool, permanent: bool) -> Result<()> {
        Ok(self.gate.submit_decision(correlation_id, authorized, permanent)?)
    }

    /// Re-establish a tool server's connection.
    pub async fn reconnect(&self, server: &ServerId) -> Result<Vec<Tool>> {
        self.servers.reconnect(server).await
    }

    /// Cancel every generation and disconnect all servers.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions().values().cloned().collect();
        for session in sessions {
            session.abort();
        }
        self.servers.shutdown().await;
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn servers(&self) -> &Arc<ServerManager> {
        &self.servers
    }

    pub fn gate(&self) -> &Arc<AuthorizationGate> {
        &self.gate
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<ChatSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
