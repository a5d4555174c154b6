//! The configuration-store interface consumed by the runtime.

use std::collections::BTreeSet;

use crate::{LogMessage, ModelCredentials, Result, ServerSpec, SessionId};

/// Persistent configuration: tool servers, approvals, models and message logs.
///
/// Implementations serialize their own writes; callers may share one store
/// between sessions.
pub trait ConfigStore: Send + Sync {
    /// Servers active for a session, in registration order.
    ///
    /// Without an explicit selection every enabled server is active.
    fn active_tool_servers(&self, session: SessionId) -> Result<Vec<ServerSpec>>;

    /// Tool names pre-authorized on `server_id`.
    fn auto_approval(&self, server_id: &str) -> Result<BTreeSet<String>>;

    /// Replace the pre-authorized set of `server_id`.
    fn set_auto_approval(&self, server_id: &str, tools: &BTreeSet<String>) -> Result<()>;

    /// Credentials for `model_id`, or [`Error::NotFound`](crate::Error::NotFound).
    fn model_credentials(&self, model_id: &str) -> Result<ModelCredentials>;

    /// Insert or update a server. Updating keeps its registration position.
    fn upsert_server(&self, spec: &ServerSpec) -> Result<()>;

    /// All servers, in registration order.
    fn servers(&self) -> Result<Vec<ServerSpec>>;

    fn upsert_model(&self, model_id: &str, credentials: &ModelCredentials) -> Result<()>;

    /// Restrict a session to the given servers. An empty list clears the selection.
    fn set_session_servers(&self, session: SessionId, server_ids: &[String]) -> Result<()>;

    fn append_message(&self, session: SessionId, message: &LogMessage) -> Result<()>;

    fn load_messages(&self, session: SessionId) -> Result<Vec<LogMessage>>;

    /// Drop a session's messages and server selection.
    fn delete_session(&self, session: SessionId) -> Result<()>;
}

/// Filter `servers` down to a session's selection.
pub(crate) fn select_active(servers: Vec<ServerSpec>, selection: &[String]) -> Vec<ServerSpec> {
    if selection.is_empty() {
        servers.into_iter().filter(|s| s.enabled).collect()
    } else {
        servers
            .into_iter()
            .filter(|s| selection.iter().any(|id| id == &s.id))
            .collect()
    }
}
