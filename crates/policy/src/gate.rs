//! Human-in-the-loop authorization of tool calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use storage::ConfigStore;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{ApprovalSet, Error, Result};

/// Longest argument summary shown to the user.
const SUMMARY_LIMIT: usize = 200;

/// A tool call waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub correlation_id: Uuid,
    pub tool_name: String,
    pub server_id: String,
    /// Serialized JSON arguments.
    pub arguments: String,
}

impl AuthorizationRequest {
    /// Arguments cut to a displayable length.
    pub fn arguments_summary(&self) -> String {
        if self.arguments.chars().count() <= SUMMARY_LIMIT {
            return self.arguments.clone();
        }
        let mut summary: String = self.arguments.chars().take(SUMMARY_LIMIT).collect();
        summary.push('…');
        summary
    }
}

/// Outcome of an authorization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// On the server's auto-approval list; nobody was asked.
    PreAuthorized,
    /// The user allowed this call, and with `permanent` every future one.
    Approved { permanent: bool },
    Denied,
    /// The owning generation was cancelled while waiting.
    Abandoned,
}

impl Decision {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Decision::PreAuthorized | Decision::Approved { .. })
    }
}

struct Pending {
    tool_name: String,
    server_id: String,
    reply: oneshot::Sender<Decision>,
}

/// Mediates tool authorization between the tool loop and the user.
///
/// Requests are pushed to the receiver returned by [`AuthorizationGate::new`];
/// the presentation layer answers them with [`AuthorizationGate::submit_decision`].
pub struct AuthorizationGate {
    store: Arc<dyn ConfigStore>,
    approvals: Mutex<HashMap<String, ApprovalSet>>,
    pending: Mutex<HashMap<Uuid, Pending>>,
    events: mpsc::UnboundedSender<AuthorizationRequest>,
}

impl AuthorizationGate {
    pub fn new(store: Arc<dyn ConfigStore>) -> (Self, mpsc::UnboundedReceiver<AuthorizationRequest>) {
        let (events, rx) = mpsc::unbounded_channel();
        let gate = Self {
            store,
            approvals: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            events,
        };
        (gate, rx)
    }

    /// Whether `tool` on `server` is on the auto-approval list.
    pub fn is_pre_authorized(&self, tool: &str, server: &str) -> bool {
        self.approval_set(server).permits(tool)
    }

    /// Ask for permission to run `tool` on `server`.
    ///
    /// Pre-authorized tools resolve without emitting a request or suspending.
    /// Otherwise an [`AuthorizationRequest`] is emitted and this waits for the
    /// matching decision, or resolves to [`Decision::Abandoned`] once `cancel`
    /// fires. Never fails: with no listener the call is denied.
    pub async fn request_authorization(
        &self,
        tool: &str,
        server: &str,
        arguments: &str,
        cancel: &CancellationToken,
    ) -> Decision {
        if self.is_pre_authorized(tool, server) {
            debug!(tool, server, "Tool is pre-authorized");
            return Decision::PreAuthorized;
        }
        if cancel.is_cancelled() {
            return Decision::Abandoned;
        }

        let correlation_id = Uuid::new_v4();
        let (reply, decided) = oneshot::channel();
        self.pending().insert(
            correlation_id,
            Pending {
                tool_name: tool.to_string(),
                server_id: server.to_string(),
                reply,
            },
        );
        let _slot = PendingSlot {
            gate: self,
            correlation_id,
        };

        let request = AuthorizationRequest {
            correlation_id,
            tool_name: tool.to_string(),
            server_id: server.to_string(),
            arguments: arguments.to_string(),
        };
        if self.events.send(request).is_err() {
            warn!(tool, server, "Nobody is listening for authorization requests; denying");
            return Decision::Denied;
        }
        debug!(tool, server, %correlation_id, "Awaiting authorization");

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(tool, server, %correlation_id, "Authorization abandoned");
                Decision::Abandoned
            }
            decision = decided => decision.unwrap_or(Decision::Denied),
        }
    }

    /// Answer a pending request.
    ///
    /// A permanent approval is persisted before returning; if persisting
    /// fails the call in flight is still approved and the error is returned.
    pub fn submit_decision(&self, correlation_id: Uuid, authorized: bool, permanent: bool) -> Result<()> {
        let pending = self
            .pending()
            .remove(&correlation_id)
            .ok_or(Error::UnknownCorrelation(correlation_id))?;

        let decision = if authorized {
            Decision::Approved { permanent }
        } else {
            Decision::Denied
        };
        info!(
            tool = %pending.tool_name,
            server = %pending.server_id,
            ?decision,
            "Authorization decided"
        );
        // The requester may have been cancelled in the meantime.
        let _ = pending.reply.send(decision);

        if authorized && permanent {
            self.record_permanent_grant(&pending.tool_name, &pending.server_id)?;
        }
        Ok(())
    }

    /// Add `tool` to the auto-approval set of `server` and persist it.
    pub fn record_permanent_grant(&self, tool: &str, server: &str) -> Result<()> {
        let mut approvals = self.approvals();
        let mut set = match approvals.get(server) {
            Some(set) => set.clone(),
            None => ApprovalSet::new(self.store.auto_approval(server)?),
        };
        if set.grant(tool) {
            self.store.set_auto_approval(server, set.tools())?;
            info!(tool, server, "Tool permanently approved");
        }
        approvals.insert(server.to_string(), set);
        Ok(())
    }

    /// Requests still waiting for a decision.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    fn approval_set(&self, server: &str) -> ApprovalSet {
        if let Some(set) = self.approvals().get(server) {
            return set.clone();
        }
        match self.store.auto_approval(server) {
            Ok(tools) => {
                let set = ApprovalSet::new(tools);
                self.approvals().insert(server.to_string(), set.clone());
                set
            }
            Err(error) => {
                warn!(server, %error, "Failed to load auto-approvals");
                ApprovalSet::default()
            }
        }
    }

    fn approvals(&self) -> MutexGuard<'_, HashMap<String, ApprovalSet>> {
        self.approvals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<Uuid, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a pending request when its requester goes away.
struct PendingSlot<'a> {
    gate: &'a AuthorizationGate,
    correlation_id: Uuid,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.gate.pending().remove(&self.correlation_id);
    }
}
