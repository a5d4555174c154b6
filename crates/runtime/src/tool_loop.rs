//! Ask the model, run the tools it asked for, ask again.

use std::time::Duration;

use futures::StreamExt;
use mcp::ExecError;
use policy::{AuthorizationGate, Decision};
use serde_json::Value;
use storage::{LogMessage, ModelCredentials};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Result;
use crate::accumulator::{StreamAccumulator, ToolCallRequest};
use crate::backend::{CompletionRequest, ModelBackend, ToolSpec};
use crate::catalog::ToolCatalog;
use crate::presenter::{AnswerFragment, Presenter, ToolPhase, ToolStatus};
use crate::servers::ServerManager;
use crate::session::{ChatSession, Generation};

/// Where a loop run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopState {
    AwaitingFirstResponse,
    ExecutingTools,
    AwaitingFinalResponse,
    Done,
    Cancelled,
    Errored,
}

/// How one loop run ended, short of a backend failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoopOutcome {
    Done(String),
    Cancelled,
}

/// Why a tool call produced no result. The message is what the model sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolFailure {
    #[error("Error: tool '{0}' is not available")]
    NotFound(String),

    #[error("Error: invalid arguments: {0}")]
    MalformedArguments(String),

    #[error("Tool call refused by the user.")]
    Denied,

    #[error("Error: tool timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("Error: {0}")]
    RemoteError(String),

    #[error("Error: tool server is not connected")]
    NotConnected,
}

impl From<ExecError> for ToolFailure {
    fn from(error: ExecError) -> Self {
        match error {
            ExecError::NotConnected => Self::NotConnected,
            ExecError::TimedOut(after) => Self::TimedOut(after),
            ExecError::RemoteError(message) => Self::RemoteError(message),
        }
    }
}

/// Result of one tool call as recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Success(String),
    Failure(ToolFailure),
}

impl ToolOutcome {
    pub fn content(&self) -> String {
        match self {
            Self::Success(text) => text.clone(),
            Self::Failure(failure) => failure.to_string(),
        }
    }
}

/// One run of the loop, scoped to a single user message.
pub(crate) struct ToolCallLoop<'a, B> {
    pub(crate) backend: &'a B,
    pub(crate) servers: &'a ServerManager,
    pub(crate) gate: &'a AuthorizationGate,
    pub(crate) presenter: &'a dyn Presenter,
    pub(crate) session: &'a ChatSession,
    pub(crate) generation: &'a Generation,
    pub(crate) credentials: &'a ModelCredentials,
    pub(crate) catalog: &'a ToolCatalog,
    pub(crate) request_id: Uuid,
    pub(crate) tool_timeout: Duration,
}

impl<B: ModelBackend> ToolCallLoop<'_, B> {
    /// Drive the conversation to a final answer, starting from `messages`.
    pub(crate) async fn run(self, mut messages: Vec<LogMessage>) -> Result<LoopOutcome> {
        let result = self.drive(&mut messages).await;
        self.enter(match &result {
            Ok(LoopOutcome::Done(_)) => LoopState::Done,
            Ok(LoopOutcome::Cancelled) => LoopState::Cancelled,
            Err(_) => LoopState::Errored,
        });
        result
    }

    async fn drive(&self, messages: &mut Vec<LogMessage>) -> Result<LoopOutcome> {
        self.enter(LoopState::AwaitingFirstResponse);
        let tools = self.catalog.tool_specs();
        let Some((text, calls)) = self.stream_turn(messages, &tools).await? else {
            return Ok(LoopOutcome::Cancelled);
        };
        if calls.is_empty() {
            return Ok(self.finish(text));
        }

        self.enter(LoopState::ExecutingTools);
        let records = calls.iter().map(ToolCallRequest::record).collect();
        let request = LogMessage::assistant_tool_calls(text, records);
        if !self.session.append(self.generation, request.clone()) {
            return Ok(LoopOutcome::Cancelled);
        }
        messages.push(request);

        for call in &calls {
            if self.cancelled() {
                return Ok(LoopOutcome::Cancelled);
            }
            let Some(outcome) = self.execute(call).await else {
                return Ok(LoopOutcome::Cancelled);
            };
            let result = LogMessage::tool_result(call.id.as_str(), call.name.as_str(), outcome.content());
            if !self.session.append(self.generation, result.clone()) {
                return Ok(LoopOutcome::Cancelled);
            }
            messages.push(result);
        }

        self.enter(LoopState::AwaitingFinalResponse);
        if self.cancelled() {
            return Ok(LoopOutcome::Cancelled);
        }
        let Some((text, calls)) = self.stream_turn(messages, &[]).await? else {
            return Ok(LoopOutcome::Cancelled);
        };
        if !calls.is_empty() {
            warn!(count = calls.len(), "Ignoring tool calls in the final response");
        }
        Ok(self.finish(text))
    }

    /// Stream one model response. `None` once the generation is cancelled.
    async fn stream_turn(
        &self,
        messages: &[LogMessage],
        tools: &[ToolSpec],
    ) -> Result<Option<(String, Vec<ToolCallRequest>)>> {
        let token = &self.generation.token;
        let request = CompletionRequest {
            credentials: self.credentials,
            messages,
            tools,
        };

        let mut stream = tokio::select! {
            biased;
            () = token.cancelled() => return Ok(None),
            stream = self.backend.stream_completion(request, token) => stream?,
        };

        let mut accumulator = StreamAccumulator::new();
        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => return Ok(None),
                next = stream.next() => next,
            };
            match next {
                None => break,
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(fragment)) => {
                    let Some(update) = accumulator.on_fragment(fragment) else {
                        continue;
                    };
                    if token.is_cancelled() {
                        return Ok(None);
                    }
                    self.presenter.on_answer_fragment(AnswerFragment {
                        session_id: self.session.id(),
                        request_id: self.request_id,
                        text: update.text,
                        starts_message: update.starts_message,
                    });
                }
            }
        }

        if token.is_cancelled() {
            return Ok(None);
        }
        Ok(Some(accumulator.finalize()))
    }

    /// Run one tool call. `None` if the generation was cancelled meanwhile.
    async fn execute(&self, call: &ToolCallRequest) -> Option<ToolOutcome> {
        let Some(resolved) = self.catalog.resolve(&call.name) else {
            warn!(tool = %call.name, "Model requested an unknown tool");
            return Some(self.failed(call, ToolFailure::NotFound(call.name.clone())));
        };
        let server = resolved.server.clone();
        let tool = resolved.tool.name.clone();

        if let Err(reason) = validate_arguments(&resolved.tool.input_schema, &call.arguments) {
            return Some(self.failed(call, ToolFailure::MalformedArguments(reason)));
        }

        if !self.gate.is_pre_authorized(&tool, server.as_str()) {
            self.status(call, ToolPhase::AwaitingAuthorization);
        }
        let decision = self
            .gate
            .request_authorization(&tool, server.as_str(), &call.raw_arguments, &self.generation.token)
            .await;
        match decision {
            Decision::Abandoned => return None,
            Decision::Denied => {
                self.status(call, ToolPhase::Refused);
                return Some(ToolOutcome::Failure(ToolFailure::Denied));
            }
            Decision::PreAuthorized | Decision::Approved { .. } => {}
        }
        if self.cancelled() {
            return None;
        }

        self.status(call, ToolPhase::Running);
        debug!(tool = %tool, server = %server, "Running tool");
        let result = tokio::select! {
            biased;
            () = self.generation.token.cancelled() => return None,
            result = self.servers.invoke(&server, &tool, &call.arguments, self.tool_timeout) => result,
        };
        if self.cancelled() {
            return None;
        }

        match result {
            Ok(text) => {
                self.status(call, ToolPhase::Succeeded);
                Some(ToolOutcome::Success(text))
            }
            Err(e) => Some(self.failed(call, e.into())),
        }
    }

    fn finish(&self, text: String) -> LoopOutcome {
        if self.session.append(self.generation, LogMessage::assistant(text.as_str())) {
            LoopOutcome::Done(text)
        } else {
            LoopOutcome::Cancelled
        }
    }

    fn failed(&self, call: &ToolCallRequest, failure: ToolFailure) -> ToolOutcome {
        self.status(call, ToolPhase::Failed(failure.to_string()));
        ToolOutcome::Failure(failure)
    }

    fn status(&self, call: &ToolCallRequest, phase: ToolPhase) {
        self.presenter.on_tool_status(ToolStatus {
            session_id: self.session.id(),
            request_id: self.request_id,
            tool_name: call.name.clone(),
            phase,
        });
    }

    fn cancelled(&self) -> bool {
        self.generation.token.is_cancelled()
    }

    fn enter(&self, state: LoopState) {
        debug!(session = %self.session.id(), request = %self.request_id, ?state, "Tool loop");
    }
}

/// Check `arguments` against a tool's input schema.
///
/// Schemas that fail to compile are not enforced.
fn validate_arguments(schema: &Value, arguments: &Value) -> std::result::Result<(), String> {
    if !schema.is_object() {
        return Ok(());
    }
    let validator = match jsonschema::validator_for(schema) {
        Ok(validator) => validator,
        Err(e) => {
            warn!("Invalid tool schema, skipping validation: {e}");
            return Ok(());
        }
    };
    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .take(3)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
