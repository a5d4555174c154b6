//! Push interface towards whatever displays the conversation.

use storage::SessionId;
use uuid::Uuid;

/// Live answer text for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerFragment {
    pub session_id: SessionId,
    pub request_id: Uuid,
    pub text: String,
    /// First text of a new assistant message.
    pub starts_message: bool,
}

/// Progress of one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolPhase {
    AwaitingAuthorization,
    Running,
    Succeeded,
    /// Ran, or could not run, and produced an error result.
    Failed(String),
    Refused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStatus {
    pub session_id: SessionId,
    pub request_id: Uuid,
    pub tool_name: String,
    pub phase: ToolPhase,
}

/// Receives display events. Calls must not block.
///
/// Authorization requests arrive separately, through the receiver returned
/// by [`policy::AuthorizationGate::new`].
pub trait Presenter: Send + Sync {
    fn on_answer_fragment(&self, fragment: AnswerFragment);

    fn on_tool_status(&self, status: ToolStatus);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPresenter;

impl Presenter for NullPresenter {
    fn on_answer_fragment(&self, _fragment: AnswerFragment) {}

    fn on_tool_status(&self, _status: ToolStatus) {}
}
