//! Test doubles for the model backend and the presentation layer.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::stream::{self, StreamExt};
use storage::LogMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::BackendError;
use crate::backend::{CompletionRequest, Fragment, FragmentStream, ModelBackend};
use crate::presenter::{AnswerFragment, Presenter, ToolStatus};

pub(crate) type HeldSender = mpsc::UnboundedSender<Result<Fragment, BackendError>>;

enum Turn {
    Complete(Vec<Fragment>),
    Held(mpsc::UnboundedReceiver<Result<Fragment, BackendError>>),
    Fail(BackendError),
}

/// What the loop sent for one turn.
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub messages: Vec<LogMessage>,
    pub tools: Vec<String>,
}

/// Replays scripted turns in order. Unscripted turns answer with no text.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    turns: Mutex<VecDeque<Turn>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedBackend {
    pub fn respond(&self, fragments: Vec<Fragment>) {
        lock(&self.turns).push_back(Turn::Complete(fragments));
    }

    pub fn respond_text(&self, text: &str) {
        self.respond(vec![Fragment::Text(text.to_string())]);
    }

    /// A turn whose stream stays open until the returned sender is dropped.
    pub fn hold(&self) -> HeldSender {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.turns).push_back(Turn::Held(rx));
        tx
    }

    pub fn fail(&self, error: BackendError) {
        lock(&self.turns).push_back(Turn::Fail(error));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }
}

impl ModelBackend for ScriptedBackend {
    async fn stream_completion(
        &self,
        request: CompletionRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<FragmentStream, BackendError> {
        lock(&self.requests).push(RecordedRequest {
            messages: request.messages.to_vec(),
            tools: request.tools.iter().map(|t| t.name.clone()).collect(),
        });
        let turn = lock(&self.turns).pop_front();
        match turn.unwrap_or(Turn::Complete(Vec::new())) {
            Turn::Complete(fragments) => Ok(stream::iter(fragments.into_iter().map(Ok)).boxed()),
            Turn::Held(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .take_until(cancel.clone().cancelled_owned())
            .boxed()),
            Turn::Fail(error) => Err(error),
        }
    }
}

/// Records every display event.
#[derive(Default)]
pub(crate) struct RecordingPresenter {
    fragments: Mutex<Vec<AnswerFragment>>,
    statuses: Mutex<Vec<ToolStatus>>,
}

impl RecordingPresenter {
    pub fn fragments(&self) -> Vec<AnswerFragment> {
        lock(&self.fragments).clone()
    }

    pub fn statuses(&self) -> Vec<ToolStatus> {
        lock(&self.statuses).clone()
    }
}

impl Presenter for RecordingPresenter {
    fn on_answer_fragment(&self, fragment: AnswerFragment) {
        lock(&self.fragments).push(fragment);
    }

    fn on_tool_status(&self, status: ToolStatus) {
        lock(&self.statuses).push(status);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
