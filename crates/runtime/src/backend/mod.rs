//! Model backend abstraction.
//!
//! A backend turns a conversation into a stream of [`Fragment`]s: answer
//! text, or pieces of tool calls keyed by their position in the response.

mod openai;

pub use openai::OpenAiBackend;

use crate::BackendError;
use futures::stream::BoxStream;
use serde_json::Value;
use std::future::Future;
use storage::{LogMessage, ModelCredentials};
use tokio_util::sync::CancellationToken;

/// A tool offered to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

/// One streaming completion call.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub credentials: &'a ModelCredentials,
    pub messages: &'a [LogMessage],
    /// Omitted from the call when empty.
    pub tools: &'a [ToolSpec],
}

/// Part of a tool call, identified by `index` within one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// A piece of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    ToolCall(ToolCallDelta),
}

pub type FragmentStream = BoxStream<'static, Result<Fragment, BackendError>>;

/// Trait for model backends.
pub trait ModelBackend: Send + Sync {
    /// Start a streaming completion.
    ///
    /// The stream ends early once `cancel` fires.
    fn stream_completion(
        &self,
        request: CompletionRequest<'_>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<FragmentStream, BackendError>> + Send;
}
