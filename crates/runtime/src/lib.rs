//! Parley runtime: chat sessions, tool orchestration and model streaming.
//!
//! # Overview
//!
//! The runtime is organized around these concepts:
//!
//! - **SessionRegistry**: owns every [`ChatSession`] and is the entry point
//!   for sending messages, aborting generations and answering
//!   authorization requests.
//! - **ToolCallLoop**: per message, streams the model's answer, runs the
//!   tools it asked for (after authorization) and streams the final answer.
//! - **ServerManager** / **ToolCatalog**: tool-server connections and the
//!   tools they export, with first-registered-wins name resolution.
//! - **ModelBackend**: a trait abstracting streaming model providers; an
//!   OpenAI-compatible implementation is included.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use policy::AuthorizationGate;
//! use runtime::{OpenAiBackend, SessionRegistry, SessionSettings};
//! use storage::SqliteStore;
//!
//! # async fn example() -> runtime::Result<()> {
//! let store = Arc::new(SqliteStore::open("parley.db")?);
//! let (gate, _authorization_requests) = AuthorizationGate::new(store.clone());
//! let registry = SessionRegistry::builder(OpenAiBackend::new(), store, Arc::new(gate)).build();
//!
//! let session = registry.create(SessionSettings::new("default"));
//! let reply = registry.send_message(session.id(), "Hello!").await?;
//! println!("{}", reply.content);
//! # Ok(())
//! # }
//! ```

mod accumulator;
mod backend;
mod catalog;
mod error;
mod presenter;
mod registry;
mod servers;
mod session;
#[cfg(test)]
mod testing;
mod tool_loop;

pub use accumulator::{StreamAccumulator, TextUpdate, ToolCallRequest};
pub use backend::{
    CompletionRequest, Fragment, FragmentStream, ModelBackend, OpenAiBackend, ToolCallDelta,
    ToolSpec,
};
pub use catalog::{ResolvedTool, ServerTools, ToolCatalog};
pub use error::{BackendError, Error, Result};
pub use presenter::{AnswerFragment, NullPresenter, Presenter, ToolPhase, ToolStatus};
pub use registry::{ABORTED_CONTENT, Reply, SessionRegistry, SessionRegistryBuilder};
pub use servers::{ServerManager, ServerStatus};
pub use session::{ChatSession, ConversationMode, SessionSettings};
pub use tool_loop::{ToolFailure, ToolOutcome};
