//! Configuration and conversation storage.
//!
//! The runtime reads everything it needs to know about the outside world
//! through the [`ConfigStore`] trait: which tool servers a session uses,
//! which tools are pre-authorized on each server, how to reach a model, and
//! where to persist the conversation log.
//!
//! Two implementations are provided:
//!
//! - [`SqliteStore`]: durable, backed by a single SQLite file.
//! - [`MemoryStore`]: volatile, for tests and throwaway sessions.
//!
//! # Example
//!
//! ```no_run
//! use storage::{ConfigStore, LogMessage, SessionId, SqliteStore};
//!
//! let store = SqliteStore::open("parley.db")?;
//! let session = SessionId::new();
//! store.append_message(session, &LogMessage::user("Hello!"))?;
//!
//! for message in store.load_messages(session)? {
//!     println!("{:?}: {}", message.role, message.content);
//! }
//! # Ok::<(), storage::Error>(())
//! ```

mod config;
mod error;
mod memory;
mod sqlite;
mod types;

pub use config::ConfigStore;
pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{LogMessage, ModelCredentials, Role, ServerSpec, SessionId, ToolCallRecord};
