//! Tool authorization.
//!
//! Core principle: **a tool runs only after a human said so**, either for this
//! one call or permanently through the server's auto-approval set.
//!
//! ```no_run
//! use std::sync::Arc;
//! use policy::AuthorizationGate;
//! use storage::MemoryStore;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> policy::Result<()> {
//! let (gate, mut requests) = AuthorizationGate::new(Arc::new(MemoryStore::new()));
//! let gate = Arc::new(gate);
//!
//! let answering = gate.clone();
//! tokio::spawn(async move {
//!     while let Some(request) = requests.recv().await {
//!         let _ = answering.submit_decision(request.correlation_id, true, false);
//!     }
//! });
//!
//! let decision = gate
//!     .request_authorization("list_dir", "fs", r#"{"path":"."}"#, &CancellationToken::new())
//!     .await;
//! assert!(decision.is_authorized());
//! # Ok(())
//! # }
//! ```

mod approval;
mod error;
mod gate;

pub use approval::{ANY_TOOL, ApprovalSet};
pub use error::{Error, Result};
pub use gate::{AuthorizationGate, AuthorizationRequest, Decision};
