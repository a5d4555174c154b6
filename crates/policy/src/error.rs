//! Authorization error types.

use thiserror::Error;
use uuid::Uuid;

/// Authorization errors.
///
/// Denials are not errors; they are ordinary [`Decision`](crate::Decision)s.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No pending request carries this correlation id (already answered,
    /// abandoned, or never issued).
    #[error("no pending authorization request {0}")]
    UnknownCorrelation(Uuid),

    /// Persisting an approval failed.
    #[error(transparent)]
    Store(#[from] storage::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
