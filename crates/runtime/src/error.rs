use storage::SessionId;
use thiserror::Error;

/// Failure of a model backend call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// A short explanation suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Auth(_) => "The model rejected the credentials. Check the API key.".into(),
            Self::RateLimited(_) => "The model is rate limiting requests. Try again shortly.".into(),
            Self::Server { status, .. } => format!("The model server failed (HTTP {status})."),
            Self::Other(message) => format!("The model request failed: {message}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("unknown tool server: {0}")]
    UnknownServer(String),

    #[error(transparent)]
    Connect(#[from] mcp::ConnectError),

    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error(transparent)]
    Policy(#[from] policy::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
