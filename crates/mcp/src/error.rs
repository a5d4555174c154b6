//! Tool-server error types.

use std::time::Duration;

use crate::protocol::JsonRpcError;
use thiserror::Error;

/// Transport-level failures of a single JSON-RPC exchange.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server exited unexpectedly")]
    ServerExited,

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("failed to (de)serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("output too large: {size} bytes (max {max})")]
    OutputTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The executable could not be found or started.
    #[error("launch failed: {0}")]
    LaunchFailed(String),

    /// The process started but the discovery handshake failed.
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

/// Why a tool invocation produced no result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("server is not connected")]
    NotConnected,

    #[error("tool call timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),

    #[error("{0}")]
    RemoteError(String),
}

impl From<Error> for ExecError {
    fn from(error: Error) -> Self {
        match error {
            Error::Timeout(after) => ExecError::TimedOut(after),
            Error::ServerExited => ExecError::NotConnected,
            other => ExecError::RemoteError(other.to_string()),
        }
    }
}
