//! Client side of the tool-server protocol.
//!
//! A tool server is a separate program exposing callable tools over
//! newline-delimited JSON-RPC on its stdio. [`ToolServerConnection`] owns one
//! such server: it launches the process, discovers its tools, invokes them
//! with a timeout and tears the process down again.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{LaunchSpec, ToolServerConnection, DEFAULT_TOOL_TIMEOUT};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = ToolServerConnection::new(
//!     "fs",
//!     "Filesystem",
//!     LaunchSpec {
//!         command: "mcp-server-filesystem".into(),
//!         args: vec!["/tmp".into()],
//!         ..Default::default()
//!     },
//! );
//!
//! for tool in conn.connect().await? {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let text = conn
//!     .invoke("list_directory", &serde_json::json!({ "path": "/tmp" }), DEFAULT_TOOL_TIMEOUT)
//!     .await?;
//! println!("{text}");
//!
//! conn.disconnect().await;
//! # Ok(())
//! # }
//! ```

mod connection;
mod error;
mod launch;
mod protocol;
mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use connection::{
    ConnectionState, DEFAULT_TOOL_TIMEOUT, HANDSHAKE_TIMEOUT, ServerId, ToolServerConnection,
};
pub use error::{ConnectError, Error, ExecError, Result};
pub use launch::{Connector, LaunchSpec, ProcessConnector, Transport, resolve_executable};
pub use protocol::{CallToolResult, JsonRpcError, PROTOCOL_VERSION, Tool, ToolContent};
pub use transport::MAX_OUTPUT_SIZE;
