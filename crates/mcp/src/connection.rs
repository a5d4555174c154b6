//! Lifecycle of one tool server: launch, discovery, invocation, teardown.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::error::{ConnectError, ExecError};
use crate::launch::{Connector, LaunchSpec, ProcessConnector};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsResult, Tool,
};
use crate::transport::RpcClient;

/// Default time a tool invocation may take.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for each step of the discovery handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on `tools/list` pages followed during discovery.
const MAX_TOOL_PAGES: usize = 32;

/// Opaque identity of a configured tool server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ServerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

struct Inner {
    state: ConnectionState,
    tools: Vec<Tool>,
    client: Option<RpcClient>,
    child: Option<Child>,
    /// Bumped by every `connect` that starts a handshake.
    attempt: u64,
}

impl Inner {
    /// Demote a connected server whose channel has closed underneath us.
    fn observe_exit(&mut self) {
        let exited = self.state == ConnectionState::Connected
            && self.client.as_ref().is_none_or(RpcClient::is_closed);
        if exited {
            self.state = ConnectionState::Failed("server exited".into());
            self.tools.clear();
            self.client = None;
        }
    }
}

/// Owns one tool server's transport and its discovered tool list.
///
/// All methods take `&self`; the process handle and channel never leave the
/// connection.
pub struct ToolServerConnection {
    id: ServerId,
    name: String,
    connector: Box<dyn Connector>,
    inner: Mutex<Inner>,
}

impl ToolServerConnection {
    /// Connection to a server launched as a child process.
    pub fn new(id: impl Into<ServerId>, name: impl Into<String>, spec: LaunchSpec) -> Self {
        Self::with_connector(id, name, ProcessConnector::new(spec))
    }

    /// Connection whose transport comes from a custom connector.
    pub fn with_connector(
        id: impl Into<ServerId>,
        name: impl Into<String>,
        connector: impl Connector + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            connector: Box::new(connector),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                tools: Vec::new(),
                client: None,
                child: None,
                attempt: 0,
            }),
        }
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        let mut inner = self.inner();
        inner.observe_exit();
        inner.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Tools exported by the server; empty unless connected.
    pub fn tools(&self) -> Vec<Tool> {
        let mut inner = self.inner();
        inner.observe_exit();
        inner.tools.clone()
    }

    /// The reason for the last failure, for display.
    pub fn last_error(&self) -> Option<String> {
        match self.state() {
            ConnectionState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Launch the server (if not already running) and discover its tools.
    ///
    /// Dropping the returned future mid-handshake leaves the connection
    /// `Failed`, so a later `connect` starts over.
    pub async fn connect(&self) -> Result<Vec<Tool>, ConnectError> {
        let attempt = {
            let mut inner = self.inner();
            inner.observe_exit();
            match inner.state {
                ConnectionState::Connected => return Ok(inner.tools.clone()),
                ConnectionState::Connecting => {
                    return Err(ConnectError::ProtocolError(
                        "connection attempt already in progress".into(),
                    ));
                }
                _ => inner.state = ConnectionState::Connecting,
            }
            inner.attempt += 1;
            inner.attempt
        };
        let _attempt = AttemptGuard {
            conn: self,
            attempt,
        };

        let transport = match self.connector.open(self.id.as_str()) {
            Ok(transport) => transport,
            Err(e) => return Err(self.fail(e)),
        };
        let mut child = transport.child;
        let client = RpcClient::start(self.id.as_str(), transport.reader, transport.writer);

        let tools = match handshake(&client).await {
            Ok(tools) => tools,
            Err(e) => {
                client.shutdown();
                if let Some(child) = child.as_mut() {
                    let _ = child.kill().await;
                }
                return Err(self.fail(e));
            }
        };

        let mut inner = self.inner();
        if inner.state != ConnectionState::Connecting || inner.attempt != attempt {
            // Disconnected while the handshake was running.
            client.shutdown();
            return Err(ConnectError::ProtocolError(
                "connection closed during handshake".into(),
            ));
        }
        inner.state = ConnectionState::Connected;
        inner.tools = tools.clone();
        inner.client = Some(client);
        inner.child = child;
        info!(server = %self.id, tools = tools.len(), "tool server connected");
        Ok(tools)
    }

    /// Invoke one tool, giving up after `timeout`.
    ///
    /// A timed-out call's slot is released, so its eventual result is dropped.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: &Value,
        timeout: Duration,
    ) -> Result<String, ExecError> {
        let client = {
            let mut inner = self.inner();
            inner.observe_exit();
            match (&inner.state, &inner.client) {
                (ConnectionState::Connected, Some(client)) => client.clone(),
                _ => return Err(ExecError::NotConnected),
            }
        };

        let params = serde_json::to_value(CallToolParams {
            name: tool,
            arguments,
        })
        .map_err(|e| ExecError::RemoteError(e.to_string()))?;

        debug!(server = %self.id, tool, "invoking tool");
        let value = client
            .request("tools/call", Some(params), timeout)
            .await
            .map_err(ExecError::from)?;
        let result: CallToolResult = serde_json::from_value(value)
            .map_err(|e| ExecError::RemoteError(format!("invalid tool result: {e}")))?;

        if result.is_error {
            return Err(ExecError::RemoteError(result.text()));
        }
        Ok(result.text())
    }

    /// Tear down the process. Safe to call in any state.
    pub async fn disconnect(&self) {
        let (client, child) = {
            let mut inner = self.inner();
            inner.state = ConnectionState::Disconnected;
            inner.tools.clear();
            (inner.client.take(), inner.child.take())
        };

        if let Some(client) = client {
            let _ = client.notify("shutdown", None).await;
            client.shutdown();
        }
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                debug!(server = %self.id, "kill failed: {e}");
            }
        }
        debug!(server = %self.id, "tool server disconnected");
    }

    fn fail(&self, error: ConnectError) -> ConnectError {
        warn!(server = %self.id, "tool server connection failed: {error}");
        let mut inner = self.inner();
        inner.state = ConnectionState::Failed(error.to_string());
        inner.tools.clear();
        inner.client = None;
        inner.child = None;
        error
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks a handshake that never finished as failed.
struct AttemptGuard<'a> {
    conn: &'a ToolServerConnection,
    attempt: u64,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.conn.inner();
        if inner.state == ConnectionState::Connecting && inner.attempt == self.attempt {
            debug!(server = %self.conn.id, "connection attempt abandoned");
            inner.state = ConnectionState::Failed("connection cancelled".into());
            inner.tools.clear();
        }
    }
}

impl std::fmt::Debug for ToolServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolServerConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.inner().state)
            .finish()
    }
}

async fn handshake(client: &RpcClient) -> Result<Vec<Tool>, ConnectError> {
    let protocol = |stage: &str, e: crate::Error| ConnectError::ProtocolError(format!("{stage}: {e}"));

    let params = serde_json::to_value(InitializeParams::default())
        .map_err(|e| ConnectError::ProtocolError(e.to_string()))?;
    let value = client
        .request("initialize", Some(params), HANDSHAKE_TIMEOUT)
        .await
        .map_err(|e| protocol("initialize", e))?;
    let init: InitializeResult = serde_json::from_value(value)
        .map_err(|e| ConnectError::ProtocolError(format!("initialize: {e}")))?;
    if let Some(info) = &init.server_info {
        debug!(name = %info.name, version = ?info.version, protocol = ?init.protocol_version, "handshake accepted");
    }

    client
        .notify("notifications/initialized", None)
        .await
        .map_err(|e| protocol("initialized", e))?;

    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor
            .take()
            .map(|c| serde_json::json!({ "cursor": c }));
        let value = client
            .request("tools/list", params, HANDSHAKE_TIMEOUT)
            .await
            .map_err(|e| protocol("tools/list", e))?;
        let page: ListToolsResult = serde_json::from_value(value)
            .map_err(|e| ConnectError::ProtocolError(format!("tools/list: {e}")))?;
        tools.extend(page.tools);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(tools)
}
