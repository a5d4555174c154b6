//! Tool-server connections shared by all sessions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mcp::{ConnectError, ConnectionState, ExecError, LaunchSpec, ServerId, Tool, ToolServerConnection};
use serde_json::Value;
use storage::ServerSpec;
use tracing::{debug, info, warn};

use crate::catalog::{ServerTools, ToolCatalog};
use crate::{Error, Result};

/// Display snapshot of one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub id: ServerId,
    pub name: String,
    pub state: ConnectionState,
    pub tools: Vec<String>,
}

#[derive(Default)]
struct CachedCatalog {
    /// Connection flags the catalog was built from.
    fingerprint: Vec<(ServerId, bool)>,
    stale: bool,
    catalog: Arc<ToolCatalog>,
}

/// A registered connection and the lock its connection attempts take turns on.
#[derive(Clone)]
struct Entry {
    connection: Arc<ToolServerConnection>,
    attempts: Arc<tokio::sync::Mutex<()>>,
}

impl Entry {
    fn new(connection: Arc<ToolServerConnection>) -> Self {
        Self {
            connection,
            attempts: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Owns one connection per server id, in registration order.
#[derive(Default)]
pub struct ServerManager {
    entries: Mutex<Vec<Entry>>,
    catalog: Mutex<CachedCatalog>,
}

impl ServerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch `spec` unless it is already registered, then connect.
    ///
    /// Waits for a connection attempt already running for the same server
    /// instead of starting a second one.
    pub async fn activate(&self, spec: &ServerSpec) -> std::result::Result<Vec<Tool>, ConnectError> {
        let entry = self.entry_or_register(spec);
        self.connect(&entry).await
    }

    /// Register a prepared connection, replacing any with the same id, and connect it.
    pub async fn activate_connection(
        &self,
        connection: ToolServerConnection,
    ) -> std::result::Result<Vec<Tool>, ConnectError> {
        let entry = Entry::new(Arc::new(connection));
        let replaced = {
            let mut entries = self.entries();
            match entries.iter_mut().find(|e| e.connection.id() == entry.connection.id()) {
                Some(slot) => Some(std::mem::replace(slot, entry.clone())),
                None => {
                    entries.push(entry.clone());
                    None
                }
            }
        };
        if let Some(old) = replaced {
            old.connection.disconnect().await;
        }
        self.connect(&entry).await
    }

    /// Bring every spec to a connected state if possible.
    ///
    /// Servers that failed or dropped earlier are retried. Failures are
    /// logged, not returned.
    pub async fn ensure_active(&self, specs: &[ServerSpec]) {
        for spec in specs {
            let entry = self.entry_or_register(spec);
            if entry.connection.is_connected() {
                continue;
            }
            if let Err(e) = self.connect(&entry).await {
                warn!(server = %spec.id, "Tool server unavailable: {e}");
            }
        }
    }

    /// Disconnect and forget a server. Returns whether it was registered.
    pub async fn deactivate(&self, id: &ServerId) -> bool {
        let removed = {
            let mut entries = self.entries();
            let position = entries.iter().position(|e| e.connection.id() == id);
            position.map(|p| entries.remove(p))
        };
        match removed {
            Some(entry) => {
                entry.connection.disconnect().await;
                self.invalidate();
                info!(server = %id, "Tool server deactivated");
                true
            }
            None => false,
        }
    }

    /// Tear down and re-establish a registered server's connection.
    pub async fn reconnect(&self, id: &ServerId) -> Result<Vec<Tool>> {
        let entry = self
            .entry(id)
            .ok_or_else(|| Error::UnknownServer(id.to_string()))?;
        let _turn = entry.attempts.lock().await;
        entry.connection.disconnect().await;
        self.invalidate();
        let result = entry.connection.connect().await;
        self.invalidate();
        Ok(result?)
    }

    pub fn connection(&self, id: &ServerId) -> Option<Arc<ToolServerConnection>> {
        self.entry(id).map(|e| e.connection)
    }

    /// Run a tool on `server`.
    pub async fn invoke(
        &self,
        server: &ServerId,
        tool: &str,
        arguments: &Value,
        timeout: Duration,
    ) -> std::result::Result<String, ExecError> {
        match self.connection(server) {
            Some(connection) => connection.invoke(tool, arguments, timeout).await,
            None => Err(ExecError::NotConnected),
        }
    }

    /// Catalog of every connected server, rebuilt when a connection changed state.
    pub fn catalog(&self) -> Arc<ToolCatalog> {
        let connections = self.connections();
        let fingerprint: Vec<(ServerId, bool)> = connections
            .iter()
            .map(|c| (c.id().clone(), c.is_connected()))
            .collect();

        let mut cached = self.cached();
        if !cached.stale && cached.fingerprint == fingerprint {
            return cached.catalog.clone();
        }

        let catalog = Arc::new(ToolCatalog::rebuild(
            connections
                .iter()
                .filter(|c| c.is_connected())
                .map(|c| ServerTools {
                    server: c.id().clone(),
                    tools: c.tools(),
                }),
        ));
        debug!(tools = catalog.len(), "Tool catalog rebuilt");
        cached.fingerprint = fingerprint;
        cached.stale = false;
        cached.catalog = catalog.clone();
        catalog
    }

    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.connections()
            .iter()
            .map(|c| ServerStatus {
                id: c.id().clone(),
                name: c.name().to_string(),
                state: c.state(),
                tools: c.tools().into_iter().map(|t| t.name).collect(),
            })
            .collect()
    }

    /// Disconnect every server.
    pub async fn shutdown(&self) {
        for connection in self.connections() {
            connection.disconnect().await;
        }
        self.invalidate();
    }

    /// Connect `entry` once any attempt already running for it has finished.
    async fn connect(&self, entry: &Entry) -> std::result::Result<Vec<Tool>, ConnectError> {
        let _turn = entry.attempts.lock().await;
        let result = entry.connection.connect().await;
        self.invalidate();
        result
    }

    fn entry_or_register(&self, spec: &ServerSpec) -> Entry {
        let id = ServerId::new(spec.id.as_str());
        let mut entries = self.entries();
        if let Some(existing) = entries.iter().find(|e| *e.connection.id() == id) {
            return existing.clone();
        }
        let entry = Entry::new(Arc::new(ToolServerConnection::new(
            id,
            spec.name.as_str(),
            launch_spec(spec),
        )));
        entries.push(entry.clone());
        entry
    }

    fn entry(&self, id: &ServerId) -> Option<Entry> {
        self.entries().iter().find(|e| e.connection.id() == id).cloned()
    }

    /// Snapshot of the registered connections, in registration order.
    fn connections(&self) -> Vec<Arc<ToolServerConnection>> {
        self.entries().iter().map(|e| e.connection.clone()).collect()
    }

    fn invalidate(&self) {
        self.cached().stale = true;
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached(&self) -> MutexGuard<'_, CachedCatalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn launch_spec(spec: &ServerSpec) -> LaunchSpec {
    LaunchSpec {
        command: spec.command.clone(),
        args: spec.args.clone(),
        env: spec
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp::testing::FakeServer;
    use serde_json::json;

    fn fake(id: &str, server: &FakeServer) -> ToolServerConnection {
        ToolServerConnection::with_connector(id, id.to_uppercase(), server.connector())
    }

    #[tokio::test]
    async fn catalog_follows_connections() {
        let manager = ServerManager::new();
        let fs = FakeServer::new().with_tool("read").with_tool("write");
        let web = FakeServer::new().with_tool("fetch").with_tool("read");

        manager.activate_connection(fake("fs", &fs)).await.unwrap();
        manager.activate_connection(fake("web", &web)).await.unwrap();

        let catalog = manager.catalog();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get("read").unwrap().server.as_str(), "fs");
        assert!(Arc::ptr_eq(&catalog, &manager.catalog()));

        assert!(manager.deactivate(&ServerId::new("fs")).await);
        let catalog = manager.catalog();
        assert_eq!(catalog.get("read").unwrap().server.as_str(), "web");
        assert!(catalog.get("write").is_none());
        assert!(!manager.deactivate(&ServerId::new("fs")).await);
    }

    #[tokio::test]
    async fn exited_server_leaves_the_catalog() {
        let manager = ServerManager::new();
        let fs = FakeServer::new().with_tool("read").exit_on("read");
        manager.activate_connection(fake("fs", &fs)).await.unwrap();
        assert_eq!(manager.catalog().len(), 1);

        let id = ServerId::new("fs");
        let result = manager
            .invoke(&id, "read", &json!({}), Duration::from_secs(5))
            .await;
        assert!(result.is_err());
        assert!(manager.catalog().is_empty());

        let statuses = manager.statuses();
        assert_eq!(statuses[0].state, ConnectionState::Failed("server exited".into()));

        manager.reconnect(&id).await.unwrap();
        assert_eq!(fs.connection_count(), 2);
        assert_eq!(manager.catalog().len(), 1);
    }

    #[tokio::test]
    async fn replacing_a_connection_keeps_one_per_id() {
        let manager = ServerManager::new();
        let first = FakeServer::new().with_tool("a");
        let second = FakeServer::new().with_tool("b");
        manager.activate_connection(fake("fs", &first)).await.unwrap();
        manager.activate_connection(fake("fs", &second)).await.unwrap();

        let statuses = manager.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].tools, ["b"]);
        assert_eq!(statuses[0].name, "FS");
    }

    #[tokio::test]
    async fn unknown_server() {
        let manager = ServerManager::new();
        assert!(matches!(
            manager.reconnect(&ServerId::new("nope")).await,
            Err(Error::UnknownServer(id)) if id == "nope"
        ));
        assert_eq!(
            manager
                .invoke(&ServerId::new("nope"), "x", &json!({}), Duration::from_secs(1))
                .await,
            Err(ExecError::NotConnected)
        );
    }

    #[tokio::test]
    async fn failed_launch_is_recorded() {
        let manager = ServerManager::new();
        let spec = ServerSpec {
            id: "ghost".into(),
            name: "Ghost".into(),
            command: "/definitely/not/a/real/binary".into(),
            args: Vec::new(),
            env: Default::default(),
            enabled: true,
        };
        manager.ensure_active(std::slice::from_ref(&spec)).await;

        let statuses = manager.statuses();
        assert!(matches!(statuses[0].state, ConnectionState::Failed(_)));
        assert!(manager.catalog().is_empty());
    }

    fn spec(id: &str) -> ServerSpec {
        ServerSpec {
            id: id.into(),
            name: id.to_uppercase(),
            command: "unused".into(),
            args: Vec::new(),
            env: Default::default(),
            enabled: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_active_waits_for_a_handshake_in_progress() {
        let manager = Arc::new(ServerManager::new());
        let fs = FakeServer::new()
            .with_tool("read")
            .slow_handshake(Duration::from_millis(200));

        let first = tokio::spawn({
            let manager = manager.clone();
            let connection = fake("fs", &fs);
            async move { manager.activate_connection(connection).await }
        });
        while manager.statuses().first().map(|s| s.state.clone()) != Some(ConnectionState::Connecting) {
            tokio::task::yield_now().await;
        }

        manager.ensure_active(&[spec("fs")]).await;
        assert_eq!(manager.catalog().len(), 1);
        assert_eq!(manager.statuses().len(), 1);
        assert_eq!(fs.connection_count(), 1);
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ensure_active_retries_a_dropped_server() {
        let manager = ServerManager::new();
        let fs = FakeServer::new().with_tool("read").exit_on("read");
        manager.activate_connection(fake("fs", &fs)).await.unwrap();

        let id = ServerId::new("fs");
        let _ = manager
            .invoke(&id, "read", &json!({}), Duration::from_secs(5))
            .await;
        assert!(manager.catalog().is_empty());

        manager.ensure_active(&[spec("fs")]).await;
        assert_eq!(fs.connection_count(), 2);
        assert_eq!(manager.catalog().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_activation_registers_one_connection() {
        let manager = ServerManager::new();
        let ghost = ServerSpec {
            command: "/definitely/not/a/real/binary".into(),
            ..spec("ghost")
        };
        let (a, b) = tokio::join!(manager.activate(&ghost), manager.activate(&ghost));
        assert!(a.is_err() && b.is_err());
        assert_eq!(manager.statuses().len(), 1);
    }
}
