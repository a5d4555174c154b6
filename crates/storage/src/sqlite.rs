//! SQLite-backed configuration store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};

use crate::config::{ConfigStore, select_active};
use crate::{Error, LogMessage, ModelCredentials, Result, ServerSpec, SessionId};

/// Configuration store persisted in a SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                command TEXT NOT NULL,
                args TEXT NOT NULL,
                env TEXT NOT NULL,
                enabled INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS auto_approvals (
                server_id TEXT NOT NULL,
                tool TEXT NOT NULL,
                PRIMARY KEY (server_id, tool)
            );
            CREATE TABLE IF NOT EXISTS models (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS session_servers (
                session_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                PRIMARY KEY (session_id, server_id)
            );
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                role TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session
                ON messages(session_id, seq);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_selection(&self, conn: &Connection, session: SessionId) -> Result<Vec<String>> {
        let mut stmt =
            conn.prepare("SELECT server_id FROM session_servers WHERE session_id = ?1")?;
        let ids = stmt
            .query_map([session.to_string()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn load_servers(conn: &Connection) -> Result<Vec<ServerSpec>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, command, args, env, enabled FROM servers ORDER BY seq",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, name, command, args, env, enabled)| {
                Ok(ServerSpec {
                    id,
                    name,
                    command,
                    args: serde_json::from_str::<Vec<String>>(&args)?,
                    env: serde_json::from_str::<BTreeMap<String, String>>(&env)?,
                    enabled,
                })
            })
            .collect()
    }
}

impl ConfigStore for SqliteStore {
    fn active_tool_servers(&self, session: SessionId) -> Result<Vec<ServerSpec>> {
        let conn = self.conn();
        let selection = self.session_selection(&conn, session)?;
        Ok(select_active(Self::load_servers(&conn)?, &selection))
    }

    fn auto_approval(&self, server_id: &str) -> Result<BTreeSet<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT tool FROM auto_approvals WHERE server_id = ?1")?;
        let tools = stmt
            .query_map([server_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(tools)
    }

    fn set_auto_approval(&self, server_id: &str, tools: &BTreeSet<String>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM auto_approvals WHERE server_id = ?1", [server_id])?;
        for tool in tools {
            tx.execute(
                "INSERT INTO auto_approvals (server_id, tool) VALUES (?1, ?2)",
                params![server_id, tool],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn model_credentials(&self, model_id: &str) -> Result<ModelCredentials> {
        let conn = self.conn();
        let data: Option<String> = conn
            .query_row("SELECT data FROM models WHERE id = ?1", [model_id], |row| {
                row.get(0)
            })
            .optional()?;
        let data = data.ok_or_else(|| Error::NotFound(format!("model {model_id}")))?;
        Ok(serde_json::from_str(&data)?)
    }

    fn upsert_server(&self, spec: &ServerSpec) -> Result<()> {
        self.conn().execute(
            r#"INSERT INTO servers (id, name, command, args, env, enabled)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)
               ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   command = excluded.command,
                   args = excluded.args,
                   env = excluded.env,
                   enabled = excluded.enabled"#,
            params![
                spec.id,
                spec.name,
                spec.command,
                serde_json::to_string(&spec.args)?,
                serde_json::to_string(&spec.env)?,
                spec.enabled,
            ],
        )?;
        Ok(())
    }

    fn servers(&self) -> Result<Vec<ServerSpec>> {
        Self::load_servers(&self.conn())
    }

    fn upsert_model(&self, model_id: &str, credentials: &ModelCredentials) -> Result<()> {
        self.conn().execute(
            "INSERT INTO models (id, data) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
            params![model_id, serde_json::to_string(credentials)?],
        )?;
        Ok(())
    }

    fn set_session_servers(&self, session: SessionId, server_ids: &[String]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let session = session.to_string();
        tx.execute(
            "DELETE FROM session_servers WHERE session_id = ?1",
            [&session],
        )?;
        for id in server_ids {
            tx.execute(
                "INSERT OR IGNORE INTO session_servers (session_id, server_id) VALUES (?1, ?2)",
                params![session, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn append_message(&self, session: SessionId, message: &LogMessage) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (session_id, timestamp, role, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                session.to_string(),
                message.timestamp.to_rfc3339(),
                message.role.as_str(),
                serde_json::to_string(message)?,
            ],
        )?;
        Ok(())
    }

    fn load_messages(&self, session: SessionId) -> Result<Vec<LogMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, data FROM messages WHERE session_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map([session.to_string()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(seq, data)| {
                serde_json::from_str(&data)
                    .map_err(|e| Error::Corrupt(format!("message {seq}: {e}")))
            })
            .collect()
    }

    fn delete_session(&self, session: SessionId) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let session = session.to_string();
        tx.execute("DELETE FROM messages WHERE session_id = ?1", [&session])?;
        tx.execute(
            "DELETE FROM session_servers WHERE session_id = ?1",
            [&session],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCallRecord;

    fn spec(id: &str, enabled: bool) -> ServerSpec {
        ServerSpec {
            id: id.into(),
            name: id.to_uppercase(),
            command: format!("{id}-server"),
            args: vec!["--stdio".into()],
            env: BTreeMap::from([("LOG".to_string(), "1".to_string())]),
            enabled,
        }
    }

    #[test]
    fn servers_keep_registration_order_across_updates() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_server(&spec("b", true)).unwrap();
        store.upsert_server(&spec("a", true)).unwrap();
        let mut updated = spec("b", true);
        updated.name = "Renamed".into();
        store.upsert_server(&updated).unwrap();

        let servers = store.servers().unwrap();
        let ids: Vec<_> = servers.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);
        assert_eq!(servers[0].name, "Renamed");
        assert_eq!(servers[0].env.get("LOG").map(String::as_str), Some("1"));
    }

    #[test]
    fn active_servers_honour_session_selection() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_server(&spec("a", true)).unwrap();
        store.upsert_server(&spec("b", false)).unwrap();
        store.upsert_server(&spec("c", true)).unwrap();
        let session = SessionId::new();

        let ids = |v: Vec<ServerSpec>| v.into_iter().map(|s| s.id).collect::<Vec<_>>();
        assert_eq!(ids(store.active_tool_servers(session).unwrap()), ["a", "c"]);

        store
            .set_session_servers(session, &["c".into(), "b".into()])
            .unwrap();
        assert_eq!(ids(store.active_tool_servers(session).unwrap()), ["b", "c"]);

        store.set_session_servers(session, &[]).unwrap();
        assert_eq!(ids(store.active_tool_servers(session).unwrap()), ["a", "c"]);
    }

    #[test]
    fn auto_approval_is_replaced_per_server() {
        let store = SqliteStore::in_memory().unwrap();
        let set: BTreeSet<String> = ["list_dir".to_string(), "read_file".to_string()].into();
        store.set_auto_approval("fs", &set).unwrap();
        store
            .set_auto_approval("web", &BTreeSet::from(["fetch".to_string()]))
            .unwrap();
        assert_eq!(store.auto_approval("fs").unwrap(), set);

        store
            .set_auto_approval("fs", &BTreeSet::from(["list_dir".to_string()]))
            .unwrap();
        assert_eq!(store.auto_approval("fs").unwrap().len(), 1);
        assert_eq!(store.auto_approval("web").unwrap().len(), 1);
        assert!(store.auto_approval("unknown").unwrap().is_empty());
    }

    #[test]
    fn unknown_model_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(matches!(
            store.model_credentials("nope"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn messages_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.db");
        let session = SessionId::new();
        let call = ToolCallRecord {
            id: "call_1".into(),
            name: "list_dir".into(),
            arguments: r#"{"path":"."}"#.into(),
        };

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .append_message(session, &LogMessage::user("list files"))
                .unwrap();
            store
                .append_message(session, &LogMessage::assistant_tool_calls("", vec![call.clone()]))
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let log = store.load_messages(session).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].content, "list files");
        assert_eq!(log[1].tool_calls, vec![call]);

        store.delete_session(session).unwrap();
        assert!(store.load_messages(session).unwrap().is_empty());
    }
}
