//! Volatile configuration store.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::{ConfigStore, select_active};
use crate::{Error, LogMessage, ModelCredentials, Result, ServerSpec, SessionId};

#[derive(Default)]
struct Tables {
    servers: Vec<ServerSpec>,
    approvals: HashMap<String, BTreeSet<String>>,
    models: HashMap<String, ModelCredentials>,
    selections: HashMap<SessionId, Vec<String>>,
    messages: HashMap<SessionId, Vec<LogMessage>>,
}

/// In-memory [`ConfigStore`] for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigStore for MemoryStore {
    fn active_tool_servers(&self, session: SessionId) -> Result<Vec<ServerSpec>> {
        let tables = self.tables();
        let selection = tables.selections.get(&session).cloned().unwrap_or_default();
        Ok(select_active(tables.servers.clone(), &selection))
    }

    fn auto_approval(&self, server_id: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .tables()
            .approvals
            .get(server_id)
            .cloned()
            .unwrap_or_default())
    }

    fn set_auto_approval(&self, server_id: &str, tools: &BTreeSet<String>) -> Result<()> {
        self.tables()
            .approvals
            .insert(server_id.to_string(), tools.clone());
        Ok(())
    }

    fn model_credentials(&self, model_id: &str) -> Result<ModelCredentials> {
        self.tables()
            .models
            .get(model_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("model {model_id}")))
    }

    fn upsert_server(&self, spec: &ServerSpec) -> Result<()> {
        let mut tables = self.tables();
        match tables.servers.iter_mut().find(|s| s.id == spec.id) {
            Some(existing) => *existing = spec.clone(),
            None => tables.servers.push(spec.clone()),
        }
        Ok(())
    }

    fn servers(&self) -> Result<Vec<ServerSpec>> {
        Ok(self.tables().servers.clone())
    }

    fn upsert_model(&self, model_id: &str, credentials: &ModelCredentials) -> Result<()> {
        self.tables()
            .models
            .insert(model_id.to_string(), credentials.clone());
        Ok(())
    }

    fn set_session_servers(&self, session: SessionId, server_ids: &[String]) -> Result<()> {
        self.tables()
            .selections
            .insert(session, server_ids.to_vec());
        Ok(())
    }

    fn append_message(&self, session: SessionId, message: &LogMessage) -> Result<()> {
        self.tables()
            .messages
            .entry(session)
            .or_default()
            .push(message.clone());
        Ok(())
    }

    fn load_messages(&self, session: SessionId) -> Result<Vec<LogMessage>> {
        Ok(self
            .tables()
            .messages
            .get(&session)
            .cloned()
            .unwrap_or_default())
    }

    fn delete_session(&self, session: SessionId) -> Result<()> {
        let mut tables = self.tables();
        tables.messages.remove(&session);
        tables.selections.remove(&session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_in_place() {
        let store = MemoryStore::new();
        for id in ["x", "y"] {
            store
                .upsert_server(&ServerSpec {
                    id: id.into(),
                    name: id.into(),
                    command: "cmd".into(),
                    args: Vec::new(),
                    env: Default::default(),
                    enabled: true,
                })
                .unwrap();
        }
        let mut x = store.servers().unwrap()[0].clone();
        x.enabled = false;
        store.upsert_server(&x).unwrap();

        let active = store.active_tool_servers(SessionId::new()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "y");
    }
}
