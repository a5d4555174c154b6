//! The name → server mapping offered to the model.

use std::collections::HashMap;

use mcp::{ServerId, Tool};
use tracing::warn;

use crate::backend::ToolSpec;

/// Separator of a server-qualified tool name, `server__tool`.
const QUALIFIER: &str = "__";

/// The tools of one connected server, as seen at rebuild time.
#[derive(Debug, Clone)]
pub struct ServerTools {
    pub server: ServerId,
    pub tools: Vec<Tool>,
}

/// A tool resolved to the server that will run it.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedTool<'a> {
    pub server: &'a ServerId,
    pub tool: &'a Tool,
}

/// Snapshot of the tools exported by connected servers.
///
/// Tool names are unique: when two servers export the same name the server
/// registered first keeps it.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    servers: Vec<ServerTools>,
    /// Tool name → (position in `servers`, position in its tools).
    owners: HashMap<String, (usize, usize)>,
    order: Vec<String>,
}

impl ToolCatalog {
    /// Build a catalog from connected servers in registration order.
    pub fn rebuild(servers: impl IntoIterator<Item = ServerTools>) -> Self {
        let servers: Vec<ServerTools> = servers.into_iter().collect();
        let mut owners = HashMap::new();
        let mut order = Vec::new();

        for (s, entry) in servers.iter().enumerate() {
            for (t, tool) in entry.tools.iter().enumerate() {
                match owners.get(&tool.name) {
                    Some(&(owner, _)) => {
                        let owner: &ServerTools = &servers[owner];
                        warn!(
                            tool = %tool.name,
                            kept = %owner.server,
                            shadowed = %entry.server,
                            "Tool name collision"
                        );
                    }
                    None => {
                        owners.insert(tool.name.clone(), (s, t));
                        order.push(tool.name.clone());
                    }
                }
            }
        }

        Self {
            servers,
            owners,
            order,
        }
    }

    /// The same catalog limited to the given servers.
    pub fn restricted_to(&self, ids: &[ServerId]) -> Self {
        Self::rebuild(
            self.servers
                .iter()
                .filter(|s| ids.contains(&s.server))
                .cloned(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Servers contributing to this catalog.
    pub fn servers(&self) -> impl Iterator<Item = &ServerId> {
        self.servers.iter().map(|s| &s.server)
    }

    /// The server owning `name` in this catalog.
    pub fn get(&self, name: &str) -> Option<ResolvedTool<'_>> {
        let &(s, t) = self.owners.get(name)?;
        let entry = &self.servers[s];
        Some(ResolvedTool {
            server: &entry.server,
            tool: &entry.tools[t],
        })
    }

    /// Find the server to run `name` on.
    ///
    /// A `preferred` server is used when it is in the catalog and exports the
    /// tool, even if another server owns the name. Otherwise connected servers
    /// are scanned in registration order.
    pub fn resolve_for_execution(
        &self,
        name: &str,
        preferred: Option<&ServerId>,
    ) -> Option<ResolvedTool<'_>> {
        if let Some(preferred) = preferred {
            let hit = self
                .servers
                .iter()
                .filter(|s| &s.server == preferred)
                .find_map(|s| Self::lookup(s, name));
            if hit.is_some() {
                return hit;
            }
        }
        self.servers.iter().find_map(|s| Self::lookup(s, name))
    }

    /// Resolve a name the model produced, accepting `server__tool`.
    pub fn resolve(&self, name: &str) -> Option<ResolvedTool<'_>> {
        if self.owners.contains_key(name) {
            return self.get(name);
        }
        if let Some((server, tool)) = name.split_once(QUALIFIER) {
            let hit = self
                .servers
                .iter()
                .filter(|s| s.server.as_str() == server)
                .find_map(|s| Self::lookup(s, tool));
            if hit.is_some() {
                return hit;
            }
        }
        self.resolve_for_execution(name, None)
    }

    /// Tool definitions for the model, in catalog order.
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.order
            .iter()
            .filter_map(|name| self.get(name))
            .map(|resolved| ToolSpec {
                name: resolved.tool.name.clone(),
                description: resolved.tool.description.clone().unwrap_or_default(),
                parameters: resolved.tool.input_schema.clone(),
            })
            .collect()
    }

    fn lookup<'a>(entry: &'a ServerTools, name: &str) -> Option<ResolvedTool<'a>> {
        entry
            .tools
            .iter()
            .find(|t| t.name == name)
            .map(|tool| ResolvedTool {
                server: &entry.server,
                tool,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.into(),
            description: Some(format!("{name} tool")),
            input_schema: json!({"type": "object"}),
        }
    }

    fn server(id: &str, tools: &[&str]) -> ServerTools {
        ServerTools {
            server: ServerId::new(id),
            tools: tools.iter().map(|t| tool(t)).collect(),
        }
    }

    #[test]
    fn first_registered_wins() {
        let catalog = ToolCatalog::rebuild([
            server("fs", &["read", "write"]),
            server("web", &["fetch", "read"]),
        ]);
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get("read").unwrap().server.as_str(), "fs");
        assert_eq!(catalog.get("fetch").unwrap().server.as_str(), "web");

        let names: Vec<_> = catalog.tool_specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["read", "write", "fetch"]);
    }

    #[test]
    fn registration_order_decides_not_names() {
        let catalog = ToolCatalog::rebuild([server("zeta", &["read"]), server("alpha", &["read"])]);
        assert_eq!(catalog.get("read").unwrap().server.as_str(), "zeta");
    }

    #[test]
    fn preferred_server_is_honoured() {
        let catalog = ToolCatalog::rebuild([server("fs", &["read"]), server("web", &["read"])]);
        let web = ServerId::new("web");
        let hit = catalog.resolve_for_execution("read", Some(&web)).unwrap();
        assert_eq!(hit.server, &web);

        let gone = ServerId::new("gone");
        let hit = catalog.resolve_for_execution("read", Some(&gone)).unwrap();
        assert_eq!(hit.server.as_str(), "fs");

        assert!(catalog.resolve_for_execution("missing", None).is_none());
    }

    #[test]
    fn qualified_names() {
        let catalog = ToolCatalog::rebuild([server("fs", &["read"]), server("web", &["read"])]);
        assert_eq!(catalog.resolve("web__read").unwrap().server.as_str(), "web");
        assert_eq!(catalog.resolve("read").unwrap().server.as_str(), "fs");
        assert!(catalog.resolve("nope__read").is_none());
    }

    #[test]
    fn restriction_reapplies_collisions() {
        let catalog = ToolCatalog::rebuild([server("fs", &["read"]), server("web", &["read", "fetch"])]);
        let web_only = catalog.restricted_to(&[ServerId::new("web")]);
        assert_eq!(web_only.get("read").unwrap().server.as_str(), "web");
        assert_eq!(web_only.len(), 2);
        assert!(catalog.restricted_to(&[]).is_empty());
    }
}
