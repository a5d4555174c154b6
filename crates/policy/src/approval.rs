//! Per-server auto-approval sets.

use std::collections::BTreeSet;

/// Entry that pre-authorizes every tool on a server.
pub const ANY_TOOL: &str = "*";

/// Tools a user has pre-authorized on one server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalSet {
    tools: BTreeSet<String>,
}

impl ApprovalSet {
    pub fn new(tools: BTreeSet<String>) -> Self {
        Self { tools }
    }

    /// Whether `tool` runs without asking.
    pub fn permits(&self, tool: &str) -> bool {
        self.tools.contains(ANY_TOOL) || self.tools.contains(tool)
    }

    /// Add `tool`. Returns false if it was already present.
    pub fn grant(&mut self, tool: &str) -> bool {
        self.tools.insert(tool.to_string())
    }

    pub fn tools(&self) -> &BTreeSet<String> {
        &self.tools
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl FromIterator<String> for ApprovalSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_names_only() {
        let set: ApprovalSet = ["read_file".to_string()].into_iter().collect();
        assert!(set.permits("read_file"));
        assert!(!set.permits("read"));
        assert!(!set.permits("write_file"));
    }

    #[test]
    fn wildcard_permits_everything() {
        let set: ApprovalSet = [ANY_TOOL.to_string()].into_iter().collect();
        assert!(set.permits("anything"));
    }

    #[test]
    fn grant_is_idempotent() {
        let mut set = ApprovalSet::default();
        assert!(set.grant("echo"));
        assert!(!set.grant("echo"));
        assert_eq!(set.tools().len(), 1);
    }
}
