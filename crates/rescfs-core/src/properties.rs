//! Static resource properties and context-string settings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::kvp::{parse_kvp, KvpMap};
use crate::error::ResourceResult;

/// Context tag marking a compound resource's cache child.
pub const CACHE_CONTEXT: &str = "cache";
/// Context tag marking a compound resource's archive child.
pub const ARCHIVE_CONTEXT: &str = "archive";

/// Context key toggling automatic cache-to-archive sync on compound resources.
pub const AUTO_REPL_KEY: &str = "auto_repl";
/// Context key for the passthru read weight.
pub const READ_WEIGHT_KEY: &str = "read";
/// Context key for the passthru write weight.
pub const WRITE_WEIGHT_KEY: &str = "write";
/// Context key for the replication replica-request policy (`refuse` or `allow`).
pub const REPLICA_REQUESTS_KEY: &str = "replica_requests";
/// Context key for a leaf's create-path policy (`server` lets the archive rename).
pub const CREATE_PATH_KEY: &str = "create_path";

/// Availability of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Accepting requests.
    #[default]
    Up,
    /// Votes zero for everything.
    Down,
}

/// Plugin type of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Cache plus archive pair with stage/sync.
    Compound,
    /// Keeps every child in sync.
    Replication,
    /// Picks the best child without further policy.
    Deferred,
    /// Picks the least loaded child for creates.
    LoadBalanced,
    /// Single child with read/write weighting.
    Passthru,
    /// Storage back-end.
    Leaf,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::Compound => "compound",
            ResourceType::Replication => "replication",
            ResourceType::Deferred => "deferred",
            ResourceType::LoadBalanced => "load_balanced",
            ResourceType::Passthru => "passthru",
            ResourceType::Leaf => "leaf",
        };
        f.write_str(s)
    }
}

/// Role of a child inside a compound resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundRole {
    /// Fast tier.
    Cache,
    /// Slow tier.
    Archive,
}

/// Parent-context tag attached to a child link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildContext(String);

impl ChildContext {
    /// Wraps a raw tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The cache tag.
    pub fn cache() -> Self {
        Self::new(CACHE_CONTEXT)
    }

    /// The archive tag.
    pub fn archive() -> Self {
        Self::new(ARCHIVE_CONTEXT)
    }

    /// Raw tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compound role named by the tag, if any.
    pub fn role(&self) -> Option<CompoundRole> {
        match self.0.as_str() {
            CACHE_CONTEXT => Some(CompoundRole::Cache),
            ARCHIVE_CONTEXT => Some(CompoundRole::Archive),
            _ => None,
        }
    }
}

/// Properties fixed when the resource tree is built.
#[derive(Debug, Clone, Default)]
pub struct ResourceProperties {
    /// Availability.
    pub status: ResourceStatus,
    /// Host serving the resource.
    pub host: String,
    /// Root directory for physical paths on a leaf.
    pub vault_path: String,
    /// Parent resource, if any.
    pub parent: Option<String>,
    /// Parsed context string.
    pub context: KvpMap,
}

impl ResourceProperties {
    /// Properties for an up resource on `host` with an empty context.
    pub fn on_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Sets the vault path.
    pub fn with_vault(mut self, vault: impl Into<String>) -> Self {
        self.vault_path = vault.into();
        self
    }

    /// Sets the status.
    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    /// Parses and sets the context string.
    pub fn with_context(mut self, context: &str) -> ResourceResult<Self> {
        self.context = parse_kvp(context)?;
        Ok(self)
    }

    /// Sets the parent name.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Value of a context key.
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    /// Whether the resource is down.
    pub fn is_down(&self) -> bool {
        self.status == ResourceStatus::Down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_roles() {
        assert_eq!(ChildContext::cache().role(), Some(CompoundRole::Cache));
        assert_eq!(ChildContext::archive().role(), Some(CompoundRole::Archive));
        assert_eq!(ChildContext::new("").role(), None);
        assert_eq!(ChildContext::new("Cache").role(), None);
    }

    #[test]
    fn test_context_parsing() {
        let props = ResourceProperties::on_host("host1")
            .with_context("read=0.5;write=2")
            .unwrap();
        assert_eq!(props.context_value(READ_WEIGHT_KEY), Some("0.5"));
        assert_eq!(props.context_value(AUTO_REPL_KEY), None);
        assert!(ResourceProperties::default().with_context("broken").is_err());
    }

    #[test]
    fn test_status_serde() {
        let status: ResourceStatus = serde_json::from_str("\"down\"").unwrap();
        assert_eq!(status, ResourceStatus::Down);
        let kind: ResourceType = serde_json::from_str("\"load_balanced\"").unwrap();
        assert_eq!(kind, ResourceType::LoadBalanced);
        assert_eq!(kind.to_string(), "load_balanced");
    }
}
