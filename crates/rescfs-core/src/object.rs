//! The per-request file object and its replica list.

use serde::{Deserialize, Serialize};

use crate::hierarchy::HierarchyPath;
use crate::kvp::KvpMap;

/// Keyword set on objects being staged from archive to cache.
pub const STAGE_OBJ_KW: &str = "stage_object";
/// Keyword set on objects being synced from cache to archive.
pub const SYNC_OBJ_KW: &str = "sync_object";
/// Keyword set on objects being copied between replication siblings.
pub const IN_REPL_KW: &str = "in_repl";
/// Keyword carrying a caller-chosen hierarchy.
pub const RESC_HIER_STR_KW: &str = "resc_hier";

/// Replica freshness as recorded in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    /// Up to date.
    Good,
    /// Behind another replica.
    Stale,
}

/// One physical copy of the object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalReplica {
    /// Replica number, unique per object.
    pub number: u32,
    /// Hierarchy of the leaf holding this copy.
    pub hierarchy: HierarchyPath,
    /// Location on the leaf.
    pub physical_path: String,
    /// Freshness.
    pub status: ReplicaStatus,
    /// Last vote recorded for this replica during resolve.
    pub vote: f64,
    /// Size in bytes.
    pub size: u64,
}

impl PhysicalReplica {
    /// A good replica at `hierarchy`.
    pub fn good(number: u32, hierarchy: HierarchyPath, physical_path: impl Into<String>) -> Self {
        Self {
            number,
            hierarchy,
            physical_path: physical_path.into(),
            status: ReplicaStatus::Good,
            vote: 0.0,
            size: 0,
        }
    }

    /// Name of the leaf holding this copy.
    pub fn leaf(&self) -> Option<&str> {
        self.hierarchy.last().ok()
    }
}

/// The object a client request operates on.
///
/// Each request builds its own; fan-out branches work on clones.
#[derive(Debug, Clone, PartialEq)]
pub struct FileObject {
    /// Logical (namespace) path.
    pub logical_path: String,
    /// Hierarchy the request is bound to once resolved.
    pub hierarchy: HierarchyPath,
    /// Physical path on the bound leaf.
    pub physical_path: String,
    /// Explicitly requested replica number.
    pub replica_request: Option<u32>,
    /// Condition keywords attached to the request.
    pub cond_input: KvpMap,
    /// Known physical replicas.
    pub replicas: Vec<PhysicalReplica>,
    /// Hierarchy of a replication already in progress for this object.
    pub in_pdmo: HierarchyPath,
    /// Size in bytes.
    pub size: u64,
    /// Permission bits for new replicas.
    pub mode: u32,
}

impl FileObject {
    /// A new object at `logical_path` with no replicas.
    pub fn new(logical_path: impl Into<String>) -> Self {
        Self {
            logical_path: logical_path.into(),
            hierarchy: HierarchyPath::new(),
            physical_path: String::new(),
            replica_request: None,
            cond_input: KvpMap::new(),
            replicas: Vec::new(),
            in_pdmo: HierarchyPath::new(),
            size: 0,
            mode: 0o600,
        }
    }

    /// Adds a replica and returns `self`.
    pub fn with_replica(mut self, replica: PhysicalReplica) -> Self {
        self.replicas.push(replica);
        self
    }

    /// Value of a condition keyword.
    pub fn keyword(&self, key: &str) -> Option<&str> {
        self.cond_input.get(key).map(String::as_str)
    }

    /// Whether a condition keyword is present.
    pub fn has_keyword(&self, key: &str) -> bool {
        self.cond_input.contains_key(key)
    }

    /// Sets a condition keyword.
    pub fn set_keyword(&mut self, key: &str, value: &str) {
        self.cond_input.insert(key.to_string(), value.to_string());
    }

    /// The replica stored on `leaf`, honouring any explicit replica request.
    pub fn replica_on_leaf(&self, leaf: &str) -> Option<&PhysicalReplica> {
        self.replicas.iter().find(|r| {
            r.leaf() == Some(leaf) && self.replica_request.map_or(true, |n| n == r.number)
        })
    }

    /// Mutable access to the replica stored on `leaf`.
    pub fn replica_on_leaf_mut(&mut self, leaf: &str) -> Option<&mut PhysicalReplica> {
        let request = self.replica_request;
        self.replicas
            .iter_mut()
            .find(|r| r.leaf() == Some(leaf) && request.map_or(true, |n| n == r.number))
    }

    /// The replica bound to exactly `hierarchy`.
    pub fn replica_at(&self, hierarchy: &HierarchyPath) -> Option<&PhysicalReplica> {
        self.replicas.iter().find(|r| &r.hierarchy == hierarchy)
    }

    /// A copy of this object bound to `hierarchy`, using the physical path of the
    /// replica already there, if any.
    pub fn bound_to(&self, hierarchy: &HierarchyPath) -> Self {
        let mut object = self.clone();
        object.hierarchy = hierarchy.clone();
        object.physical_path = self
            .replica_at(hierarchy)
            .map(|r| r.physical_path.clone())
            .unwrap_or_default();
        object
    }

    /// Records a good replica at `hierarchy`, updating an existing entry in place.
    /// Returns the replica number.
    pub fn register_replica(
        &mut self,
        hierarchy: &HierarchyPath,
        physical_path: &str,
        size: u64,
    ) -> u32 {
        if let Some(existing) = self.replicas.iter_mut().find(|r| &r.hierarchy == hierarchy) {
            existing.physical_path = physical_path.to_string();
            existing.status = ReplicaStatus::Good;
            existing.size = size;
            return existing.number;
        }
        let number = self
            .replicas
            .iter()
            .map(|r| r.number + 1)
            .max()
            .unwrap_or(0);
        let mut replica = PhysicalReplica::good(number, hierarchy.clone(), physical_path);
        replica.size = size;
        self.replicas.push(replica);
        number
    }

    /// Drops the replica bound to `hierarchy`. Returns whether one was removed.
    pub fn forget_replica(&mut self, hierarchy: &HierarchyPath) -> bool {
        let before = self.replicas.len();
        self.replicas.retain(|r| &r.hierarchy != hierarchy);
        before != self.replicas.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hier(s: &str) -> HierarchyPath {
        HierarchyPath::from_string(s).unwrap()
    }

    #[test]
    fn test_replica_lookup() {
        let obj = FileObject::new("/zone/home/u/foo.txt")
            .with_replica(PhysicalReplica::good(0, hier("root;compound;archB"), "/arch/foo"))
            .with_replica(PhysicalReplica::good(1, hier("root;compound;cacheA"), "/cache/foo"));
        assert_eq!(obj.replica_on_leaf("archB").unwrap().number, 0);
        assert!(obj.replica_on_leaf("other").is_none());
        assert_eq!(
            obj.replica_at(&hier("root;compound;cacheA")).unwrap().physical_path,
            "/cache/foo"
        );
    }

    #[test]
    fn test_replica_request_filters() {
        let mut obj = FileObject::new("/z/o")
            .with_replica(PhysicalReplica::good(3, hier("r;leaf"), "/v/o"));
        obj.replica_request = Some(1);
        assert!(obj.replica_on_leaf("leaf").is_none());
        obj.replica_request = Some(3);
        assert!(obj.replica_on_leaf("leaf").is_some());
    }

    #[test]
    fn test_register_replica() {
        let mut obj = FileObject::new("/z/o")
            .with_replica(PhysicalReplica::good(0, hier("r;a"), "/a/o"));
        let n = obj.register_replica(&hier("r;b"), "/b/o", 12);
        assert_eq!(n, 1);
        assert_eq!(obj.replicas.len(), 2);

        obj.replicas[1].status = ReplicaStatus::Stale;
        let again = obj.register_replica(&hier("r;b"), "/b/o.2", 20);
        assert_eq!(again, 1);
        assert_eq!(obj.replicas.len(), 2);
        assert_eq!(obj.replicas[1].status, ReplicaStatus::Good);
        assert_eq!(obj.replicas[1].physical_path, "/b/o.2");
    }

    #[test]
    fn test_bound_to() {
        let obj = FileObject::new("/z/o")
            .with_replica(PhysicalReplica::good(0, hier("r;a"), "/a/o"));
        let bound = obj.bound_to(&hier("r;a"));
        assert_eq!(bound.physical_path, "/a/o");
        let fresh = obj.bound_to(&hier("r;b"));
        assert!(fresh.physical_path.is_empty());
        assert_eq!(fresh.hierarchy.to_string(), "r;b");
    }

    #[test]
    fn test_keywords() {
        let mut obj = FileObject::new("/z/o");
        assert!(!obj.has_keyword(STAGE_OBJ_KW));
        obj.set_keyword(STAGE_OBJ_KW, "");
        assert!(obj.has_keyword(STAGE_OBJ_KW));
        assert_eq!(obj.keyword(STAGE_OBJ_KW), Some(""));
    }
}
