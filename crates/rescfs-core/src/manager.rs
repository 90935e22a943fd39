//! Resource registry and request entry points.
//!
//! [`ResourceManager`] owns the materialized resource trees, looks nodes up by
//! name and drives the per-request sequence: resolve a hierarchy, run data
//! operations through its root, then call `notify` and `modified` on every node of
//! the hierarchy from the leaf up.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info, info_span};

use crate::catalog::Catalog;
use crate::config::{ResourceConfig, TreeConfig};
use crate::context::RequestContext;
use crate::driver::StorageDriver;
use crate::error::{ResourceError, ResourceResult};
use crate::hierarchy::HierarchyPath;
use crate::kvp::{parse_kvp, KvpMap};
use crate::node::{ResourceKind, ResourceNode};
use crate::object::FileObject;
use crate::operation::{AccessMode, FileOp, OpOutput, OperationType};
use crate::properties::{ChildContext, ResourceType};
use crate::vote::Vote;

const READ_CHUNK: usize = 64 * 1024;

/// All resource trees known to this server.
pub struct ResourceManager {
    local_host: String,
    catalog: Arc<dyn Catalog>,
    default_rule_results: KvpMap,
    resources: BTreeMap<String, Arc<ResourceNode>>,
    roots: BTreeSet<String>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("local_host", &self.local_host)
            .field("default_rule_results", &self.default_rule_results)
            .field("resources", &self.resources)
            .field("roots", &self.roots)
            .finish_non_exhaustive()
    }
}

impl ResourceManager {
    /// An empty manager for `local_host`.
    pub fn new(local_host: impl Into<String>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            local_host: local_host.into(),
            catalog,
            default_rule_results: KvpMap::new(),
            resources: BTreeMap::new(),
            roots: BTreeSet::new(),
        }
    }

    /// Builds every tree described by `config`. Leaves get their driver from
    /// `driver_for`.
    pub fn from_config<F>(
        config: &TreeConfig,
        catalog: Arc<dyn Catalog>,
        mut driver_for: F,
    ) -> ResourceResult<Self>
    where
        F: FnMut(&ResourceConfig) -> ResourceResult<Arc<dyn StorageDriver>>,
    {
        let mut manager = Self::new(config.local_host.clone(), catalog);
        manager.default_rule_results = parse_kvp(&config.defaults.rule_results)?;

        let mut definitions: HashMap<&str, &ResourceConfig> = HashMap::new();
        for resource in &config.resources {
            if definitions.insert(resource.name.as_str(), resource).is_some() {
                return Err(ResourceError::bad_input(format!(
                    "resource {} defined twice",
                    resource.name
                )));
            }
        }

        let mut parents: HashMap<&str, &str> = HashMap::new();
        for resource in &config.resources {
            for child in &resource.children {
                if !definitions.contains_key(child.name.as_str()) {
                    return Err(ResourceError::InvalidResourceTopology {
                        resource: resource.name.clone(),
                        msg: format!("child {} is not defined", child.name),
                    });
                }
                if let Some(other) = parents.insert(child.name.as_str(), resource.name.as_str()) {
                    return Err(ResourceError::InvalidResourceTopology {
                        resource: child.name.clone(),
                        msg: format!("has two parents, {other} and {}", resource.name),
                    });
                }
            }
        }

        let mut built: HashMap<String, Arc<ResourceNode>> = HashMap::new();
        let mut builder = TreeBuilder {
            definitions: &definitions,
            parents: &parents,
            built: &mut built,
            stack: Vec::new(),
            driver_for: &mut driver_for,
        };
        for resource in &config.resources {
            if !parents.contains_key(resource.name.as_str()) {
                let root = builder.build(&resource.name)?;
                manager.register_tree(root)?;
            }
        }

        if let Some(orphan) = config
            .resources
            .iter()
            .find(|r| !manager.resources.contains_key(&r.name))
        {
            return Err(ResourceError::InvalidResourceTopology {
                resource: orphan.name.clone(),
                msg: "resource is part of a cycle".to_string(),
            });
        }

        info!(
            resources = manager.resources.len(),
            roots = manager.roots.len(),
            host = %manager.local_host,
            "Resource trees loaded"
        );
        Ok(manager)
    }

    /// Adds a tree rooted at `root`, validating every node in it.
    pub fn register_tree(&mut self, root: Arc<ResourceNode>) -> ResourceResult<()> {
        let mut pending = vec![Arc::clone(&root)];
        let mut added = Vec::new();
        while let Some(node) = pending.pop() {
            node.start_operation()?;
            if let Some(existing) = self.resources.get(node.name()) {
                if !Arc::ptr_eq(existing, &node) {
                    return Err(ResourceError::bad_input(format!(
                        "resource {} is already registered",
                        node.name()
                    )));
                }
            }
            pending.extend(node.children().iter().map(|c| Arc::clone(c.node())));
            added.push(node);
        }
        for node in added {
            self.resources.insert(node.name().to_string(), node);
        }
        debug!(root = %root.name(), "Registered resource tree");
        self.roots.insert(root.name().to_string());
        Ok(())
    }

    /// The resource named `name`.
    pub fn resolve(&self, name: &str) -> ResourceResult<&Arc<ResourceNode>> {
        self.resources
            .get(name)
            .ok_or_else(|| ResourceError::not_found(format!("resource {name}")))
    }

    /// All resource names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Names of tree roots, sorted.
    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.roots.iter().map(String::as_str)
    }

    /// Host this manager serves.
    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// A fresh request context carrying the configured rule-result defaults.
    pub fn request_context(&self) -> RequestContext {
        let mut ctx = RequestContext::new(self.local_host.clone(), Arc::clone(&self.catalog));
        for (key, value) in &self.default_rule_results {
            ctx.set_rule_result(key, value);
        }
        ctx
    }

    /// Votes from `root` and binds `object` to the winning hierarchy.
    pub fn resolve_hierarchy(
        &self,
        ctx: &mut RequestContext,
        root: &str,
        operation: OperationType,
        object: &mut FileObject,
    ) -> ResourceResult<Vote> {
        let span = info_span!("resolve", request = %ctx.request_id(), root, %operation);
        let _enter = span.enter();

        let node = self.resolve(root)?;
        let vote = node.resolve_hierarchy(ctx, operation, object, &HierarchyPath::new())?;
        if !vote.is_positive() {
            return Err(ResourceError::NoValidTarget {
                resource: root.to_string(),
                operation: operation.to_string(),
            });
        }
        object.hierarchy = vote.hierarchy.clone();
        object.physical_path = object
            .replica_at(&vote.hierarchy)
            .map(|r| r.physical_path.clone())
            .unwrap_or_default();
        info!(
            path = %object.logical_path,
            hierarchy = %vote.hierarchy,
            vote = vote.score,
            "Hierarchy resolved"
        );
        Ok(vote)
    }

    fn root_of(&self, object: &FileObject) -> ResourceResult<&Arc<ResourceNode>> {
        self.resolve(object.hierarchy.first()?)
    }

    /// Runs `request` on the root of the object's bound hierarchy.
    pub fn call(
        &self,
        ctx: &mut RequestContext,
        object: &mut FileObject,
        request: FileOp,
    ) -> ResourceResult<OpOutput> {
        let root = self.root_of(object)?;
        root.call(ctx, object, request)
    }

    /// Runs `modified` on every node of the bound hierarchy, leaf first.
    pub fn modified(
        &self,
        ctx: &mut RequestContext,
        object: &mut FileObject,
    ) -> ResourceResult<()> {
        let names: Vec<String> = object.hierarchy.iter().rev().map(str::to_string).collect();
        for name in names {
            self.resolve(&name)?.modified(ctx, object)?;
        }
        Ok(())
    }

    /// Runs `notify` on every node of the bound hierarchy, leaf first.
    pub fn notify(
        &self,
        ctx: &mut RequestContext,
        object: &FileObject,
        operation: OperationType,
    ) -> ResourceResult<()> {
        for name in object.hierarchy.iter().rev() {
            self.resolve(name)?.notify(ctx, object, operation)?;
        }
        Ok(())
    }

    /// Rebalances the subtree under `name`.
    pub fn rebalance(&self, ctx: &mut RequestContext, name: &str) -> ResourceResult<()> {
        let span = info_span!("rebalance", request = %ctx.request_id(), resource = name);
        let _enter = span.enter();
        self.resolve(name)?.rebalance(ctx)
    }

    /// Creates `logical_path` under `root` with `data`, then runs the post-write hooks.
    pub fn create_object(
        &self,
        ctx: &mut RequestContext,
        root: &str,
        logical_path: &str,
        data: &[u8],
    ) -> ResourceResult<FileObject> {
        let mut object = FileObject::new(logical_path);
        self.resolve_hierarchy(ctx, root, OperationType::Create, &mut object)?;
        self.notify(ctx, &object, OperationType::Create)?;

        let node = self.root_of(&object)?;
        let fd = node.create(&mut object)?;
        let written = node.write(&mut object, fd, data);
        node.close(&mut object, fd)?;
        written?;

        let hierarchy = object.hierarchy.clone();
        let physical = object.physical_path.clone();
        object.size = data.len() as u64;
        object.register_replica(&hierarchy, &physical, object.size);
        self.modified(ctx, &mut object)?;
        Ok(object)
    }

    /// Opens `object` under `root` and reads it whole.
    pub fn read_object(
        &self,
        ctx: &mut RequestContext,
        root: &str,
        object: &mut FileObject,
    ) -> ResourceResult<Vec<u8>> {
        self.resolve_hierarchy(ctx, root, OperationType::Open, object)?;
        let node = self.root_of(object)?;
        let fd = node.open(object, AccessMode::ReadOnly)?;
        let mut data = Vec::new();
        let read = loop {
            match node.read(object, fd, READ_CHUNK) {
                Ok(chunk) if chunk.is_empty() => break Ok(()),
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(e) => break Err(e),
            }
        };
        node.close(object, fd)?;
        read?;
        Ok(data)
    }

    /// Removes `object` under `root`, letting replication resources remove siblings.
    pub fn unlink_object(
        &self,
        ctx: &mut RequestContext,
        root: &str,
        object: &mut FileObject,
    ) -> ResourceResult<()> {
        self.resolve_hierarchy(ctx, root, OperationType::Unlink, object)?;
        self.root_of(object)?.unlink(object)?;
        let hierarchy = object.hierarchy.clone();
        object.forget_replica(&hierarchy);
        self.modified(ctx, object)
    }
}

struct TreeBuilder<'a, F> {
    definitions: &'a HashMap<&'a str, &'a ResourceConfig>,
    parents: &'a HashMap<&'a str, &'a str>,
    built: &'a mut HashMap<String, Arc<ResourceNode>>,
    stack: Vec<String>,
    driver_for: &'a mut F,
}

impl<F> TreeBuilder<'_, F>
where
    F: FnMut(&ResourceConfig) -> ResourceResult<Arc<dyn StorageDriver>>,
{
    fn build(&mut self, name: &str) -> ResourceResult<Arc<ResourceNode>> {
        if let Some(node) = self.built.get(name) {
            return Ok(Arc::clone(node));
        }
        if self.stack.iter().any(|n| n == name) {
            return Err(ResourceError::InvalidResourceTopology {
                resource: name.to_string(),
                msg: format!("cycle through {}", self.stack.join(" -> ")),
            });
        }
        let definition = *self
            .definitions
            .get(name)
            .ok_or_else(|| ResourceError::not_found(format!("resource {name}")))?;

        self.stack.push(name.to_string());
        let properties = definition.properties(self.parents.get(name).copied())?;
        let kind = match definition.kind {
            ResourceType::Compound => ResourceKind::Compound,
            ResourceType::Replication => ResourceKind::Replication,
            ResourceType::Deferred => ResourceKind::Deferred,
            ResourceType::LoadBalanced => ResourceKind::LoadBalanced,
            ResourceType::Passthru => ResourceKind::Passthru,
            ResourceType::Leaf => ResourceKind::Leaf((self.driver_for)(definition)?),
        };
        let mut node = ResourceNode::new(name, kind, properties);
        for child in &definition.children {
            let child_node = self.build(&child.name)?;
            node = node.with_child(ChildContext::new(child.context.clone()), child_node);
        }
        self.stack.pop();

        let node = Arc::new(node);
        self.built.insert(name.to_string(), Arc::clone(&node));
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MockCatalog;
    use crate::config::ChildConfig;
    use crate::driver::{MemoryDriver, MemoryVolume};
    use crate::error::ErrorKind;
    use crate::properties::ResourceProperties;

    fn resource(name: &str, kind: ResourceType, children: &[(&str, &str)]) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            kind,
            host: "host1".to_string(),
            vault_path: format!("/{name}"),
            status: Default::default(),
            context: String::new(),
            children: children
                .iter()
                .map(|(n, c)| ChildConfig {
                    name: n.to_string(),
                    context: c.to_string(),
                })
                .collect(),
        }
    }

    fn config(resources: Vec<ResourceConfig>) -> TreeConfig {
        TreeConfig {
            local_host: "host1".to_string(),
            resources,
            ..TreeConfig::default()
        }
    }

    fn build(config: &TreeConfig, volume: &Arc<MemoryVolume>) -> ResourceResult<ResourceManager> {
        ResourceManager::from_config(config, Arc::new(MockCatalog::new()), |_| {
            Ok(Arc::new(MemoryDriver::new(Arc::clone(volume))) as Arc<dyn StorageDriver>)
        })
    }

    fn compound_config() -> TreeConfig {
        config(vec![
            resource("root", ResourceType::Passthru, &[("comp", "")]),
            resource("comp", ResourceType::Compound, &[("cacheA", "cache"), ("archB", "archive")]),
            resource("cacheA", ResourceType::Leaf, &[]),
            resource("archB", ResourceType::Leaf, &[]),
        ])
    }

    #[test]
    fn test_from_config_builds_tree() {
        let volume = Arc::new(MemoryVolume::default());
        let manager = build(&compound_config(), &volume).unwrap();
        assert_eq!(manager.roots().collect::<Vec<_>>(), vec!["root"]);
        assert_eq!(manager.names().count(), 4);
        let comp = manager.resolve("comp").unwrap();
        assert_eq!(comp.resource_type(), ResourceType::Compound);
        assert_eq!(comp.properties().parent.as_deref(), Some("root"));
        assert!(manager.resolve("ghost").is_err());
    }

    #[test]
    fn test_from_config_rejects_bad_graphs() {
        let volume = Arc::new(MemoryVolume::default());

        let mut dup = compound_config();
        dup.resources.push(resource("cacheA", ResourceType::Leaf, &[]));
        assert_eq!(build(&dup, &volume).unwrap_err().kind(), ErrorKind::BadInput);

        let unknown = config(vec![resource("root", ResourceType::Passthru, &[("nope", "")])]);
        assert_eq!(
            build(&unknown, &volume).unwrap_err().kind(),
            ErrorKind::InvalidResourceTopology
        );

        let two_parents = config(vec![
            resource("a", ResourceType::Passthru, &[("leaf", "")]),
            resource("b", ResourceType::Passthru, &[("leaf", "")]),
            resource("leaf", ResourceType::Leaf, &[]),
        ]);
        assert!(build(&two_parents, &volume).is_err());

        let cycle = config(vec![
            resource("a", ResourceType::Passthru, &[("b", "")]),
            resource("b", ResourceType::Passthru, &[("a", "")]),
        ]);
        assert_eq!(build(&cycle, &volume).unwrap_err().kind(), ErrorKind::InvalidResourceTopology);

        let bad_compound = config(vec![
            resource("comp", ResourceType::Compound, &[("x", "cache"), ("y", "cache")]),
            resource("x", ResourceType::Leaf, &[]),
            resource("y", ResourceType::Leaf, &[]),
        ]);
        assert_eq!(
            build(&bad_compound, &volume).unwrap_err().kind(),
            ErrorKind::InvalidResourceTopology
        );
    }

    #[test]
    fn test_register_tree_rejects_name_clash() {
        let volume = Arc::new(MemoryVolume::default());
        let mut manager = ResourceManager::new("host1", Arc::new(MockCatalog::new()));
        let leaf = |name: &str| {
            Arc::new(ResourceNode::leaf(
                name,
                ResourceProperties::on_host("host1"),
                Arc::new(MemoryDriver::new(Arc::clone(&volume))),
            ))
        };
        manager.register_tree(leaf("disk")).unwrap();
        assert!(manager.register_tree(leaf("disk")).is_err());
    }

    #[test]
    fn test_create_then_read_through_compound() {
        let volume = Arc::new(MemoryVolume::default());
        let manager = build(&compound_config(), &volume).unwrap();

        let mut ctx = manager.request_context();
        let mut object = manager.create_object(&mut ctx, "root", "/zone/f", b"payload").unwrap();
        assert_eq!(object.hierarchy.to_string(), "root;comp;cacheA");
        assert_eq!(volume.get("/archB/zone/f").unwrap(), b"payload");
        assert_eq!(object.replicas.len(), 2);

        let mut ctx = manager.request_context();
        let data = manager.read_object(&mut ctx, "root", &mut object).unwrap();
        assert_eq!(data, b"payload");
        assert_eq!(volume.stats().stages, 0);
        assert_eq!(volume.open_handles(), 0);
    }

    #[test]
    fn test_default_rule_results_reach_context() {
        let volume = Arc::new(MemoryVolume::default());
        let mut config = compound_config();
        config.defaults.rule_results = "stage_to_cache_policy=prefer_archive".to_string();
        let manager = build(&config, &volume).unwrap();
        let ctx = manager.request_context();
        assert_eq!(ctx.rule_result("stage_to_cache_policy"), Some("prefer_archive"));
        assert_eq!(ctx.local_host(), "host1");
    }

    #[test]
    fn test_no_valid_target() {
        let volume = Arc::new(MemoryVolume::default());
        let manager = build(&compound_config(), &volume).unwrap();
        let mut ctx = manager.request_context();
        let err = manager
            .resolve_hierarchy(
                &mut ctx,
                "root",
                OperationType::Open,
                &mut FileObject::new("/zone/none"),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoValidTarget);
    }

    #[test]
    fn test_call_uses_bound_root() {
        let volume = Arc::new(MemoryVolume::default());
        let manager = build(&compound_config(), &volume).unwrap();
        let mut ctx = manager.request_context();
        let mut object = FileObject::new("/zone/dir");
        manager
            .resolve_hierarchy(&mut ctx, "root", OperationType::Create, &mut object)
            .unwrap();
        assert_eq!(manager.call(&mut ctx, &mut object, FileOp::Mkdir).unwrap(), OpOutput::Unit);
        assert!(manager.call(&mut ctx, &mut FileObject::new("/unbound"), FileOp::Stat).is_err());
    }

    #[test]
    fn test_unlink_object() {
        let volume = Arc::new(MemoryVolume::default());
        let manager = build(
            &config(vec![
                resource("repl", ResourceType::Replication, &[("a", ""), ("b", "")]),
                resource("a", ResourceType::Leaf, &[]),
                resource("b", ResourceType::Leaf, &[]),
            ]),
            &volume,
        )
        .unwrap();

        let mut ctx = manager.request_context();
        let mut object = manager.create_object(&mut ctx, "repl", "/zone/f", b"x").unwrap();
        assert!(volume.exists("/a/zone/f") && volume.exists("/b/zone/f"));

        let mut ctx = manager.request_context();
        manager.unlink_object(&mut ctx, "repl", &mut object).unwrap();
        assert!(!volume.exists("/a/zone/f"));
        assert!(!volume.exists("/b/zone/f"));
        assert!(object.replicas.is_empty());
    }
}
