//! Resource nodes and request routing.
//!
//! Every node answers the same operation surface. Leaves execute data operations
//! on their [`StorageDriver`]; composites pass them to the next child named in the
//! object's hierarchy. Resolve, `modified`, `notify` and rebalance carry per-type
//! logic implemented in [`crate::plugins`] and [`crate::rebalance`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::context::RequestContext;
use crate::driver::{StageRequest, StorageDriver, SyncRequest};
use crate::error::{ResourceError, ResourceResult, ResultExt};
use crate::hierarchy::HierarchyPath;
use crate::object::FileObject;
use crate::operation::{AccessMode, FileOp, FileStat, OpOutput, OperationType, ResourceOp, Whence};
use crate::plugins;
use crate::properties::{ChildContext, CompoundRole, ResourceProperties, ResourceType};
use crate::vote::Vote;

/// Behaviour of a node.
#[derive(Clone)]
pub enum ResourceKind {
    /// Cache plus archive pair.
    Compound,
    /// Replicates writes to every child.
    Replication,
    /// Highest vote wins.
    Deferred,
    /// Least loaded child takes creates.
    LoadBalanced,
    /// Single weighted child.
    Passthru,
    /// Storage back-end.
    Leaf(Arc<dyn StorageDriver>),
}

impl ResourceKind {
    /// The plugin type tag.
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ResourceKind::Compound => ResourceType::Compound,
            ResourceKind::Replication => ResourceType::Replication,
            ResourceKind::Deferred => ResourceType::Deferred,
            ResourceKind::LoadBalanced => ResourceType::LoadBalanced,
            ResourceKind::Passthru => ResourceType::Passthru,
            ResourceKind::Leaf(_) => ResourceType::Leaf,
        }
    }
}

impl fmt::Debug for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource_type())
    }
}

/// Edge from a parent to one child, tagged with the parent context.
#[derive(Debug, Clone)]
pub struct ChildLink {
    context: ChildContext,
    node: Arc<ResourceNode>,
}

impl ChildLink {
    /// Child name.
    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Parent-context tag.
    pub fn context(&self) -> &ChildContext {
        &self.context
    }

    /// The child node.
    pub fn node(&self) -> &Arc<ResourceNode> {
        &self.node
    }
}

/// One vertex of the resource tree. Immutable once built.
#[derive(Debug)]
pub struct ResourceNode {
    name: String,
    kind: ResourceKind,
    properties: ResourceProperties,
    children: Vec<ChildLink>,
}

impl ResourceNode {
    /// A node without children.
    pub fn new(
        name: impl Into<String>,
        kind: ResourceKind,
        properties: ResourceProperties,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            properties,
            children: Vec::new(),
        }
    }

    /// A storage leaf.
    pub fn leaf(
        name: impl Into<String>,
        properties: ResourceProperties,
        driver: Arc<dyn StorageDriver>,
    ) -> Self {
        Self::new(name, ResourceKind::Leaf(driver), properties)
    }

    /// Adds a child. Children are visited in insertion order.
    pub fn with_child(mut self, context: ChildContext, child: Arc<ResourceNode>) -> Self {
        self.children.push(ChildLink {
            context,
            node: child,
        });
        self
    }

    /// Resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Behaviour.
    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Plugin type tag.
    pub fn resource_type(&self) -> ResourceType {
        self.kind.resource_type()
    }

    /// Static properties.
    pub fn properties(&self) -> &ResourceProperties {
        &self.properties
    }

    /// Children in visiting order.
    pub fn children(&self) -> &[ChildLink] {
        &self.children
    }

    /// Whether this is a storage leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, ResourceKind::Leaf(_))
    }

    /// Whether the resource is marked down.
    pub fn is_down(&self) -> bool {
        self.properties.is_down()
    }

    /// The storage driver of a leaf.
    pub fn driver(&self) -> ResourceResult<&Arc<dyn StorageDriver>> {
        match &self.kind {
            ResourceKind::Leaf(driver) => Ok(driver),
            _ => Err(ResourceError::InvalidOperation {
                resource: self.name.clone(),
                operation: "driver".to_string(),
                msg: format!("{} resource has no storage driver", self.resource_type()),
            }),
        }
    }

    /// The link to child `name`.
    pub fn child_link(&self, name: &str) -> ResourceResult<&ChildLink> {
        self.children
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| ResourceError::ChildNotFound {
                resource: self.name.clone(),
                child: name.to_string(),
            })
    }

    /// Child `name`.
    pub fn child(&self, name: &str) -> ResourceResult<&Arc<ResourceNode>> {
        self.child_link(name).map(ChildLink::node)
    }

    /// The child tagged with `role`.
    pub fn child_with_role(&self, role: CompoundRole) -> ResourceResult<&ChildLink> {
        self.children
            .iter()
            .find(|c| c.context().role() == Some(role))
            .ok_or_else(|| ResourceError::InvalidResourceTopology {
                resource: self.name.clone(),
                msg: format!("no child tagged {role:?}"),
            })
    }

    /// The child that follows this node in `object`'s hierarchy.
    pub fn next_child(&self, object: &FileObject) -> ResourceResult<&ChildLink> {
        let next = object.hierarchy.next(&self.name)?;
        self.child_link(next)
    }

    /// Walks `hierarchy` down from this node to its leaf.
    pub fn leaf_for(&self, hierarchy: &HierarchyPath) -> ResourceResult<&ResourceNode> {
        let mut node = self;
        while !node.is_leaf() {
            let next = hierarchy.next(node.name())?;
            node = node.child(next)?.as_ref();
        }
        Ok(node)
    }

    /// Validates the node's structure and settings before it serves requests.
    pub fn start_operation(&self) -> ResourceResult<()> {
        let mut seen = HashSet::new();
        for child in &self.children {
            if !seen.insert(child.name()) {
                return Err(self.topology(format!("child {} listed twice", child.name())));
            }
        }

        match &self.kind {
            ResourceKind::Leaf(_) if !self.children.is_empty() => {
                Err(self.topology("storage leaves cannot have children".to_string()))
            }
            ResourceKind::Compound => plugins::compound::validate(self),
            ResourceKind::Passthru if self.children.len() != 1 => Err(self.topology(format!(
                "passthru needs exactly one child, found {}",
                self.children.len()
            ))),
            ResourceKind::Replication => plugins::replication::validate(self),
            _ => Ok(()),
        }?;

        debug!(
            resource = %self.name,
            kind = %self.resource_type(),
            children = self.children.len(),
            "Resource started"
        );
        Ok(())
    }

    fn topology(&self, msg: String) -> ResourceError {
        ResourceError::InvalidResourceTopology {
            resource: self.name.clone(),
            msg,
        }
    }

    /// Sends a data operation down the object's hierarchy to the leaf.
    fn route<T>(
        &self,
        op: ResourceOp,
        object: &mut FileObject,
        at_leaf: impl FnOnce(
            &ResourceNode,
            &dyn StorageDriver,
            &mut FileObject,
        ) -> ResourceResult<T>,
    ) -> ResourceResult<T> {
        if let ResourceKind::Leaf(driver) = &self.kind {
            trace!(resource = %self.name, %op, path = %object.logical_path, "Executing at leaf");
            return at_leaf(self, driver.as_ref(), object).in_resource(op, &self.name);
        }

        let link = self.next_child(object).in_resource(op, &self.name)?;
        if op == ResourceOp::Open && matches!(self.kind, ResourceKind::Compound) {
            plugins::compound::check_direct_access(self, link, object)?;
        }
        link.node().route(op, object, at_leaf).in_resource(op, &self.name)
    }

    /// Creates the object on the bound leaf and opens it read-write.
    pub fn create(&self, object: &mut FileObject) -> ResourceResult<u64> {
        self.route(ResourceOp::Create, object, |leaf, driver, object| {
            let path = plugins::leaf::physical_path(leaf, object);
            let fd = driver.create(&path, object.mode)?;
            object.physical_path = path;
            Ok(fd)
        })
    }

    /// Opens the object on the bound leaf.
    pub fn open(&self, object: &mut FileObject, access: AccessMode) -> ResourceResult<u64> {
        self.route(ResourceOp::Open, object, |leaf, driver, object| {
            let path = plugins::leaf::physical_path(leaf, object);
            let fd = driver.open(&path, access)?;
            object.physical_path = path;
            Ok(fd)
        })
    }

    /// Reads up to `len` bytes from `fd`.
    pub fn read(&self, object: &mut FileObject, fd: u64, len: usize) -> ResourceResult<Vec<u8>> {
        self.route(ResourceOp::Read, object, |_, driver, _| driver.read(fd, len))
    }

    /// Writes `data` to `fd`.
    pub fn write(&self, object: &mut FileObject, fd: u64, data: &[u8]) -> ResourceResult<usize> {
        self.route(ResourceOp::Write, object, |_, driver, _| driver.write(fd, data))
    }

    /// Closes `fd`.
    pub fn close(&self, object: &mut FileObject, fd: u64) -> ResourceResult<()> {
        self.route(ResourceOp::Close, object, |_, driver, _| driver.close(fd))
    }

    /// Removes the object's physical file.
    pub fn unlink(&self, object: &mut FileObject) -> ResourceResult<()> {
        self.route(ResourceOp::Unlink, object, |leaf, driver, object| {
            let path = plugins::leaf::physical_path(leaf, object);
            driver.unlink(&path)
        })
    }

    /// Stats the object's physical file.
    pub fn stat(&self, object: &mut FileObject) -> ResourceResult<FileStat> {
        self.route(ResourceOp::Stat, object, |leaf, driver, object| {
            driver.stat(&plugins::leaf::physical_path(leaf, object))
        })
    }

    /// Repositions `fd`.
    pub fn lseek(
        &self,
        object: &mut FileObject,
        fd: u64,
        offset: i64,
        whence: Whence,
    ) -> ResourceResult<u64> {
        self.route(ResourceOp::Lseek, object, |_, driver, _| driver.lseek(fd, offset, whence))
    }

    /// Creates a collection at the object's physical path.
    pub fn mkdir(&self, object: &mut FileObject) -> ResourceResult<()> {
        self.route(ResourceOp::Mkdir, object, |leaf, driver, object| {
            driver.mkdir(&plugins::leaf::physical_path(leaf, object), object.mode)
        })
    }

    /// Removes the collection at the object's physical path.
    pub fn rmdir(&self, object: &mut FileObject) -> ResourceResult<()> {
        self.route(ResourceOp::Rmdir, object, |leaf, driver, object| {
            driver.rmdir(&plugins::leaf::physical_path(leaf, object))
        })
    }

    /// Opens the collection at the object's physical path.
    pub fn opendir(&self, object: &mut FileObject) -> ResourceResult<u64> {
        self.route(ResourceOp::Opendir, object, |leaf, driver, object| {
            driver.opendir(&plugins::leaf::physical_path(leaf, object))
        })
    }

    /// Next entry of an open collection.
    pub fn readdir(&self, object: &mut FileObject, handle: u64) -> ResourceResult<Option<String>> {
        self.route(ResourceOp::Readdir, object, |_, driver, _| driver.readdir(handle))
    }

    /// Closes an open collection.
    pub fn closedir(&self, object: &mut FileObject, handle: u64) -> ResourceResult<()> {
        self.route(ResourceOp::Closedir, object, |_, driver, _| driver.closedir(handle))
    }

    /// Moves the object's physical file to `new_path`.
    pub fn rename(&self, object: &mut FileObject, new_path: &str) -> ResourceResult<()> {
        self.route(ResourceOp::Rename, object, |leaf, driver, object| {
            let old = plugins::leaf::physical_path(leaf, object);
            driver.rename(&old, new_path)?;
            object.physical_path = new_path.to_string();
            Ok(())
        })
    }

    /// Sets the object's length.
    pub fn truncate(&self, object: &mut FileObject, len: u64) -> ResourceResult<()> {
        self.route(ResourceOp::Truncate, object, |leaf, driver, object| {
            driver.truncate(&plugins::leaf::physical_path(leaf, object), len)?;
            object.size = len;
            Ok(())
        })
    }

    /// Free space on the bound leaf.
    pub fn freespace(&self, object: &mut FileObject) -> ResourceResult<u64> {
        self.route(ResourceOp::Freespace, object, |_, driver, _| driver.freespace())
    }

    /// Runs the stage primitive on the leaf bound by `object`.
    pub fn stage_to_cache(
        &self,
        object: &mut FileObject,
        request: &StageRequest,
    ) -> ResourceResult<()> {
        self.route(ResourceOp::StageToCache, object, |_, driver, _| {
            driver.stage_to_cache(request)
        })
    }

    /// Runs the sync primitive on the leaf bound by `object`.
    pub fn sync_to_arch(
        &self,
        object: &mut FileObject,
        request: &SyncRequest,
    ) -> ResourceResult<Option<String>> {
        self.route(ResourceOp::SyncToArch, object, |_, driver, _| {
            driver.sync_to_arch(request)
        })
    }

    /// Notice that the object was registered in place.
    pub fn registered(&self, object: &mut FileObject) -> ResourceResult<()> {
        self.route(ResourceOp::Registered, object, |leaf, _, object| {
            debug!(resource = %leaf.name(), path = %object.logical_path, "Registered");
            Ok(())
        })
    }

    /// Notice that the object was unregistered.
    pub fn unregistered(&self, object: &mut FileObject) -> ResourceResult<()> {
        self.route(ResourceOp::Unregistered, object, |leaf, _, object| {
            debug!(resource = %leaf.name(), path = %object.logical_path, "Unregistered");
            Ok(())
        })
    }

    /// Votes on a hierarchy for `operation`, extending `path` with this node.
    pub fn resolve_hierarchy(
        &self,
        ctx: &mut RequestContext,
        operation: OperationType,
        object: &mut FileObject,
        path: &HierarchyPath,
    ) -> ResourceResult<Vote> {
        let vote = match &self.kind {
            ResourceKind::Compound => {
                plugins::compound::resolve(self, ctx, operation, object, path)
            }
            ResourceKind::Replication => {
                plugins::replication::resolve(self, ctx, operation, object, path)
            }
            ResourceKind::Deferred => {
                plugins::deferred::resolve(self, ctx, operation, object, path)
            }
            ResourceKind::LoadBalanced => {
                plugins::load_balanced::resolve(self, ctx, operation, object, path)
            }
            ResourceKind::Passthru => {
                plugins::passthru::resolve(self, ctx, operation, object, path)
            }
            ResourceKind::Leaf(_) => plugins::leaf::resolve(self, ctx, operation, object, path),
        }?;
        debug!(
            request = %ctx.request_id(),
            resource = %self.name,
            %operation,
            vote = vote.score,
            hierarchy = %vote.hierarchy,
            "Resolved"
        );
        Ok(vote)
    }

    /// Post-write hook for this node only.
    pub fn modified(
        &self,
        ctx: &mut RequestContext,
        object: &mut FileObject,
    ) -> ResourceResult<()> {
        match &self.kind {
            ResourceKind::Compound => plugins::compound::modified(self, ctx, object),
            ResourceKind::Replication => plugins::replication::modified(self, ctx, object),
            _ => Ok(()),
        }
        .in_resource(ResourceOp::Modified, &self.name)
    }

    /// Operation-type notice for this node only.
    pub fn notify(
        &self,
        ctx: &mut RequestContext,
        object: &FileObject,
        operation: OperationType,
    ) -> ResourceResult<()> {
        if let ResourceKind::Compound = self.kind {
            plugins::compound::notify(self, ctx, object, operation);
        }
        Ok(())
    }

    /// Repairs missing and stale replicas in this subtree.
    pub fn rebalance(&self, ctx: &mut RequestContext) -> ResourceResult<()> {
        crate::rebalance::rebalance(self, ctx)
    }

    /// Generic dispatcher over the whole operation surface.
    pub fn call(
        &self,
        ctx: &mut RequestContext,
        object: &mut FileObject,
        request: FileOp,
    ) -> ResourceResult<OpOutput> {
        Ok(match request {
            FileOp::Create => OpOutput::Descriptor(self.create(object)?),
            FileOp::Open(access) => OpOutput::Descriptor(self.open(object, access)?),
            FileOp::Read { fd, len } => OpOutput::Bytes(self.read(object, fd, len)?),
            FileOp::Write { fd, data } => OpOutput::Written(self.write(object, fd, &data)?),
            FileOp::Close { fd } => {
                self.close(object, fd)?;
                OpOutput::Unit
            }
            FileOp::Unlink => {
                self.unlink(object)?;
                OpOutput::Unit
            }
            FileOp::Stat => OpOutput::Stat(self.stat(object)?),
            FileOp::Lseek { fd, offset, whence } => {
                OpOutput::Offset(self.lseek(object, fd, offset, whence)?)
            }
            FileOp::Mkdir => {
                self.mkdir(object)?;
                OpOutput::Unit
            }
            FileOp::Rmdir => {
                self.rmdir(object)?;
                OpOutput::Unit
            }
            FileOp::Opendir => OpOutput::Descriptor(self.opendir(object)?),
            FileOp::Readdir { handle } => OpOutput::Entry(self.readdir(object, handle)?),
            FileOp::Closedir { handle } => {
                self.closedir(object, handle)?;
                OpOutput::Unit
            }
            FileOp::Rename { new_path } => {
                self.rename(object, &new_path)?;
                OpOutput::Unit
            }
            FileOp::Truncate { len } => {
                self.truncate(object, len)?;
                OpOutput::Unit
            }
            FileOp::Freespace => OpOutput::Space(self.freespace(object)?),
            FileOp::StageToCache(request) => {
                self.stage_to_cache(object, &request)?;
                OpOutput::Unit
            }
            FileOp::SyncToArch(request) => OpOutput::Renamed(self.sync_to_arch(object, &request)?),
            FileOp::Registered => {
                self.registered(object)?;
                OpOutput::Unit
            }
            FileOp::Unregistered => {
                self.unregistered(object)?;
                OpOutput::Unit
            }
            FileOp::Modified => {
                self.modified(ctx, object)?;
                OpOutput::Unit
            }
            FileOp::Notify(operation) => {
                self.notify(ctx, object, operation)?;
                OpOutput::Unit
            }
            FileOp::ResolveHierarchy(operation) => {
                let root = HierarchyPath::new();
                OpOutput::Vote(self.resolve_hierarchy(ctx, operation, object, &root)?)
            }
            FileOp::Rebalance => {
                self.rebalance(ctx)?;
                OpOutput::Unit
            }
        })
    }
}
