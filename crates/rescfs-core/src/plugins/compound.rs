//! Compound resources: a fast cache child in front of a slow archive child.
//!
//! Creates always land in the cache. Opens and writes are served from the cache
//! when it holds a replica; otherwise the object is staged from the archive first.
//! After the cache copy changes, `modified` syncs it back to the archive.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, info};

use crate::context::{RequestContext, STAGE_POLICY_KEY};
use crate::error::{ResourceError, ResourceResult};
use crate::hierarchy::HierarchyPath;
use crate::node::{ChildLink, ResourceNode};
use crate::object::{FileObject, IN_REPL_KW, RESC_HIER_STR_KW, STAGE_OBJ_KW, SYNC_OBJ_KW};
use crate::operation::OperationType;
use crate::properties::{CompoundRole, AUTO_REPL_KEY};
use crate::replicate::{replicate, ReplicationDirection};
use crate::vote::Vote;

/// Where opens look first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StagePolicy {
    /// Use the cache copy when there is one.
    #[default]
    PreferCache,
    /// Always refresh the cache from the archive when the archive has the object.
    PreferArchive,
}

impl FromStr for StagePolicy {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "prefer_cache" => Ok(StagePolicy::PreferCache),
            "prefer_archive" => Ok(StagePolicy::PreferArchive),
            other => Err(ResourceError::bad_input(format!("invalid stage policy {other:?}"))),
        }
    }
}

impl fmt::Display for StagePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagePolicy::PreferCache => f.write_str("prefer_cache"),
            StagePolicy::PreferArchive => f.write_str("prefer_archive"),
        }
    }
}

impl StagePolicy {
    /// Policy selected by the request's rule results.
    pub fn for_request(ctx: &RequestContext) -> ResourceResult<Self> {
        ctx.rule_result(STAGE_POLICY_KEY).unwrap_or_default().parse()
    }
}

pub(crate) fn validate(node: &ResourceNode) -> ResourceResult<()> {
    let topology = |msg: String| ResourceError::InvalidResourceTopology {
        resource: node.name().to_string(),
        msg,
    };
    if node.children().len() != 2 {
        return Err(topology(format!(
            "compound needs exactly two children, found {}",
            node.children().len()
        )));
    }
    let roles: Vec<_> = node.children().iter().map(|c| c.context().role()).collect();
    match roles.as_slice() {
        [Some(a), Some(b)] if a != b => Ok(()),
        _ => Err(topology(
            "compound children must be tagged cache and archive".to_string(),
        )),
    }
}

pub(crate) fn resolve(
    node: &ResourceNode,
    ctx: &mut RequestContext,
    operation: OperationType,
    object: &mut FileObject,
    path: &HierarchyPath,
) -> ResourceResult<Vote> {
    let hierarchy = path.with_child(node.name())?;
    if node.is_down() {
        return Ok(Vote::zero(hierarchy));
    }
    let cache = node.child_with_role(CompoundRole::Cache)?;
    let archive = node.child_with_role(CompoundRole::Archive)?;

    match operation {
        OperationType::Create => super::ask(node, cache, ctx, operation, object, &hierarchy),
        OperationType::Unlink => {
            let mut cached = object.clone();
            let vote = super::ask(node, cache, ctx, operation, &mut cached, &hierarchy)?;
            if vote.is_positive() {
                *object = cached;
                return Ok(vote);
            }
            super::ask(node, archive, ctx, operation, object, &hierarchy)
        }
        OperationType::Open | OperationType::Write => {
            if let Some(vote) = requested_archive_hierarchy(node, archive, object)? {
                return Ok(vote);
            }
            let policy = StagePolicy::for_request(ctx)?;
            debug!(resource = %node.name(), %policy, %operation, "Resolving through compound");
            let vote = match policy {
                StagePolicy::PreferCache => {
                    prefer_cache(node, ctx, operation, cache, archive, object, &hierarchy)
                }
                StagePolicy::PreferArchive => {
                    prefer_archive(node, ctx, operation, cache, archive, object, &hierarchy)
                }
            }?;
            if vote.is_positive() {
                replace_archive_for_replica(object, archive.name(), &vote.hierarchy);
            }
            Ok(vote)
        }
    }
}

/// A caller-supplied hierarchy that already goes through the archive wins outright.
fn requested_archive_hierarchy(
    node: &ResourceNode,
    archive: &ChildLink,
    object: &FileObject,
) -> ResourceResult<Option<Vote>> {
    let Some(raw) = object.keyword(RESC_HIER_STR_KW) else {
        return Ok(None);
    };
    let requested = HierarchyPath::from_string(raw)?;
    if requested.contains(node.name()) && requested.contains(archive.name()) {
        debug!(
            resource = %node.name(),
            hierarchy = %requested,
            "Using requested archive hierarchy"
        );
        return Ok(Some(Vote::new(1.0, requested)));
    }
    Ok(None)
}

#[allow(clippy::too_many_arguments)]
fn prefer_cache(
    node: &ResourceNode,
    ctx: &mut RequestContext,
    operation: OperationType,
    cache: &ChildLink,
    archive: &ChildLink,
    object: &mut FileObject,
    hierarchy: &HierarchyPath,
) -> ResourceResult<Vote> {
    let mut cached = object.clone();
    let cache_vote = super::ask(node, cache, ctx, operation, &mut cached, hierarchy)?;
    if cache_vote.is_positive() {
        *object = cached;
        return Ok(cache_vote);
    }

    let mut archived = object.clone();
    archived.replica_request = None;
    let archive_vote = super::ask(node, archive, ctx, operation, &mut archived, hierarchy)?;
    if !archive_vote.is_positive() {
        return Ok(Vote::zero(hierarchy.clone()));
    }

    let staged = stage(node, ctx, cache, &mut archived, &archive_vote.hierarchy, hierarchy)?;
    archived.replica_request = object.replica_request;
    *object = archived;
    Ok(archive_vote.with_hierarchy(staged))
}

#[allow(clippy::too_many_arguments)]
fn prefer_archive(
    node: &ResourceNode,
    ctx: &mut RequestContext,
    operation: OperationType,
    cache: &ChildLink,
    archive: &ChildLink,
    object: &mut FileObject,
    hierarchy: &HierarchyPath,
) -> ResourceResult<Vote> {
    let mut archived = object.clone();
    // Only a leaf archive can be pinned; coordinating archives pick their own replica.
    archived.replica_request = if archive.node().is_leaf() {
        object
            .replicas
            .iter()
            .find(|r| r.hierarchy.contains(archive.name()))
            .map(|r| r.number)
            .or(object.replica_request)
    } else {
        None
    };
    let archive_vote = super::ask(node, archive, ctx, operation, &mut archived, hierarchy)?;

    if !archive_vote.is_positive() {
        let mut cached = object.clone();
        let cache_vote = super::ask(node, cache, ctx, operation, &mut cached, hierarchy)?;
        if !cache_vote.is_positive() {
            return Ok(Vote::zero(hierarchy.clone()));
        }
        *object = cached;
        return Ok(cache_vote);
    }

    archived.replica_request = None;
    let staged = stage(node, ctx, cache, &mut archived, &archive_vote.hierarchy, hierarchy)?;
    archived.replica_request = object.replica_request;
    *object = archived;
    Ok(archive_vote.with_hierarchy(staged))
}

/// Full hierarchy for a new replica on `child`, resolving through it when it is
/// not a leaf.
fn placement(
    node: &ResourceNode,
    ctx: &mut RequestContext,
    child: &ChildLink,
    object: &FileObject,
    prefix: &HierarchyPath,
) -> ResourceResult<HierarchyPath> {
    if child.node().is_leaf() {
        return prefix.with_child(child.name());
    }
    let mut candidate = object.clone();
    candidate.replica_request = None;
    let vote = super::ask(node, child, ctx, OperationType::Create, &mut candidate, prefix)?;
    if !vote.is_positive() {
        return Err(ResourceError::NoValidTarget {
            resource: child.name().to_string(),
            operation: OperationType::Create.to_string(),
        });
    }
    Ok(vote.hierarchy)
}

fn stage(
    node: &ResourceNode,
    ctx: &mut RequestContext,
    cache: &ChildLink,
    object: &mut FileObject,
    source: &HierarchyPath,
    prefix: &HierarchyPath,
) -> ResourceResult<HierarchyPath> {
    let destination = placement(node, ctx, cache, object, prefix)?;
    replicate(node, object, ReplicationDirection::Stage, source, &destination)?;
    Ok(destination)
}

/// Points the archive replica entry at `resolved` unless a replica is already there.
pub(crate) fn replace_archive_for_replica(
    object: &mut FileObject,
    archive: &str,
    resolved: &HierarchyPath,
) {
    if object.replica_at(resolved).is_some() {
        return;
    }
    if let Some(replica) = object
        .replicas
        .iter_mut()
        .find(|r| r.hierarchy.contains(archive))
    {
        replica.hierarchy = resolved.clone();
    }
}

/// Refuses opens that reach the archive directly, outside stage, sync and
/// replica copies.
pub(crate) fn check_direct_access(
    node: &ResourceNode,
    next: &ChildLink,
    object: &FileObject,
) -> ResourceResult<()> {
    let replicating = [STAGE_OBJ_KW, SYNC_OBJ_KW, IN_REPL_KW]
        .iter()
        .any(|kw| object.has_keyword(kw));
    if next.context().role() == Some(CompoundRole::Archive) && !replicating {
        return Err(ResourceError::DirectArchiveAccess {
            resource: node.name().to_string(),
            archive: next.name().to_string(),
        });
    }
    Ok(())
}

/// Whether `modified` should sync to the archive.
pub fn auto_replication_enabled(node: &ResourceNode) -> bool {
    matches!(node.properties().context_value(AUTO_REPL_KEY), None | Some("on"))
}

pub(crate) fn modified(
    node: &ResourceNode,
    ctx: &mut RequestContext,
    object: &mut FileObject,
) -> ResourceResult<()> {
    if !auto_replication_enabled(node) {
        debug!(resource = %node.name(), "Auto replication disabled");
        return Ok(());
    }
    if object.in_pdmo.contains(node.name()) {
        debug!(resource = %node.name(), "Object already being replicated here");
        return Ok(());
    }

    let archive = node.child_with_role(CompoundRole::Archive)?;
    let current = object.hierarchy.next(node.name())?;
    if current == archive.name() {
        debug!(resource = %node.name(), "Written through the archive, nothing to sync");
        return Ok(());
    }

    let prefix = object.hierarchy.prefix_through(node.name())?;
    let destination = placement(node, ctx, archive, object, &prefix)?;
    let source = object.hierarchy.clone();
    info!(
        resource = %node.name(),
        path = %object.logical_path,
        noted = ?ctx.noted_operation(node.name()),
        "Syncing cache to archive"
    );
    replicate(node, object, ReplicationDirection::Sync, &source, &destination)
}

pub(crate) fn notify(
    node: &ResourceNode,
    ctx: &mut RequestContext,
    object: &FileObject,
    operation: OperationType,
) {
    match operation {
        OperationType::Write | OperationType::Create => {
            debug!(
                resource = %node.name(),
                path = %object.logical_path,
                %operation,
                "Noted operation"
            );
            ctx.note_operation(node.name(), operation);
        }
        _ => debug!(resource = %node.name(), %operation, "Skipping notification"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::MockCatalog;
    use crate::driver::{MemoryDriver, MemoryVolume};
    use crate::error::ErrorKind;
    use crate::node::ResourceKind;
    use crate::object::PhysicalReplica;
    use crate::operation::AccessMode;
    use crate::properties::{ChildContext, ResourceProperties, ResourceStatus};

    fn hier(s: &str) -> HierarchyPath {
        HierarchyPath::from_string(s).unwrap()
    }

    fn disk(name: &str, volume: &Arc<MemoryVolume>) -> Arc<ResourceNode> {
        Arc::new(ResourceNode::leaf(
            name,
            ResourceProperties::on_host("host1").with_vault(format!("/{name}")),
            Arc::new(MemoryDriver::new(Arc::clone(volume))),
        ))
    }

    fn compound_with(volume: &Arc<MemoryVolume>, props: ResourceProperties) -> ResourceNode {
        ResourceNode::new("comp", ResourceKind::Compound, props)
            .with_child(ChildContext::cache(), disk("cache", volume))
            .with_child(ChildContext::archive(), disk("arch", volume))
    }

    fn compound(volume: &Arc<MemoryVolume>) -> ResourceNode {
        compound_with(volume, ResourceProperties::on_host("host1"))
    }

    fn ctx() -> RequestContext {
        RequestContext::new("host1", Arc::new(MockCatalog::new()))
    }

    fn on_archive(volume: &MemoryVolume) -> FileObject {
        volume.put("/arch/zone/f", b"archived");
        FileObject::new("/zone/f").with_replica(PhysicalReplica::good(
            0,
            hier("comp;arch"),
            "/arch/zone/f",
        ))
    }

    fn resolve_root(
        node: &ResourceNode,
        ctx: &mut RequestContext,
        op: OperationType,
        obj: &mut FileObject,
    ) -> ResourceResult<Vote> {
        node.resolve_hierarchy(ctx, op, obj, &HierarchyPath::new())
    }

    #[test]
    fn test_topology_validation() {
        let volume = Arc::new(MemoryVolume::default());
        assert!(compound(&volume).start_operation().is_ok());

        let two_caches = ResourceNode::new(
            "comp",
            ResourceKind::Compound,
            ResourceProperties::default(),
        )
        .with_child(ChildContext::cache(), disk("a", &volume))
        .with_child(ChildContext::cache(), disk("b", &volume));
        assert_eq!(
            two_caches.start_operation().unwrap_err().kind(),
            ErrorKind::InvalidResourceTopology
        );

        let one_child = ResourceNode::new(
            "comp",
            ResourceKind::Compound,
            ResourceProperties::default(),
        )
        .with_child(ChildContext::cache(), disk("a", &volume));
        assert!(one_child.start_operation().is_err());

        let untagged = ResourceNode::new(
            "comp",
            ResourceKind::Compound,
            ResourceProperties::default(),
        )
        .with_child(ChildContext::cache(), disk("a", &volume))
        .with_child(ChildContext::default(), disk("b", &volume));
        assert!(untagged.start_operation().is_err());
    }

    #[test]
    fn test_create_goes_to_cache() {
        let volume = Arc::new(MemoryVolume::default());
        let vote = resolve_root(
            &compound(&volume),
            &mut ctx(),
            OperationType::Create,
            &mut FileObject::new("/zone/new"),
        )
        .unwrap();
        assert_eq!(vote.hierarchy.to_string(), "comp;cache");
        assert_eq!(vote.score, 1.0);
    }

    #[test]
    fn test_down_votes_zero() {
        let volume = Arc::new(MemoryVolume::default());
        let node = compound_with(
            &volume,
            ResourceProperties::on_host("host1").with_status(ResourceStatus::Down),
        );
        let mut obj = on_archive(&volume);
        for op in [OperationType::Create, OperationType::Open] {
            assert_eq!(resolve_root(&node, &mut ctx(), op, &mut obj).unwrap().score, 0.0);
        }
        assert_eq!(volume.stats().stages, 0);
    }

    #[test]
    fn test_cache_hit_does_not_stage() {
        let volume = Arc::new(MemoryVolume::default());
        volume.put("/cache/zone/f", b"hot");
        let mut obj = on_archive(&volume)
            .with_replica(PhysicalReplica::good(1, hier("comp;cache"), "/cache/zone/f"));
        let vote = resolve_root(
            &compound(&volume),
            &mut ctx(),
            OperationType::Open,
            &mut obj,
        )
        .unwrap();
        assert_eq!(vote.hierarchy.to_string(), "comp;cache");
        assert_eq!(volume.stats().stages, 0);
    }

    #[test]
    fn test_cache_miss_stages_once() {
        let volume = Arc::new(MemoryVolume::default());
        let mut obj = on_archive(&volume);
        let vote = resolve_root(
            &compound(&volume),
            &mut ctx(),
            OperationType::Open,
            &mut obj,
        )
        .unwrap();
        assert_eq!(vote.hierarchy.to_string(), "comp;cache");
        assert_eq!(vote.score, 1.0);
        assert_eq!(volume.stats().stages, 1);
        assert_eq!(volume.get("/cache/zone/f").unwrap(), b"archived");
        assert!(obj.replica_at(&hier("comp;cache")).is_some());
        assert!(obj.replica_at(&hier("comp;arch")).is_some());
    }

    #[test]
    fn test_missing_everywhere_votes_zero() {
        let volume = Arc::new(MemoryVolume::default());
        let vote = resolve_root(
            &compound(&volume),
            &mut ctx(),
            OperationType::Open,
            &mut FileObject::new("/zone/none"),
        )
        .unwrap();
        assert_eq!(vote.score, 0.0);
    }

    #[test]
    fn test_prefer_archive_restages() {
        let volume = Arc::new(MemoryVolume::default());
        volume.put("/cache/zone/f", b"old");
        let mut obj = on_archive(&volume)
            .with_replica(PhysicalReplica::good(1, hier("comp;cache"), "/cache/zone/f"));
        let mut ctx = ctx().with_rule_results("stage_to_cache_policy=prefer_archive").unwrap();
        let vote = resolve_root(
            &compound(&volume),
            &mut ctx,
            OperationType::Open,
            &mut obj,
        )
        .unwrap();
        assert_eq!(vote.hierarchy.to_string(), "comp;cache");
        assert_eq!(volume.get("/cache/zone/f").unwrap(), b"archived");
        assert_eq!(volume.stats().stages, 1);
        assert_eq!(obj.replica_request, None);
    }

    #[test]
    fn test_prefer_archive_falls_back_to_cache() {
        let volume = Arc::new(MemoryVolume::default());
        let mut obj = FileObject::new("/zone/f")
            .with_replica(PhysicalReplica::good(1, hier("comp;cache"), "/cache/zone/f"));
        let mut ctx = ctx().with_rule_results("stage_to_cache_policy=prefer_archive").unwrap();
        let vote = resolve_root(
            &compound(&volume),
            &mut ctx,
            OperationType::Open,
            &mut obj,
        )
        .unwrap();
        assert_eq!(vote.hierarchy.to_string(), "comp;cache");
        assert_eq!(volume.stats().stages, 0);
    }

    #[test]
    fn test_prefer_archive_over_replicated_archive() {
        let volume = Arc::new(MemoryVolume::default());
        let archive = Arc::new(
            ResourceNode::new(
                "repl",
                ResourceKind::Replication,
                ResourceProperties::on_host("host1"),
            )
            .with_child(ChildContext::default(), disk("r1", &volume)),
        );
        let node = ResourceNode::new(
            "comp",
            ResourceKind::Compound,
            ResourceProperties::on_host("host1"),
        )
        .with_child(ChildContext::cache(), disk("cache", &volume))
        .with_child(ChildContext::archive(), archive);
        assert!(node.start_operation().is_ok());

        volume.put("/r1/zone/f", b"replicated archive");
        let stored = FileObject::new("/zone/f")
            .with_replica(PhysicalReplica::good(0, hier("comp;repl;r1"), "/r1/zone/f"));

        let mut obj = stored.clone();
        let mut archive_first = ctx()
            .with_rule_results("stage_to_cache_policy=prefer_archive")
            .unwrap();
        let vote = resolve_root(&node, &mut archive_first, OperationType::Open, &mut obj).unwrap();
        assert_eq!(vote.hierarchy.to_string(), "comp;cache");
        assert_eq!(vote.score, 1.0);
        assert_eq!(volume.stats().stages, 1);
        assert_eq!(volume.get("/cache/zone/f").unwrap(), b"replicated archive");

        let mut obj = stored;
        let vote = resolve_root(&node, &mut ctx(), OperationType::Open, &mut obj).unwrap();
        assert_eq!(vote.hierarchy.to_string(), "comp;cache");
    }

    #[test]
    fn test_invalid_policy() {
        let volume = Arc::new(MemoryVolume::default());
        let mut ctx = ctx().with_rule_results("stage_to_cache_policy=sometimes").unwrap();
        let err = resolve_root(
            &compound(&volume),
            &mut ctx,
            OperationType::Open,
            &mut on_archive(&volume),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);
    }

    #[test]
    fn test_requested_archive_hierarchy() {
        let volume = Arc::new(MemoryVolume::default());
        let mut obj = on_archive(&volume);
        obj.set_keyword(RESC_HIER_STR_KW, "comp;arch");
        let vote = resolve_root(
            &compound(&volume),
            &mut ctx(),
            OperationType::Open,
            &mut obj,
        )
        .unwrap();
        assert_eq!(vote.score, 1.0);
        assert_eq!(vote.hierarchy.to_string(), "comp;arch");
        assert_eq!(volume.stats().stages, 0);
    }

    #[test]
    fn test_unlink_falls_through_to_archive() {
        let volume = Arc::new(MemoryVolume::default());
        let mut obj = on_archive(&volume);
        let vote = resolve_root(
            &compound(&volume),
            &mut ctx(),
            OperationType::Unlink,
            &mut obj,
        )
        .unwrap();
        assert_eq!(vote.hierarchy.to_string(), "comp;arch");
    }

    #[test]
    fn test_direct_archive_open_refused() {
        let volume = Arc::new(MemoryVolume::default());
        let node = compound(&volume);
        let mut obj = on_archive(&volume).bound_to(&hier("comp;arch"));
        let err = node.open(&mut obj, AccessMode::ReadOnly).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DirectArchiveAccess);

        for keyword in [STAGE_OBJ_KW, IN_REPL_KW] {
            let mut replicating = obj.clone();
            replicating.set_keyword(keyword, "1");
            let fd = node.open(&mut replicating, AccessMode::ReadOnly).unwrap();
            node.close(&mut replicating, fd).unwrap();
        }
    }

    #[test]
    fn test_modified_syncs_to_archive() {
        let volume = Arc::new(MemoryVolume::default());
        let node = compound(&volume);
        let mut ctx = ctx();
        let mut obj = FileObject::new("/zone/new");
        let vote = resolve_root(&node, &mut ctx, OperationType::Create, &mut obj).unwrap();
        obj.hierarchy = vote.hierarchy;
        node.notify(&mut ctx, &obj, OperationType::Create).unwrap();

        let fd = node.create(&mut obj).unwrap();
        node.write(&mut obj, fd, b"fresh").unwrap();
        node.close(&mut obj, fd).unwrap();
        node.modified(&mut ctx, &mut obj).unwrap();

        assert_eq!(volume.get("/arch/zone/new").unwrap(), b"fresh");
        assert_eq!(volume.stats().syncs, 1);
        assert!(obj.replica_at(&hier("comp;arch")).is_some());
        assert_eq!(ctx.noted_operation("comp"), Some(OperationType::Create));
    }

    #[test]
    fn test_auto_repl_off() {
        let volume = Arc::new(MemoryVolume::default());
        let node = compound_with(
            &volume,
            ResourceProperties::on_host("host1").with_context("auto_repl=off").unwrap(),
        );
        assert!(!auto_replication_enabled(&node));
        let mut obj = FileObject::new("/zone/new").bound_to(&hier("comp;cache"));
        node.modified(&mut ctx(), &mut obj).unwrap();
        assert_eq!(volume.stats().syncs, 0);
    }

    #[test]
    fn test_notify_ignores_open() {
        let volume = Arc::new(MemoryVolume::default());
        let node = compound(&volume);
        let mut ctx = ctx();
        node.notify(&mut ctx, &FileObject::new("/z"), OperationType::Open).unwrap();
        assert_eq!(ctx.noted_operation("comp"), None);
        node.notify(&mut ctx, &FileObject::new("/z"), OperationType::Write).unwrap();
        assert_eq!(ctx.noted_operation("comp"), Some(OperationType::Write));
    }
}
