//! Replication resources keep every child in sync.
//!
//! Resolve fans out to all children and picks the best vote. For creates, writes
//! and unlinks the other children that voted above zero are recorded as a
//! [`ReplicationPlan`] in the request context; `modified` then copies the new
//! bytes to them, or replays the unlink.

use tracing::{debug, info};

use crate::context::{ReplicationPlan, RequestContext};
use crate::error::{ResourceError, ResourceResult, ResultExt};
use crate::hierarchy::HierarchyPath;
use crate::node::ResourceNode;
use crate::object::{FileObject, IN_REPL_KW};
use crate::operation::{OperationType, ResourceOp};
use crate::properties::REPLICA_REQUESTS_KEY;
use crate::replicate::{replicate, ReplicationDirection};
use crate::vote::{select_best, Vote};

/// How a replication resource treats requests that pin a replica number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRequestPolicy {
    /// Fail such requests with `InvalidOperation`.
    Refuse,
    /// Resolve them like any other request.
    Allow,
}

impl ReplicaRequestPolicy {
    /// Policy configured on `node`; defaults to [`ReplicaRequestPolicy::Refuse`].
    pub fn of(node: &ResourceNode) -> ResourceResult<Self> {
        match node.properties().context_value(REPLICA_REQUESTS_KEY) {
            None | Some("refuse") => Ok(ReplicaRequestPolicy::Refuse),
            Some("allow") => Ok(ReplicaRequestPolicy::Allow),
            Some(other) => Err(ResourceError::bad_input(format!(
                "{REPLICA_REQUESTS_KEY}={other:?} on {} is neither refuse nor allow",
                node.name()
            ))),
        }
    }
}

pub(crate) fn validate(node: &ResourceNode) -> ResourceResult<()> {
    ReplicaRequestPolicy::of(node).map(|_| ())
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

    let pinned = object.replica_request.is_some() || object.has_keyword(IN_REPL_KW);
    if pinned && ReplicaRequestPolicy::of(node)? == ReplicaRequestPolicy::Refuse {
        return Err(ResourceError::InvalidOperation {
            resource: node.name().to_string(),
            operation: operation.to_string(),
            msg: "requests for a specific replica are refused".to_string(),
        });
    }

    let mut ballots = super::fan_out(node, ctx, operation, object, &hierarchy, node.children())?;
    let best = select_best(&mut ballots)
        .filter(|b| b.vote.is_positive())
        .ok_or_else(|| ResourceError::NoValidTarget {
            resource: node.name().to_string(),
            operation: operation.to_string(),
        })?;

    if operation != OperationType::Open {
        let siblings: Vec<HierarchyPath> = ballots
            .iter()
            .filter(|b| b.vote.is_positive())
            .map(|b| b.vote.hierarchy.clone())
            .collect();
        debug!(
            resource = %node.name(),
            selected = %best.vote.hierarchy,
            siblings = siblings.len(),
            "Recording replication plan"
        );
        ctx.record_plan(
            node.name(),
            ReplicationPlan {
                operation,
                logical_path: object.logical_path.clone(),
                selected: best.vote.hierarchy.clone(),
                siblings,
            },
        )?;
    }

    *object = best.object;
    Ok(best.vote)
}

/// Carries out the pending plan for `object`, if any.
pub(crate) fn modified(
    node: &ResourceNode,
    ctx: &mut RequestContext,
    object: &mut FileObject,
) -> ResourceResult<()> {
    let pending = ctx
        .plan(node.name())
        .is_some_and(|p| p.logical_path == object.logical_path);
    if !pending {
        return Ok(());
    }
    let Some(plan) = ctx.take_plan(node.name()) else {
        return Ok(());
    };

    let source = if object.hierarchy.contains(node.name()) {
        object.hierarchy.clone()
    } else {
        plan.selected.clone()
    };

    match plan.operation {
        OperationType::Create | OperationType::Write => {
            for sibling in &plan.siblings {
                replicate(node, object, ReplicationDirection::Copy, &source, sibling)?;
            }
            info!(
                resource = %node.name(),
                path = %object.logical_path,
                copies = plan.siblings.len(),
                "Replicated to siblings"
            );
        }
        OperationType::Unlink => {
            for sibling in &plan.siblings {
                let mut target = object.bound_to(sibling);
                node.unlink(&mut target).in_resource(ResourceOp::Unlink, node.name())?;
                object.forget_replica(sibling);
            }
            object.forget_replica(&source);
            info!(
                resource = %node.name(),
                path = %object.logical_path,
                removed = plan.siblings.len(),
                "Unlinked sibling replicas"
            );
        }
        OperationType::Open => {}
    }
    Ok(())
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

    fn disk(name: &str, volume: &Arc<MemoryVolume>) -> Arc<ResourceNode> {
        Arc::new(ResourceNode::leaf(
            name,
            ResourceProperties::on_host("host1").with_vault(format!("/{name}")),
            Arc::new(MemoryDriver::new(Arc::clone(volume))),
        ))
    }

    fn repl(volume: &Arc<MemoryVolume>, context: &str) -> ResourceNode {
        ResourceNode::new(
            "repl",
            ResourceKind::Replication,
            ResourceProperties::on_host("host1").with_context(context).unwrap(),
        )
        .with_child(ChildContext::default(), disk("c1", volume))
        .with_child(ChildContext::default(), disk("c2", volume))
        .with_child(ChildContext::default(), disk("c3", volume))
    }

    fn ctx() -> RequestContext {
        RequestContext::new("host1", Arc::new(MockCatalog::new()))
    }

    fn hier(s: &str) -> HierarchyPath {
        HierarchyPath::from_string(s).unwrap()
    }

    #[test]
    fn test_create_records_siblings() {
        let volume = Arc::new(MemoryVolume::default());
        let node = repl(&volume, "");
        let mut ctx = ctx();
        let mut obj = FileObject::new("/zone/f");
        let vote = node
            .resolve_hierarchy(&mut ctx, OperationType::Create, &mut obj, &HierarchyPath::new())
            .unwrap();
        assert_eq!(vote.hierarchy.to_string(), "repl;c1");

        let plan = ctx.plan("repl").unwrap();
        assert_eq!(plan.operation, OperationType::Create);
        assert_eq!(plan.siblings, vec![hier("repl;c2"), hier("repl;c3")]);
    }

    #[test]
    fn test_open_records_nothing() {
        let volume = Arc::new(MemoryVolume::default());
        let node = repl(&volume, "");
        let mut ctx = ctx();
        let mut obj = FileObject::new("/zone/f")
            .with_replica(PhysicalReplica::good(0, hier("repl;c2"), "/c2/zone/f"));
        let vote = node
            .resolve_hierarchy(&mut ctx, OperationType::Open, &mut obj, &HierarchyPath::new())
            .unwrap();
        assert_eq!(vote.hierarchy.to_string(), "repl;c2");
        assert!(ctx.plan("repl").is_none());
    }

    #[test]
    fn test_no_valid_child() {
        let volume = Arc::new(MemoryVolume::default());
        let node = repl(&volume, "");
        let err = node
            .resolve_hierarchy(
                &mut ctx(),
                OperationType::Open,
                &mut FileObject::new("/zone/none"),
                &HierarchyPath::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoValidTarget);
    }

    #[test]
    fn test_replica_request_policy() {
        let volume = Arc::new(MemoryVolume::default());
        let mut obj = FileObject::new("/zone/f")
            .with_replica(PhysicalReplica::good(4, hier("repl;c3"), "/c3/zone/f"));
        obj.replica_request = Some(4);

        let err = repl(&volume, "")
            .resolve_hierarchy(
                &mut ctx(),
                OperationType::Open,
                &mut obj.clone(),
                &HierarchyPath::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);

        let vote = repl(&volume, "replica_requests=allow")
            .resolve_hierarchy(&mut ctx(), OperationType::Open, &mut obj, &HierarchyPath::new())
            .unwrap();
        assert_eq!(vote.hierarchy.to_string(), "repl;c3");

        assert!(repl(&volume, "replica_requests=maybe").start_operation().is_err());
    }

    #[test]
    fn test_down_votes_zero() {
        let volume = Arc::new(MemoryVolume::default());
        let node = ResourceNode::new(
            "repl",
            ResourceKind::Replication,
            ResourceProperties::default().with_status(ResourceStatus::Down),
        )
        .with_child(ChildContext::default(), disk("c1", &volume));
        let vote = node
            .resolve_hierarchy(
                &mut ctx(),
                OperationType::Create,
                &mut FileObject::new("/z"),
                &HierarchyPath::new(),
            )
            .unwrap();
        assert_eq!(vote.score, 0.0);
    }

    #[test]
    fn test_modified_copies_to_siblings() {
        let volume = Arc::new(MemoryVolume::default());
        let node = repl(&volume, "");
        let mut ctx = ctx();
        let mut obj = FileObject::new("/zone/f");
        let vote = node
            .resolve_hierarchy(&mut ctx, OperationType::Create, &mut obj, &HierarchyPath::new())
            .unwrap();
        obj.hierarchy = vote.hierarchy;

        let fd = node.create(&mut obj).unwrap();
        node.write(&mut obj, fd, b"replicated bytes").unwrap();
        node.close(&mut obj, fd).unwrap();
        let selected = obj.hierarchy.clone();
        let written = obj.physical_path.clone();
        obj.register_replica(&selected, &written, 16);

        node.modified(&mut ctx, &mut obj).unwrap();
        assert!(ctx.plan("repl").is_none());
        for leaf in ["c1", "c2", "c3"] {
            assert_eq!(
                volume.get(&format!("/{leaf}/zone/f")).unwrap(),
                b"replicated bytes"
            );
        }
        assert_eq!(obj.replicas.len(), 3);
        assert_eq!(volume.open_handles(), 0);
    }

    #[test]
    fn test_write_refreshes_every_sibling() {
        let volume = Arc::new(MemoryVolume::default());
        let mut obj = FileObject::new("/zone/f");
        for (n, leaf) in ["c1", "c2", "c3"].iter().enumerate() {
            volume.put(&format!("/{leaf}/zone/f"), b"old");
            obj.replicas.push(PhysicalReplica::good(
                n as u32,
                hier(&format!("repl;{leaf}")),
                format!("/{leaf}/zone/f"),
            ));
        }

        let node = repl(&volume, "");
        let mut ctx = ctx();
        let vote = node
            .resolve_hierarchy(&mut ctx, OperationType::Write, &mut obj, &HierarchyPath::new())
            .unwrap();
        assert_eq!(vote.hierarchy.to_string(), "repl;c1");
        let plan = ctx.plan("repl").unwrap();
        assert_eq!(plan.operation, OperationType::Write);
        assert_eq!(plan.siblings, vec![hier("repl;c2"), hier("repl;c3")]);

        let mut obj = obj.bound_to(&vote.hierarchy);
        let fd = node.open(&mut obj, AccessMode::ReadWrite).unwrap();
        node.write(&mut obj, fd, b"rewritten contents").unwrap();
        node.close(&mut obj, fd).unwrap();

        node.modified(&mut ctx, &mut obj).unwrap();
        assert!(ctx.plan("repl").is_none());
        for leaf in ["c1", "c2", "c3"] {
            assert_eq!(
                volume.get(&format!("/{leaf}/zone/f")).unwrap(),
                b"rewritten contents"
            );
        }
        assert_eq!(obj.replicas.len(), 3);
        assert_eq!(volume.open_handles(), 0);
    }

    #[test]
    fn test_unlink_propagates() {
        let volume = Arc::new(MemoryVolume::default());
        for leaf in ["c1", "c2", "c3"] {
            volume.put(&format!("/{leaf}/zone/f"), b"x");
        }
        let mut obj = FileObject::new("/zone/f");
        for (n, leaf) in ["c1", "c2", "c3"].iter().enumerate() {
            obj.replicas.push(PhysicalReplica::good(
                n as u32,
                hier(&format!("repl;{leaf}")),
                format!("/{leaf}/zone/f"),
            ));
        }

        let node = repl(&volume, "");
        let mut ctx = ctx();
        let vote = node
            .resolve_hierarchy(&mut ctx, OperationType::Unlink, &mut obj, &HierarchyPath::new())
            .unwrap();
        obj = obj.bound_to(&vote.hierarchy);
        node.unlink(&mut obj).unwrap();
        node.modified(&mut ctx, &mut obj).unwrap();

        for leaf in ["c1", "c2", "c3"] {
            assert!(!volume.exists(&format!("/{leaf}/zone/f")));
        }
        assert!(obj.replicas.is_empty());
    }
}
