//! Highest-vote selection without further policy.

use crate::context::RequestContext;
use crate::error::ResourceResult;
use crate::hierarchy::HierarchyPath;
use crate::node::ResourceNode;
use crate::object::FileObject;
use crate::operation::OperationType;
use crate::vote::{select_best, Vote};

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
    let mut ballots = super::fan_out(node, ctx, operation, object, &hierarchy, node.children())?;
    match select_best(&mut ballots) {
        Some(best) if best.vote.is_positive() => {
            *object = best.object;
            Ok(best.vote)
        }
        _ => Ok(Vote::zero(hierarchy)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::MockCatalog;
    use crate::driver::{MemoryDriver, MemoryVolume};
    use crate::node::ResourceKind;
    use crate::properties::{ChildContext, ResourceProperties, ResourceStatus};

    fn disk(name: &str, host: &str, status: ResourceStatus) -> Arc<ResourceNode> {
        Arc::new(ResourceNode::leaf(
            name,
            ResourceProperties::on_host(host).with_status(status),
            Arc::new(MemoryDriver::new(Arc::new(MemoryVolume::default()))),
        ))
    }

    fn ctx() -> RequestContext {
        RequestContext::new("host1", Arc::new(MockCatalog::new()))
    }

    #[test]
    fn test_skips_down_child() {
        let node = ResourceNode::new("def", ResourceKind::Deferred, ResourceProperties::default())
            .with_child(ChildContext::default(), disk("a", "host1", ResourceStatus::Down))
            .with_child(ChildContext::default(), disk("b", "host1", ResourceStatus::Up));
        let mut obj = FileObject::new("/zone/x");
        let vote = node
            .resolve_hierarchy(&mut ctx(), OperationType::Create, &mut obj, &HierarchyPath::new())
            .unwrap();
        assert_eq!(vote.score, 1.0);
        assert_eq!(vote.hierarchy.to_string(), "def;b");
    }

    #[test]
    fn test_prefers_local_then_name() {
        let node = ResourceNode::new("def", ResourceKind::Deferred, ResourceProperties::default())
            .with_child(ChildContext::default(), disk("remote", "host9", ResourceStatus::Up))
            .with_child(ChildContext::default(), disk("z", "host1", ResourceStatus::Up))
            .with_child(ChildContext::default(), disk("y", "host1", ResourceStatus::Up));
        let mut obj = FileObject::new("/zone/x");
        let vote = node
            .resolve_hierarchy(&mut ctx(), OperationType::Create, &mut obj, &HierarchyPath::new())
            .unwrap();
        assert_eq!(vote.hierarchy.to_string(), "def;y");
    }

    #[test]
    fn test_all_zero() {
        let node = ResourceNode::new("def", ResourceKind::Deferred, ResourceProperties::default())
            .with_child(ChildContext::default(), disk("a", "host1", ResourceStatus::Up));
        let mut obj = FileObject::new("/zone/missing");
        let vote = node
            .resolve_hierarchy(&mut ctx(), OperationType::Open, &mut obj, &HierarchyPath::new())
            .unwrap();
        assert_eq!(vote.score, 0.0);
        assert_eq!(vote.hierarchy.to_string(), "def");
    }

    #[test]
    fn test_down_votes_zero() {
        let node = ResourceNode::new(
            "def",
            ResourceKind::Deferred,
            ResourceProperties::default().with_status(ResourceStatus::Down),
        )
        .with_child(ChildContext::default(), disk("a", "host1", ResourceStatus::Up));
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
}
