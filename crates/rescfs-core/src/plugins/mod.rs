//! Per-type resolve logic for resource nodes.

pub mod compound;
pub mod deferred;
pub mod leaf;
pub mod load_balanced;
pub mod passthru;
pub mod replication;

use tracing::warn;

use crate::context::RequestContext;
use crate::error::{ResourceResult, ResultExt};
use crate::hierarchy::HierarchyPath;
use crate::node::{ChildLink, ResourceNode};
use crate::object::FileObject;
use crate::operation::{OperationType, ResourceOp};
use crate::vote::{Ballot, Vote};

/// Asks one child to vote, attributing failures to `parent`.
pub(crate) fn ask(
    parent: &ResourceNode,
    child: &ChildLink,
    ctx: &mut RequestContext,
    operation: OperationType,
    object: &mut FileObject,
    path: &HierarchyPath,
) -> ResourceResult<Vote> {
    child
        .node()
        .resolve_hierarchy(ctx, operation, object, path)
        .in_resource(ResourceOp::ResolveHierarchy, parent.name())
}

/// Asks every child in `children` to vote on its own copy of `object`.
///
/// A failing child counts as a zero vote, unless it is the only candidate, in
/// which case its error is returned.
pub(crate) fn fan_out(
    parent: &ResourceNode,
    ctx: &mut RequestContext,
    operation: OperationType,
    object: &FileObject,
    path: &HierarchyPath,
    children: &[ChildLink],
) -> ResourceResult<Vec<Ballot>> {
    let single = children.len() == 1;
    let mut ballots = Vec::with_capacity(children.len());
    for child in children {
        let mut copy = object.clone();
        let vote = match ask(parent, child, ctx, operation, &mut copy, path) {
            Ok(vote) => vote,
            Err(e) if single => return Err(e),
            Err(e) => {
                warn!(
                    resource = %parent.name(),
                    child = %child.name(),
                    %operation,
                    error = %e,
                    "Child failed to vote, counting as zero"
                );
                Vote::zero(path.with_child(child.name()).unwrap_or_else(|_| path.clone()))
            }
        };
        ballots.push(Ballot {
            child: child.name().to_string(),
            vote,
            object: copy,
        });
    }
    Ok(ballots)
}
