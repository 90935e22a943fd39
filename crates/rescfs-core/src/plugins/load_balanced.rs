//! Load-based placement for creates, best-vote selection for everything else.

use tracing::debug;

use crate::context::RequestContext;
use crate::error::{ResourceError, ResourceResult, ResultExt};
use crate::hierarchy::HierarchyPath;
use crate::node::{ChildLink, ResourceNode};
use crate::object::FileObject;
use crate::operation::{OperationType, ResourceOp};
use crate::vote::{select_best, Vote};

/// Load samples older than this many seconds are ignored.
pub const MAX_LOAD_AGE_SECS: u64 = 1800;

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

    if operation == OperationType::Create {
        let child = least_loaded(node, ctx)?;
        return super::ask(node, child, ctx, operation, object, &hierarchy);
    }

    let mut ballots = super::fan_out(node, ctx, operation, object, &hierarchy, node.children())?;
    match select_best(&mut ballots) {
        Some(best) if best.vote.is_positive() => {
            *object = best.object;
            Ok(best.vote)
        }
        _ if operation == OperationType::Open => Err(ResourceError::NoValidTarget {
            resource: node.name().to_string(),
            operation: operation.to_string(),
        }),
        _ => Ok(Vote::zero(hierarchy)),
    }
}

/// The child with the lowest fresh, non-negative load; ties go to the smaller name.
fn least_loaded<'a>(node: &'a ResourceNode, ctx: &RequestContext) -> ResourceResult<&'a ChildLink> {
    let loads = ctx
        .catalog()
        .get_load_lists()
        .in_resource(ResourceOp::ResolveHierarchy, node.name())?;
    let now = ctx.now_secs();

    let mut best: Option<(i64, &ChildLink)> = None;
    for child in node.children() {
        let Some(entry) = loads.iter().find(|e| e.resource == child.name()) else {
            continue;
        };
        if entry.load < 0 || now.saturating_sub(entry.timestamp) >= MAX_LOAD_AGE_SECS {
            debug!(
                resource = %node.name(),
                child = %child.name(),
                load = entry.load,
                "Skipping stale or unknown load"
            );
            continue;
        }
        let better = match best {
            None => true,
            Some((load, current)) => {
                entry.load < load || (entry.load == load && child.name() < current.name())
            }
        };
        if better {
            best = Some((entry.load, child));
        }
    }

    best.map(|(load, child)| {
        debug!(resource = %node.name(), child = %child.name(), load, "Least loaded child");
        child
    })
    .ok_or_else(|| ResourceError::NoValidTarget {
        resource: node.name().to_string(),
        operation: OperationType::Create.to_string(),
    })
}
