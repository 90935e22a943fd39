//! Single-child decorator that scales the child's vote.
//!
//! Opens are scaled by the `read` weight, creates and writes by the `write`
//! weight. Weights come from the resource context and may be overridden per
//! request through rule results; anything missing or unparsable counts as 1.0.

use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::{ResourceError, ResourceResult};
use crate::hierarchy::HierarchyPath;
use crate::node::ResourceNode;
use crate::object::FileObject;
use crate::operation::OperationType;
use crate::properties::{READ_WEIGHT_KEY, WRITE_WEIGHT_KEY};
use crate::vote::Vote;

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
    let child = node
        .children()
        .first()
        .ok_or_else(|| ResourceError::InvalidResourceTopology {
            resource: node.name().to_string(),
            msg: "passthru has no child".to_string(),
        })?;

    let vote = super::ask(node, child, ctx, operation, object, &hierarchy)?;
    let factor = match operation {
        OperationType::Open => weight(node, ctx, READ_WEIGHT_KEY),
        OperationType::Create | OperationType::Write => weight(node, ctx, WRITE_WEIGHT_KEY),
        OperationType::Unlink => 1.0,
    };

    for replica in object
        .replicas
        .iter_mut()
        .filter(|r| r.hierarchy.contains(node.name()))
    {
        replica.vote *= factor;
    }

    let scaled = vote.scaled(factor);
    debug!(resource = %node.name(), factor, vote = scaled.score, "Passthru weighted vote");
    Ok(scaled)
}

/// Weight for `key`, rule results first, then the resource context.
pub fn weight(node: &ResourceNode, ctx: &RequestContext, key: &str) -> f64 {
    let raw = ctx
        .rule_result(key)
        .or_else(|| node.properties().context_value(key));
    match raw {
        None => 1.0,
        Some(raw) => match raw.trim().parse::<f64>() {
            Ok(w) if w.is_finite() && w >= 0.0 => w,
            _ => {
                warn!(
                    resource = %node.name(),
                    key,
                    value = raw,
                    "Invalid passthru weight, using 1.0"
                );
                1.0
            }
        },
    }
}
