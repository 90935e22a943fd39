//! Rebalance walker.
//!
//! Walks a subtree depth-first. Every replication resource found on the way asks
//! the catalog, one page at a time, for objects that are missing from or stale on
//! each of its children and repairs them with replica copies. The first failing
//! query or copy aborts the walk.

use tracing::{debug, info, warn};

use crate::catalog::RebalanceRow;
use crate::context::{RequestContext, REPL_LIMIT_KEY};
use crate::error::{ResourceError, ResourceResult, ResultExt};
use crate::hierarchy::HierarchyPath;
use crate::node::{ChildLink, ResourceKind, ResourceNode};
use crate::object::{FileObject, PhysicalReplica};
use crate::operation::{OperationType, ResourceOp};
use crate::replicate::{replicate, ReplicationDirection};

/// Page size used when the request carries no `repl_limit`.
pub const DEFAULT_REBALANCE_LIMIT: usize = 500;

/// Outcome counters for one replication resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Replicas created on children that lacked one.
    pub created: u64,
    /// Stale replicas overwritten.
    pub refreshed: u64,
}

pub(crate) fn rebalance(node: &ResourceNode, ctx: &mut RequestContext) -> ResourceResult<()> {
    for child in node.children() {
        child
            .node()
            .rebalance(ctx)
            .in_resource(ResourceOp::Rebalance, node.name())?;
    }
    if !matches!(node.kind(), ResourceKind::Replication) {
        return Ok(());
    }
    let report = rebalance_replication(node, ctx).in_resource(ResourceOp::Rebalance, node.name())?;
    info!(
        resource = %node.name(),
        created = report.created,
        refreshed = report.refreshed,
        "Rebalance finished"
    );
    Ok(())
}

/// Page size for this request.
pub fn batch_limit(ctx: &RequestContext) -> usize {
    match ctx.rule_result_parsed::<usize>(REPL_LIMIT_KEY) {
        Ok(Some(limit)) if limit > 0 => limit,
        Ok(_) => DEFAULT_REBALANCE_LIMIT,
        Err(e) => {
            warn!(
                error = %e,
                default = DEFAULT_REBALANCE_LIMIT,
                "Ignoring invalid rebalance limit"
            );
            DEFAULT_REBALANCE_LIMIT
        }
    }
}

fn rebalance_replication(
    node: &ResourceNode,
    ctx: &mut RequestContext,
) -> ResourceResult<RebalanceReport> {
    let mut report = RebalanceReport::default();
    let objects = ctx.catalog().get_distinct_object_count(node.name())?;
    if objects == 0 {
        debug!(resource = %node.name(), "No objects to rebalance");
        return Ok(report);
    }
    let limit = batch_limit(ctx);
    debug!(resource = %node.name(), objects, limit, "Rebalancing replication resource");

    for child in node.children() {
        loop {
            let batch = ctx
                .catalog()
                .gather_rebalance_batch(node.name(), child.name(), limit)?;
            if batch.is_empty() {
                break;
            }
            info!(
                resource = %node.name(),
                child = %child.name(),
                rows = batch.len(),
                "Creating missing replicas"
            );
            for row in &batch {
                create_missing(node, ctx, child, row)?;
                report.created += 1;
            }
        }

        loop {
            let batch = ctx
                .catalog()
                .gather_stale_batch(node.name(), child.name(), limit)?;
            if batch.is_empty() {
                break;
            }
            info!(
                resource = %node.name(),
                child = %child.name(),
                rows = batch.len(),
                "Refreshing stale replicas"
            );
            for row in &batch {
                refresh_stale(node, row)?;
                report.refreshed += 1;
            }
        }
    }
    Ok(report)
}

fn object_for(row: &RebalanceRow) -> FileObject {
    let mut replica = PhysicalReplica::good(
        0,
        row.source_hierarchy.clone(),
        row.source_path.clone(),
    );
    replica.size = row.size;
    let mut object = FileObject::new(row.logical_path.clone()).with_replica(replica);
    object.size = row.size;
    object.mode = row.mode;
    object
}

fn create_missing(
    node: &ResourceNode,
    ctx: &mut RequestContext,
    child: &ChildLink,
    row: &RebalanceRow,
) -> ResourceResult<()> {
    let mut object = object_for(row);
    let prefix = row.source_hierarchy.prefix_through(node.name())?;
    let mut candidate = object.clone();
    let vote = child
        .node()
        .resolve_hierarchy(ctx, OperationType::Create, &mut candidate, &prefix)?;
    if !vote.is_positive() {
        return Err(ResourceError::NoValidTarget {
            resource: child.name().to_string(),
            operation: OperationType::Create.to_string(),
        });
    }
    debug!(
        data_id = row.data_id,
        path = %row.logical_path,
        to = %vote.hierarchy,
        "Creating replica"
    );
    replicate(
        node,
        &mut object,
        ReplicationDirection::Copy,
        &row.source_hierarchy,
        &vote.hierarchy,
    )
}

fn refresh_stale(node: &ResourceNode, row: &RebalanceRow) -> ResourceResult<()> {
    let target: &HierarchyPath = row.stale_hierarchy.as_ref().ok_or_else(|| {
        ResourceError::SysInvalidInputParam {
            msg: format!("stale row for {} has no target hierarchy", row.logical_path),
        }
    })?;
    let mut object = object_for(row);
    debug!(data_id = row.data_id, path = %row.logical_path, to = %target, "Refreshing replica");
    replicate(node, &mut object, ReplicationDirection::Copy, &row.source_hierarchy, target)
}
