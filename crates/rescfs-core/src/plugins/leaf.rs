//! Storage leaf voting and physical path layout.

use crate::context::RequestContext;
use crate::error::ResourceResult;
use crate::hierarchy::HierarchyPath;
use crate::node::ResourceNode;
use crate::object::{FileObject, ReplicaStatus};
use crate::operation::OperationType;
use crate::vote::Vote;

/// Vote of a leaf on the host serving the request.
pub const LOCAL_VOTE: f64 = 1.0;
/// Vote of a leaf on another host.
pub const REMOTE_VOTE: f64 = 0.5;

/// Votes for `leaf`.
///
/// Creates are accepted whenever the leaf is up. Opens need a good replica on
/// this leaf; writes and unlinks need any replica.
pub(crate) fn resolve(
    leaf: &ResourceNode,
    ctx: &mut RequestContext,
    operation: OperationType,
    object: &mut FileObject,
    path: &HierarchyPath,
) -> ResourceResult<Vote> {
    let hierarchy = path.with_child(leaf.name())?;
    if leaf.is_down() {
        return Ok(Vote::zero(hierarchy));
    }

    let base = if leaf.properties().host == ctx.local_host() {
        LOCAL_VOTE
    } else {
        REMOTE_VOTE
    };
    let score = match operation {
        OperationType::Create => base,
        OperationType::Open => match object.replica_on_leaf(leaf.name()) {
            Some(replica) if replica.status == ReplicaStatus::Good => base,
            _ => 0.0,
        },
        OperationType::Write | OperationType::Unlink => {
            if object.replica_on_leaf(leaf.name()).is_some() {
                base
            } else {
                0.0
            }
        }
    };

    if score > 0.0 && operation != OperationType::Create {
        if let Some(replica) = object.replica_on_leaf_mut(leaf.name()) {
            replica.vote = score;
        }
    }
    Ok(Vote::new(score, hierarchy))
}

/// Physical path of `object` on `leaf`: the bound path if already set, else the
/// path of a replica at the object's hierarchy, else the vault joined with the
/// logical path.
pub(crate) fn physical_path(leaf: &ResourceNode, object: &FileObject) -> String {
    if !object.physical_path.is_empty() {
        return object.physical_path.clone();
    }
    if let Some(replica) = object.replica_at(&object.hierarchy) {
        return replica.physical_path.clone();
    }
    vault_path(&leaf.properties().vault_path, &object.logical_path)
}

/// Joins a vault directory and a logical path.
pub fn vault_path(vault: &str, logical: &str) -> String {
    if vault.is_empty() {
        return logical.to_string();
    }
    format!(
        "{}/{}",
        vault.trim_end_matches('/'),
        logical.trim_start_matches('/')
    )
}
