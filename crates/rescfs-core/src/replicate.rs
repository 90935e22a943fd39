//! Data movement between replicas.
//!
//! [`replicate`] opens the source replica read-only, creates the destination,
//! moves the bytes and closes both descriptors, destination first. Stage and sync
//! hand the copy to the archive leaf's driver; a plain copy streams the bytes
//! through the resource tree. There is no retry; the first failure is returned
//! with the logical path and direction attached.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::driver::{StageRequest, StorageDriver, SyncRequest};
use crate::error::{ResourceError, ResourceResult};
use crate::hierarchy::HierarchyPath;
use crate::node::ResourceNode;
use crate::object::{FileObject, IN_REPL_KW, STAGE_OBJ_KW, SYNC_OBJ_KW};
use crate::operation::AccessMode;
use crate::properties::CREATE_PATH_KEY;

const COPY_CHUNK: usize = 64 * 1024;

/// Which way bytes move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationDirection {
    /// Archive to cache.
    Stage,
    /// Cache to archive.
    Sync,
    /// Between replication siblings.
    Copy,
}

impl ReplicationDirection {
    /// Keyword marking objects moved in this direction.
    pub fn keyword(&self) -> &'static str {
        match self {
            ReplicationDirection::Stage => STAGE_OBJ_KW,
            ReplicationDirection::Sync => SYNC_OBJ_KW,
            ReplicationDirection::Copy => IN_REPL_KW,
        }
    }
}

impl fmt::Display for ReplicationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicationDirection::Stage => "stage",
            ReplicationDirection::Sync => "sync",
            ReplicationDirection::Copy => "replica copy",
        };
        f.write_str(s)
    }
}

/// An open replica descriptor, closed on drop if not closed explicitly.
struct OpenReplica<'a> {
    leaf: &'a ResourceNode,
    driver: Arc<dyn StorageDriver>,
    object: FileObject,
    fd: u64,
    open: bool,
}

impl<'a> OpenReplica<'a> {
    fn open(
        origin: &'a ResourceNode,
        mut object: FileObject,
        create: bool,
    ) -> ResourceResult<Self> {
        let leaf = origin.leaf_for(&object.hierarchy)?;
        let driver = Arc::clone(leaf.driver()?);
        let fd = if create {
            origin.create(&mut object)?
        } else {
            origin.open(&mut object, AccessMode::ReadOnly)?
        };
        Ok(Self {
            leaf,
            driver,
            object,
            fd,
            open: true,
        })
    }

    fn server_chooses_path(&self) -> bool {
        self.leaf.properties().context_value(CREATE_PATH_KEY) == Some("server")
    }

    fn close(mut self) -> ResourceResult<()> {
        self.open = false;
        self.driver.close(self.fd)
    }
}

impl Drop for OpenReplica<'_> {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            if let Err(e) = self.driver.close(self.fd) {
                warn!(
                    path = %self.object.physical_path,
                    fd = self.fd,
                    error = %e,
                    "Failed to close replica"
                );
            }
        }
    }
}

fn failure(path: &str, direction: ReplicationDirection, reason: String) -> ResourceError {
    ResourceError::ReplicationFailure {
        path: path.to_string(),
        direction,
        reason,
    }
}

/// Copies `object` from `source` to `destination`, dispatching opens from `origin`.
///
/// Both hierarchies must pass through `origin`. On success the destination is
/// registered as a good replica on `object`.
pub fn replicate(
    origin: &ResourceNode,
    object: &mut FileObject,
    direction: ReplicationDirection,
    source: &HierarchyPath,
    destination: &HierarchyPath,
) -> ResourceResult<()> {
    let path = object.logical_path.clone();
    info!(object = %path, %direction, from = %source, to = %destination, "Replicating");

    let mut source_object = object.bound_to(source);
    source_object.replica_request = None;
    source_object.set_keyword(direction.keyword(), "1");
    let mut src = OpenReplica::open(origin, source_object, false)
        .map_err(|e| failure(&path, direction, format!("source open failed: {e}")))?;

    let stat = src
        .driver
        .stat(&src.object.physical_path)
        .map_err(|e| failure(&path, direction, format!("source stat failed: {e}")))?;

    let mut dest_object = object.bound_to(destination);
    dest_object.replica_request = None;
    dest_object.mode = stat.mode;
    dest_object.set_keyword(direction.keyword(), "1");
    let mut dst = OpenReplica::open(origin, dest_object, true)
        .map_err(|e| failure(&path, direction, format!("destination open failed: {e}")))?;
    debug!(
        source_fd = src.fd,
        destination_fd = dst.fd,
        size = stat.size,
        "Replica descriptors open"
    );

    let transfer = match direction {
        ReplicationDirection::Stage => {
            let request = StageRequest {
                cache_path: dst.object.physical_path.clone(),
                hierarchy: destination.clone(),
                source_path: src.object.physical_path.clone(),
                object_path: path.clone(),
                size: stat.size,
                mode: stat.mode,
            };
            origin.stage_to_cache(&mut src.object, &request)
        }
        ReplicationDirection::Sync => {
            let request = SyncRequest {
                dest_path: dst.object.physical_path.clone(),
                hierarchy: destination.clone(),
                object_path: path.clone(),
                cache_path: src.object.physical_path.clone(),
                size: stat.size,
                mode: stat.mode,
            };
            origin
                .sync_to_arch(&mut dst.object, &request)
                .map(|renamed| match renamed {
                    Some(renamed) if dst.server_chooses_path() => {
                        debug!(
                            from = %dst.object.physical_path,
                            to = %renamed,
                            "Archive chose a new path"
                        );
                        dst.object.physical_path = renamed;
                    }
                    Some(renamed) => {
                        warn!(
                            path = %renamed,
                            "Ignoring archive rename on a resource without server paths"
                        );
                    }
                    None => {}
                })
        }
        ReplicationDirection::Copy => copy_bytes(origin, &mut src, &mut dst),
    };

    let dest_path = dst.object.physical_path.clone();
    let dest_closed = dst.close();
    let source_closed = src.close();

    transfer.map_err(|e| failure(&path, direction, format!("transfer failed: {e}")))?;
    dest_closed
        .and(source_closed)
        .map_err(|e| failure(&path, direction, format!("close failed: {e}")))?;

    let number = object.register_replica(destination, &dest_path, stat.size);
    info!(
        object = %path,
        %direction,
        replica = number,
        hierarchy = %destination,
        "Replica registered"
    );
    Ok(())
}

fn copy_bytes(
    origin: &ResourceNode,
    src: &mut OpenReplica<'_>,
    dst: &mut OpenReplica<'_>,
) -> ResourceResult<()> {
    loop {
        let chunk = origin.read(&mut src.object, src.fd, COPY_CHUNK)?;
        if chunk.is_empty() {
            return Ok(());
        }
        origin.write(&mut dst.object, dst.fd, &chunk)?;
    }
}
