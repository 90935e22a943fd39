//! Operation names, operation types and the typed request/response pair used by
//! the generic dispatcher.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::driver::{StageRequest, SyncRequest};
use crate::error::{ResourceError, ResourceResult};
use crate::vote::Vote;

/// The kind of access a hierarchy is being resolved for.
///
/// The string forms (`OPEN`, `CREATE`, `WRITE`, `UNLINK`) are matched case-sensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Read access to an existing object.
    #[serde(rename = "OPEN")]
    Open,
    /// A new object.
    #[serde(rename = "CREATE")]
    Create,
    /// Write access to an existing object.
    #[serde(rename = "WRITE")]
    Write,
    /// Removal of an object.
    #[serde(rename = "UNLINK")]
    Unlink,
}

impl OperationType {
    /// Canonical token.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Open => "OPEN",
            OperationType::Create => "CREATE",
            OperationType::Write => "WRITE",
            OperationType::Unlink => "UNLINK",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(OperationType::Open),
            "CREATE" => Ok(OperationType::Create),
            "WRITE" => Ok(OperationType::Write),
            "UNLINK" => Ok(OperationType::Unlink),
            other => Err(ResourceError::bad_input(format!("unknown operation type {other:?}"))),
        }
    }
}

macro_rules! resource_ops {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Every operation a resource answers to, with its stable name.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ResourceOp {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )+
        }

        impl ResourceOp {
            /// All operations in declaration order.
            pub const ALL: &'static [ResourceOp] = &[$(ResourceOp::$variant),+];

            /// Stable operation name.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ResourceOp::$variant => $name,)+
                }
            }
        }

        impl FromStr for ResourceOp {
            type Err = ResourceError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(ResourceOp::$variant),)+
                    other => Err(ResourceError::not_found(format!("resource operation {other:?}"))),
                }
            }
        }
    };
}

resource_ops! {
    Create => "create",
    Open => "open",
    Read => "read",
    Write => "write",
    Close => "close",
    Unlink => "unlink",
    Stat => "stat",
    Lseek => "lseek",
    Mkdir => "mkdir",
    Rmdir => "rmdir",
    Opendir => "opendir",
    Readdir => "readdir",
    Closedir => "closedir",
    Rename => "rename",
    Truncate => "truncate",
    Freespace => "freespace",
    StageToCache => "stagetocache",
    SyncToArch => "synctoarch",
    Registered => "registered",
    Unregistered => "unregistered",
    Modified => "modified",
    Notify => "notify",
    ResolveHierarchy => "resolve_resc_hier",
    Rebalance => "rebalance",
}

impl fmt::Display for ResourceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access mode for [`FileOp::Open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Read only.
    ReadOnly,
    /// Write only.
    WriteOnly,
    /// Read and write.
    ReadWrite,
}

impl AccessMode {
    /// Whether the mode permits writes.
    pub fn writable(&self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }

    /// Whether the mode permits reads.
    pub fn readable(&self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }
}

/// Origin for [`FileOp::Lseek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the file.
    Start,
    /// From the current position.
    Current,
    /// From the end of the file.
    End,
}

/// Result of a `stat` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    /// Size in bytes.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// True for collections.
    pub is_dir: bool,
}

/// A typed request for [`crate::ResourceNode::call`].
#[derive(Debug, Clone)]
pub enum FileOp {
    /// Create the object.
    Create,
    /// Open the object.
    Open(AccessMode),
    /// Read up to `len` bytes.
    Read {
        /// Descriptor to read from.
        fd: u64,
        /// Maximum number of bytes returned.
        len: usize,
    },
    /// Write `data`.
    Write {
        /// Descriptor to write to.
        fd: u64,
        /// Bytes written at the current offset.
        data: Vec<u8>,
    },
    /// Close a descriptor.
    Close {
        /// Descriptor to close.
        fd: u64,
    },
    /// Remove the object.
    Unlink,
    /// Stat the object.
    Stat,
    /// Reposition a descriptor.
    Lseek {
        /// Descriptor to reposition.
        fd: u64,
        /// Signed distance from `whence`.
        offset: i64,
        /// Reference point for `offset`.
        whence: Whence,
    },
    /// Create a collection.
    Mkdir,
    /// Remove a collection.
    Rmdir,
    /// Open a collection for listing.
    Opendir,
    /// Next entry of an open collection.
    Readdir {
        /// Listing handle from `Opendir`.
        handle: u64,
    },
    /// Close an open collection.
    Closedir {
        /// Listing handle from `Opendir`.
        handle: u64,
    },
    /// Move the object to a new physical path.
    Rename {
        /// Destination physical path.
        new_path: String,
    },
    /// Set the object's length.
    Truncate {
        /// New length in bytes.
        len: u64,
    },
    /// Free bytes on the leaf.
    Freespace,
    /// Copy archive bytes into the cache.
    StageToCache(StageRequest),
    /// Copy cache bytes into the archive.
    SyncToArch(SyncRequest),
    /// The object was registered in place.
    Registered,
    /// The object was unregistered.
    Unregistered,
    /// The object's bytes changed.
    Modified,
    /// Advisory operation-type notice.
    Notify(OperationType),
    /// Vote on a hierarchy for the given access.
    ResolveHierarchy(OperationType),
    /// Repair missing and stale replicas below this resource.
    Rebalance,
}

impl FileOp {
    /// The operation this request invokes.
    pub fn op(&self) -> ResourceOp {
        match self {
            FileOp::Create => ResourceOp::Create,
            FileOp::Open(_) => ResourceOp::Open,
            FileOp::Read { .. } => ResourceOp::Read,
            FileOp::Write { .. } => ResourceOp::Write,
            FileOp::Close { .. } => ResourceOp::Close,
            FileOp::Unlink => ResourceOp::Unlink,
            FileOp::Stat => ResourceOp::Stat,
            FileOp::Lseek { .. } => ResourceOp::Lseek,
            FileOp::Mkdir => ResourceOp::Mkdir,
            FileOp::Rmdir => ResourceOp::Rmdir,
            FileOp::Opendir => ResourceOp::Opendir,
            FileOp::Readdir { .. } => ResourceOp::Readdir,
            FileOp::Closedir { .. } => ResourceOp::Closedir,
            FileOp::Rename { .. } => ResourceOp::Rename,
            FileOp::Truncate { .. } => ResourceOp::Truncate,
            FileOp::Freespace => ResourceOp::Freespace,
            FileOp::StageToCache(_) => ResourceOp::StageToCache,
            FileOp::SyncToArch(_) => ResourceOp::SyncToArch,
            FileOp::Registered => ResourceOp::Registered,
            FileOp::Unregistered => ResourceOp::Unregistered,
            FileOp::Modified => ResourceOp::Modified,
            FileOp::Notify(_) => ResourceOp::Notify,
            FileOp::ResolveHierarchy(_) => ResourceOp::ResolveHierarchy,
            FileOp::Rebalance => ResourceOp::Rebalance,
        }
    }

    /// Builds an argument-free request from its operation name.
    ///
    /// Operations that need arguments (descriptors, buffers, requests) return
    /// `SysInvalidInputParam`.
    pub fn from_name(name: &str) -> ResourceResult<Self> {
        let op: ResourceOp = name.parse()?;
        match op {
            ResourceOp::Create => Ok(FileOp::Create),
            ResourceOp::Unlink => Ok(FileOp::Unlink),
            ResourceOp::Stat => Ok(FileOp::Stat),
            ResourceOp::Mkdir => Ok(FileOp::Mkdir),
            ResourceOp::Rmdir => Ok(FileOp::Rmdir),
            ResourceOp::Opendir => Ok(FileOp::Opendir),
            ResourceOp::Freespace => Ok(FileOp::Freespace),
            ResourceOp::Registered => Ok(FileOp::Registered),
            ResourceOp::Unregistered => Ok(FileOp::Unregistered),
            ResourceOp::Modified => Ok(FileOp::Modified),
            ResourceOp::Rebalance => Ok(FileOp::Rebalance),
            other => Err(ResourceError::SysInvalidInputParam {
                msg: format!("operation {other} requires arguments"),
            }),
        }
    }
}

/// Response of [`crate::ResourceNode::call`].
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutput {
    /// No payload.
    Unit,
    /// An open file or collection handle.
    Descriptor(u64),
    /// Bytes read.
    Bytes(Vec<u8>),
    /// Number of bytes written.
    Written(usize),
    /// Stat result.
    Stat(FileStat),
    /// New offset after a seek.
    Offset(u64),
    /// Next collection entry, if any.
    Entry(Option<String>),
    /// Free bytes.
    Space(u64),
    /// Physical path chosen by the archive, if it renamed the destination.
    Renamed(Option<String>),
    /// Resolve result.
    Vote(Vote),
}
