#![warn(missing_docs)]

//! RescFS core: composable storage resource trees.
//!
//! Resources form a tree of coordinating nodes (compound, replication, deferred,
//! load-balanced, passthru) above storage leaves. A request first resolves a
//! hierarchy by letting every node vote, then sends data operations down that
//! hierarchy. Compound resources stage and sync between cache and archive;
//! replication resources copy to every sibling and can be rebalanced.

pub mod catalog;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod hierarchy;
pub mod kvp;
pub mod manager;
pub mod negotiation;
pub mod node;
pub mod object;
pub mod operation;
pub mod plugins;
pub mod properties;
pub mod rebalance;
pub mod replicate;
pub mod telemetry;
pub mod vote;

pub use catalog::{Catalog, LoadEntry, MockCatalog, RebalanceRow};
pub use config::{ChildConfig, ResourceConfig, TreeConfig};
pub use context::{ReplicationPlan, RequestContext};
pub use driver::{MemoryDriver, MemoryVolume, StageRequest, StorageDriver, SyncRequest};
pub use error::{ErrorKind, ResourceError, ResourceResult};
pub use hierarchy::HierarchyPath;
pub use kvp::{KvpMap, KvpTokens};
pub use manager::ResourceManager;
pub use node::{ChildLink, ResourceKind, ResourceNode};
pub use object::{FileObject, PhysicalReplica, ReplicaStatus};
pub use operation::{AccessMode, FileOp, OpOutput, OperationType, ResourceOp};
pub use properties::{ChildContext, ResourceProperties, ResourceStatus, ResourceType};
pub use replicate::ReplicationDirection;
pub use telemetry::{init_tracing, LogConfig};
pub use vote::Vote;
