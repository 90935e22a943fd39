//! Error types for resource composition.

use thiserror::Error;

use crate::operation::ResourceOp;
use crate::replicate::ReplicationDirection;

/// Coarse classification of a [`ResourceError`], stable across context wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input or configuration.
    BadInput,
    /// A name was not found where one was required.
    NotFound,
    /// The next resource in a hierarchy is not a child of the current one.
    ChildNotFound,
    /// The resource graph violates a structural rule.
    InvalidResourceTopology,
    /// The operation is not permitted in this state or on this resource.
    InvalidOperation,
    /// An archive was reached through a compound resource outside replication.
    DirectArchiveAccess,
    /// No child is able to service the request.
    NoValidTarget,
    /// A stage, sync or replica copy failed.
    ReplicationFailure,
    /// A required input parameter was missing or malformed.
    SysInvalidInputParam,
    /// A storage driver reported an error.
    Driver,
    /// The catalog reported an error.
    Catalog,
}

/// Errors raised while resolving, routing or replicating through a resource tree.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Malformed input or configuration.
    #[error("bad input: {msg}")]
    BadInput {
        /// What was wrong with the input.
        msg: String,
    },

    /// A name was not found.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing item.
        what: String,
    },

    /// The hierarchy names a child that the resource does not have.
    #[error("resource {resource} has no child named {child}")]
    ChildNotFound {
        /// Resource doing the lookup.
        resource: String,
        /// Name that was looked up.
        child: String,
    },

    /// Structural violation in the resource graph.
    #[error("invalid resource topology at {resource}: {msg}")]
    InvalidResourceTopology {
        /// Offending resource.
        resource: String,
        /// Description of the violation.
        msg: String,
    },

    /// Operation refused.
    #[error("invalid operation {operation} on {resource}: {msg}")]
    InvalidOperation {
        /// Resource refusing the operation.
        resource: String,
        /// Operation name.
        operation: String,
        /// Reason for the refusal.
        msg: String,
    },

    /// Archive child of a compound resource opened directly.
    #[error("direct access to archive {archive} through compound {resource} is not allowed")]
    DirectArchiveAccess {
        /// Compound resource.
        resource: String,
        /// Archive child that was addressed.
        archive: String,
    },

    /// Every candidate voted zero.
    #[error("no valid target for {operation} below {resource}")]
    NoValidTarget {
        /// Resource that ran the vote.
        resource: String,
        /// Operation being resolved.
        operation: String,
    },

    /// Data movement between replicas failed.
    #[error("{direction} failed for {path}: {reason}")]
    ReplicationFailure {
        /// Logical path of the object.
        path: String,
        /// Direction of the copy.
        direction: ReplicationDirection,
        /// Underlying failure.
        reason: String,
    },

    /// Required parameter missing.
    #[error("invalid input parameter: {msg}")]
    SysInvalidInputParam {
        /// Description of the parameter problem.
        msg: String,
    },

    /// Storage driver failure.
    #[error("storage driver error on {path}: {msg}")]
    Driver {
        /// Physical path involved.
        path: String,
        /// Driver message.
        msg: String,
    },

    /// Catalog failure.
    #[error("catalog error: {msg}")]
    Catalog {
        /// Catalog message.
        msg: String,
    },

    /// A child error annotated with the operation and the resource that observed it.
    #[error("{operation} failed in {resource}: {source}")]
    Context {
        /// Operation being executed.
        operation: ResourceOp,
        /// Resource that observed the failure.
        resource: String,
        /// Underlying error.
        #[source]
        source: Box<ResourceError>,
    },
}

impl ResourceError {
    /// Shorthand for [`ResourceError::BadInput`].
    pub fn bad_input(msg: impl Into<String>) -> Self {
        ResourceError::BadInput { msg: msg.into() }
    }

    /// Shorthand for [`ResourceError::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        ResourceError::NotFound { what: what.into() }
    }

    /// Classification of this error, looking through any context wrapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResourceError::BadInput { .. } => ErrorKind::BadInput,
            ResourceError::NotFound { .. } => ErrorKind::NotFound,
            ResourceError::ChildNotFound { .. } => ErrorKind::ChildNotFound,
            ResourceError::InvalidResourceTopology { .. } => ErrorKind::InvalidResourceTopology,
            ResourceError::InvalidOperation { .. } => ErrorKind::InvalidOperation,
            ResourceError::DirectArchiveAccess { .. } => ErrorKind::DirectArchiveAccess,
            ResourceError::NoValidTarget { .. } => ErrorKind::NoValidTarget,
            ResourceError::ReplicationFailure { .. } => ErrorKind::ReplicationFailure,
            ResourceError::SysInvalidInputParam { .. } => ErrorKind::SysInvalidInputParam,
            ResourceError::Driver { .. } => ErrorKind::Driver,
            ResourceError::Catalog { .. } => ErrorKind::Catalog,
            ResourceError::Context { source, .. } => source.kind(),
        }
    }

    /// The innermost error, with all context layers removed.
    pub fn root_cause(&self) -> &ResourceError {
        match self {
            ResourceError::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Wraps this error with the operation and resource that observed it.
    pub fn in_resource(self, operation: ResourceOp, resource: &str) -> Self {
        ResourceError::Context {
            operation,
            resource: resource.to_string(),
            source: Box::new(self),
        }
    }
}

/// Adds resource context to a failing result.
pub trait ResultExt<T> {
    /// Wraps the error, if any, with `operation` and `resource`.
    fn in_resource(self, operation: ResourceOp, resource: &str) -> ResourceResult<T>;
}

impl<T> ResultExt<T> for ResourceResult<T> {
    fn in_resource(self, operation: ResourceOp, resource: &str) -> ResourceResult<T> {
        self.map_err(|e| e.in_resource(operation, resource))
    }
}

/// Result alias for resource operations.
pub type ResourceResult<T> = std::result::Result<T, ResourceError>;
