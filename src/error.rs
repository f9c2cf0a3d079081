//! Error types for task execution contexts.
//!
//! Every context operation returns `Result<_, ContextError>`. Errors are
//! always constructed after the context lock guard has been dropped, so an
//! embedder that terminates on a fatal error never does so while holding a
//! context lock.

use crate::types::{
    AddressSpaceId, ContextUid, FieldId, IndexSpace, LogicalRegion, OpId, RegionTreeNode,
    TraceId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// Result kinds of a privilege check other than success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrivilegeError {
    #[error("no parent requirement grants access to field {field:?} of {parent:?}")]
    BadParentRegion { parent: LogicalRegion, field: FieldId },

    #[error("no region path from parent {parent:?} to the requested region")]
    BadRegionPath { parent: LogicalRegion },

    #[error("no partition path from parent {parent:?} to the requested partition")]
    BadPartitionPath { parent: LogicalRegion },

    #[error("insufficient region privileges on field {field:?} of {parent:?}")]
    BadRegionPrivileges { parent: LogicalRegion, field: FieldId },

    #[error("insufficient partition privileges on field {field:?} of {parent:?}")]
    BadPartitionPrivileges { parent: LogicalRegion, field: FieldId },

    #[error("no index path from parent {parent:?} to {handle:?}")]
    BadIndexPath { parent: IndexSpace, handle: IndexSpace },

    #[error("insufficient allocation privileges on index space {parent:?}")]
    BadIndexPrivileges { parent: IndexSpace },

    #[error("no parent index requirement for {parent:?}")]
    BadParentIndex { parent: IndexSpace },
}

/// Transport-level delivery failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Unknown address space: {0}")]
    UnknownAddressSpace(AddressSpaceId),

    #[error("Channel to address space {0} closed")]
    ChannelClosed(AddressSpaceId),

    #[error("Message codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for TransportError {
    fn from(err: bincode::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}

/// Configuration and logging setup errors.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration validation failed:\n{0}")]
    Validation(String),

    #[error("Logging error: {0}")]
    Logging(String),
}

impl From<config::ConfigError> for SetupError {
    fn from(err: config::ConfigError) -> Self {
        SetupError::Config(err.to_string())
    }
}

/// Stable numeric code reported alongside every fatal error. Codes also
/// travel in failure replies between address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    DuplicateChild = 101,
    UnexpectedChildState = 102,
    NotConfigured = 103,
    AlreadyConfigured = 104,
    InvalidConfiguration = 105,
    FrameOrderViolation = 106,
    IllegalForVariant = 107,
    DuplicateCreation = 108,
    DuplicateOwnershipResponse = 109,
    OutstandingChildren = 110,
    ContextNotFound = 111,
    Transport = 112,
    Codec = 113,
    RemoteRequestFailed = 114,
    BadParentRegion = 201,
    BadRegionPath = 202,
    BadPartitionPath = 203,
    BadRegionPrivileges = 204,
    BadPartitionPrivileges = 205,
    BadIndexPath = 206,
    BadIndexPrivileges = 207,
    BadParentIndex = 208,
    UnacquiredRelease = 209,
    UnrestrictedAcquire = 210,
    UnattachedDetach = 211,
    IllegalNestedTrace = 212,
    IncompleteTrace = 213,
    UnmatchedEndTrace = 214,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Broken internal protocol: never recovered.
    Protocol,
    /// Missing privilege or misuse of a resource.
    Privilege,
    /// Infrastructure failure below the context protocol.
    Transient,
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Child {op} registered twice in {context}")]
    DuplicateChild { context: ContextUid, op: OpId },

    #[error("Child {op} of {context} is not {expected}")]
    UnexpectedChildState {
        context: ContextUid,
        op: OpId,
        expected: &'static str,
    },

    #[error("Context {0} has not been configured")]
    NotConfigured(ContextUid),

    #[error("Context {0} was already configured")]
    AlreadyConfigured(ContextUid),

    #[error("Invalid context configuration from mapper '{mapper}' for task '{task}': {reason}")]
    InvalidConfiguration {
        mapper: String,
        task: String,
        reason: String,
    },

    #[error("Frame {op} finished out of order in {context}")]
    FrameOrderViolation { context: ContextUid, op: OpId },

    #[error("Operation '{operation}' is illegal for {variant} context {context}")]
    IllegalForVariant {
        context: ContextUid,
        variant: &'static str,
        operation: &'static str,
    },

    #[error("Resource {resource} created twice in {context}")]
    DuplicateCreation {
        context: ContextUid,
        resource: String,
    },

    #[error("Duplicate version owner response for {node:?} in {context}")]
    DuplicateOwnershipResponse {
        context: ContextUid,
        node: RegionTreeNode,
    },

    #[error("Context {context} torn down with {count} outstanding children")]
    OutstandingChildren { context: ContextUid, count: usize },

    #[error("Privilege violation in {context} for task '{task}': {source}")]
    Privilege {
        context: ContextUid,
        task: String,
        #[source]
        source: PrivilegeError,
    },

    #[error("Release of unacquired region {region:?} in task '{task}'")]
    UnacquiredRelease { task: String, region: LogicalRegion },

    #[error("Acquire of unrestricted region {region:?} in task '{task}'")]
    UnrestrictedAcquire { task: String, region: LogicalRegion },

    #[error("Detach of unattached region {region:?} in task '{task}'")]
    UnattachedDetach { task: String, region: LogicalRegion },

    #[error("Trace {trace:?} begun inside trace {current:?} in task '{task}'")]
    IllegalNestedTrace {
        task: String,
        current: TraceId,
        trace: TraceId,
    },

    #[error("Task '{task}' ended inside trace {trace:?}")]
    IncompleteTrace { task: String, trace: TraceId },

    #[error("End of trace {trace:?} does not match an open trace in task '{task}'")]
    UnmatchedEndTrace { task: String, trace: TraceId },

    #[error("Context not found: {0}")]
    ContextNotFound(ContextUid),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Address space {space} failed a request for {context} with code {code:?}")]
    RemoteRequestFailed {
        context: ContextUid,
        space: AddressSpaceId,
        code: ErrorCode,
    },
}

impl From<bincode::Error> for ContextError {
    fn from(err: bincode::Error) -> Self {
        ContextError::Codec(err.to_string())
    }
}

impl ContextError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ContextError::DuplicateChild { .. } => ErrorCode::DuplicateChild,
            ContextError::UnexpectedChildState { .. } => ErrorCode::UnexpectedChildState,
            ContextError::NotConfigured(_) => ErrorCode::NotConfigured,
            ContextError::AlreadyConfigured(_) => ErrorCode::AlreadyConfigured,
            ContextError::InvalidConfiguration { .. } => ErrorCode::InvalidConfiguration,
            ContextError::FrameOrderViolation { .. } => ErrorCode::FrameOrderViolation,
            ContextError::IllegalForVariant { .. } => ErrorCode::IllegalForVariant,
            ContextError::DuplicateCreation { .. } => ErrorCode::DuplicateCreation,
            ContextError::DuplicateOwnershipResponse { .. } => {
                ErrorCode::DuplicateOwnershipResponse
            }
            ContextError::OutstandingChildren { .. } => ErrorCode::OutstandingChildren,
            ContextError::Privilege { source, .. } => match source {
                PrivilegeError::BadParentRegion { .. } => ErrorCode::BadParentRegion,
                PrivilegeError::BadRegionPath { .. } => ErrorCode::BadRegionPath,
                PrivilegeError::BadPartitionPath { .. } => ErrorCode::BadPartitionPath,
                PrivilegeError::BadRegionPrivileges { .. } => ErrorCode::BadRegionPrivileges,
                PrivilegeError::BadPartitionPrivileges { .. } => {
                    ErrorCode::BadPartitionPrivileges
                }
                PrivilegeError::BadIndexPath { .. } => ErrorCode::BadIndexPath,
                PrivilegeError::BadIndexPrivileges { .. } => ErrorCode::BadIndexPrivileges,
                PrivilegeError::BadParentIndex { .. } => ErrorCode::BadParentIndex,
            },
            ContextError::UnacquiredRelease { .. } => ErrorCode::UnacquiredRelease,
            ContextError::UnrestrictedAcquire { .. } => ErrorCode::UnrestrictedAcquire,
            ContextError::UnattachedDetach { .. } => ErrorCode::UnattachedDetach,
            ContextError::IllegalNestedTrace { .. } => ErrorCode::IllegalNestedTrace,
            ContextError::IncompleteTrace { .. } => ErrorCode::IncompleteTrace,
            ContextError::UnmatchedEndTrace { .. } => ErrorCode::UnmatchedEndTrace,
            ContextError::ContextNotFound(_) => ErrorCode::ContextNotFound,
            ContextError::Transport(_) => ErrorCode::Transport,
            ContextError::Codec(_) => ErrorCode::Codec,
            ContextError::RemoteRequestFailed { .. } => ErrorCode::RemoteRequestFailed,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.code().as_i32() {
            200..=299 => ErrorClass::Privilege,
            _ if matches!(
                self,
                ContextError::ContextNotFound(_)
                    | ContextError::Transport(_)
                    | ContextError::Codec(_)
                    | ContextError::RemoteRequestFailed { .. }
            ) =>
            {
                ErrorClass::Transient
            }
            _ => ErrorClass::Protocol,
        }
    }

    /// Protocol and privilege violations terminate the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.class(), ErrorClass::Transient)
    }
}

/// Log a fatal error and terminate the process with its code.
pub fn abort_on_fatal(err: &ContextError) -> ! {
    error!(code = err.code().as_i32(), class = ?err.class(), "{}", err);
    std::process::exit(err.code().as_i32())
}
