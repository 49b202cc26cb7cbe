//! # Engine Error Types
//!
//! One error enum per external seam plus the umbrella [`SyncError`] that
//! session operations return.

use shared::{Table, Topic};
use thiserror::Error;

/// Result type alias for engine operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Failures of the live change-feed collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The feed could not be opened.
    #[error("Failed to open feed for {topic}: {reason}")]
    OpenFailed { topic: String, reason: String },

    /// An established feed dropped.
    #[error("Feed disconnected: {reason}")]
    Disconnected { reason: String },
}

impl FeedError {
    /// Create a new open failure
    pub fn open_failed<T: Into<String>>(topic: &Topic, reason: T) -> Self {
        Self::OpenFailed {
            topic: topic.key(),
            reason: reason.into(),
        }
    }

    /// Create a new disconnect error
    pub fn disconnected<T: Into<String>>(reason: T) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }
}

/// Failures of the query/mutate collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The backend refused or failed the operation.
    #[error("{operation} on {table} failed: {message}")]
    OperationFailed {
        operation: &'static str,
        table: Table,
        message: String,
    },

    /// A remote procedure call failed.
    #[error("RPC {name} failed: {message}")]
    RpcFailed { name: String, message: String },

    /// A returned row did not match the expected shape.
    #[error("Unexpected row from {table}: {message}")]
    Decode { table: Table, message: String },
}

impl PlatformError {
    /// Create a new operation failure
    pub fn failed<T: Into<String>>(operation: &'static str, table: Table, message: T) -> Self {
        Self::OperationFailed {
            operation,
            table,
            message: message.into(),
        }
    }

    /// Create a new RPC failure
    pub fn rpc<N: Into<String>, T: Into<String>>(name: N, message: T) -> Self {
        Self::RpcFailed {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Wrap a row decoding failure
    pub fn decode(table: Table, error: &serde_json::Error) -> Self {
        Self::Decode {
            table,
            message: error.to_string(),
        }
    }
}

/// Failures of the object storage collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No blob exists at the path.
    #[error("Object not found: {bucket}/{path}")]
    NotFound { bucket: String, path: String },

    /// The storage backend failed the request.
    #[error("Storage {operation} failed for {bucket}: {message}")]
    Failed {
        operation: &'static str,
        bucket: String,
        message: String,
    },
}

/// Reasons a raw change notification is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// The event verb is not insert, update or delete.
    #[error("Unknown change verb '{verb}'")]
    UnknownVerb { verb: String },

    /// The payload names a table the requested entity type does not live in.
    #[error("Table '{table}' does not hold {expected} rows")]
    TableMismatch { table: String, expected: &'static str },

    /// The row could not be decoded.
    #[error("Malformed {entity} payload: {message}")]
    MalformedPayload {
        entity: &'static str,
        message: String,
    },

    /// A delete carried no usable identifier.
    #[error("Delete payload for {entity} carries no id")]
    MissingId { entity: &'static str },
}

/// Comprehensive error type for session operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Live feed failure
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// Query or mutation failure
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// Object storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Rejected change notification
    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    /// Input validation error
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Operation on a session that was already closed
    #[error("Session for {topic} is closed")]
    SessionClosed { topic: String },
}

impl SyncError {
    /// Create a new invalid input error
    pub fn invalid_input<T: Into<String>>(message: T) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a new closed session error
    #[must_use]
    pub fn session_closed(topic: &Topic) -> Self {
        Self::SessionClosed { topic: topic.key() }
    }
}
