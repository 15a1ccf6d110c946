//! Error taxonomy for partition storage and replication.
//!
//! Construction errors (`StorageInit`, `CorruptState`) abort partition
//! creation or reopen. `SchemaMismatch` rejects one record only.
//! `CommitIo` leaves the head snapshot untouched. Replication errors are
//! always scoped to a single replica.

use crate::replication::ReplicaId;
use thiserror::Error;

/// Errors surfaced by the partition core
#[derive(Debug, Error)]
pub enum PartitionError {
    /// Storage path unusable, or a partition with this identity already exists
    #[error("storage init failed at {path}: {reason}")]
    StorageInit { path: String, reason: String },

    /// Persisted metadata unreadable or inconsistent with the data files
    #[error("corrupt partition state at {path}: {reason}")]
    CorruptState { path: String, reason: String },

    /// Storage could not be opened for writing; safe to retry later
    #[error("writer unavailable: {0}")]
    WriterUnavailable(String),

    /// Record incompatible with the current table schema
    #[error("schema mismatch (schema v{schema_version}): {reason}")]
    SchemaMismatch { schema_version: u32, reason: String },

    /// Durable flush failed; head snapshot unchanged
    #[error("commit failed: {0}")]
    CommitIo(String),

    /// Transient failure while reading committed data
    #[error("read failed: {0}")]
    ReadIo(String),

    /// Transport-level failure talking to one replica
    #[error("replication to replica {replica} failed: {reason}")]
    ReplicationTransport { replica: ReplicaId, reason: String },

    /// Replica answered but refused the delta
    #[error("replica {replica} rejected delta: {reason}")]
    ReplicationRejected { replica: ReplicaId, reason: String },

    /// Replication scheme cannot be satisfied for this partition
    #[error("invalid replication scheme {scheme}: {reason}")]
    InvalidReplicationScheme { scheme: String, reason: String },

    /// Configuration could not be loaded or parsed
    #[error("configuration error: {0}")]
    Config(String),
}

impl PartitionError {
    pub(crate) fn storage_init(path: impl Into<String>, reason: impl ToString) -> Self {
        PartitionError::StorageInit {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<String>, reason: impl ToString) -> Self {
        PartitionError::CorruptState {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the same call may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PartitionError::WriterUnavailable(_)
                | PartitionError::CommitIo(_)
                | PartitionError::ReadIo(_)
                | PartitionError::ReplicationTransport { .. }
        )
    }

    /// The replica this error is scoped to, for replication errors
    pub fn replica(&self) -> Option<ReplicaId> {
        match self {
            PartitionError::ReplicationTransport { replica, .. }
            | PartitionError::ReplicationRejected { replica, .. } => Some(*replica),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PartitionError>;
