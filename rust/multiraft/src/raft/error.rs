//! Error types for the raft engine.

use thiserror::Error;

use crate::proto::GroupId;

/// Raft-specific errors.
#[derive(Debug, Error)]
pub enum RaftError {
    /// Configuration rejected at construction.
    #[error("config error: {0}")]
    Config(String),

    /// Log storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The requested entries were discarded by log compaction.
    #[error("requested index is unavailable due to compaction")]
    Compacted,

    /// Transport could not be started.
    #[error("transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The group (or the whole node) has been stopped.
    #[error("raft group stopped")]
    Stopped,

    #[error("raft group {0} already exists")]
    GroupExists(GroupId),

    #[error("raft group {0} not found")]
    GroupNotFound(GroupId),

    /// The proposal would not fit in a single append message.
    #[error("proposal of {size} bytes exceeds the {limit} byte message limit")]
    ProposalTooLarge { size: usize, limit: u64 },

    /// A log invariant would have been violated.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Error returned by the application state machine.
    #[error("state machine error: {0}")]
    StateMachine(String),
}

impl From<crate::storage::StorageError> for RaftError {
    fn from(e: crate::storage::StorageError) -> Self {
        match e {
            crate::storage::StorageError::Compacted => RaftError::Compacted,
            other => RaftError::Storage(other.to_string()),
        }
    }
}

impl From<crate::transport::TransportError> for RaftError {
    fn from(e: crate::transport::TransportError) -> Self {
        RaftError::Transport(e.to_string())
    }
}

impl From<bincode::Error> for RaftError {
    fn from(e: bincode::Error) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

/// Result type for raft operations.
pub type Result<T> = std::result::Result<T, RaftError>;
