//! Error types for the lock table.

use thiserror::Error;

use crate::backend::LockRecord;

/// Result type alias for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur while taking or releasing locks.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("key {:?} is already locked: {}", .existing.key, .existing.comment)]
    Conflict { existing: LockRecord },

    #[error("failed to open lock database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("lock store task failed: {0}")]
    Task(String),

    #[error("lock table request failed: {0}")]
    Remote(String),
}
