//! Lock backend abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LockResult;

/// A held lock. The comment records who took it and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub comment: String,
}

/// Single-item store holding at most one record per key.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Read the record for `key`, if any.
    async fn get(&self, key: &str) -> LockResult<Option<LockRecord>>;

    /// Write `record` unless its key already has a record.
    ///
    /// Returns `None` when the record was written, or the existing record
    /// when the key was taken. The check and the write must be atomic.
    async fn insert_if_absent(&self, record: &LockRecord) -> LockResult<Option<LockRecord>>;

    /// Remove the record for `key`. Returns true if one existed.
    async fn delete(&self, key: &str) -> LockResult<bool>;

    /// All held locks.
    async fn list(&self) -> LockResult<Vec<LockRecord>>;
}
