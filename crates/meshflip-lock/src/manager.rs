//! Lock manager: acquire and release deployment locks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::backend::{LockBackend, LockRecord};
use crate::error::{LockError, LockResult};

/// Takes and releases per-key locks on a [`LockBackend`].
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    /// Take the lock for `key`, stamping the record with the current time.
    ///
    /// Fails with [`LockError::Conflict`] carrying the existing record if
    /// the key is already held.
    pub async fn acquire(&self, key: &str) -> LockResult<LockRecord> {
        self.acquire_at(key, Utc::now()).await
    }

    pub async fn acquire_at(&self, key: &str, now: DateTime<Utc>) -> LockResult<LockRecord> {
        let record = LockRecord {
            key: key.to_string(),
            comment: format!("Began creating at {}", now.to_rfc3339()),
        };

        info!(%key, "attempting to lock");
        match self.backend.insert_if_absent(&record).await? {
            None => {
                info!(%key, comment = %record.comment, "locked");
                Ok(record)
            }
            Some(existing) => {
                warn!(%key, comment = %existing.comment, "key is already locked");
                Err(LockError::Conflict { existing })
            }
        }
    }

    /// Drop the lock for `key`. Returns false if it was not held.
    pub async fn release(&self, key: &str) -> LockResult<bool> {
        info!(%key, "attempting to unlock");
        let existed = self.backend.delete(key).await?;
        if existed {
            info!(%key, "unlocked");
        } else {
            warn!(%key, "unlock requested but no lock was held");
        }
        Ok(existed)
    }

    /// Current holder of `key`, if any.
    pub async fn inspect(&self, key: &str) -> LockResult<Option<LockRecord>> {
        self.backend.get(key).await
    }

    pub async fn list(&self) -> LockResult<Vec<LockRecord>> {
        self.backend.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RedbLockStore;
    use chrono::TimeZone;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(RedbLockStore::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn acquire_writes_timestamped_comment() {
        let locks = manager();
        let now = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();

        let record = locks.acquire_at("echo:prod", now).await.unwrap();
        assert_eq!(record.key, "echo:prod");
        assert_eq!(record.comment, "Began creating at 2023-01-01T00:00:00+00:00");
        assert_eq!(locks.inspect("echo:prod").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn second_acquire_conflicts_with_first_record() {
        let locks = manager();
        let first = locks.acquire("echo:prod").await.unwrap();

        match locks.acquire("echo:prod").await {
            Err(LockError::Conflict { existing }) => assert_eq!(existing, first),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_frees_the_key() {
        let locks = manager();
        locks.acquire("echo:prod").await.unwrap();

        assert!(locks.release("echo:prod").await.unwrap());
        assert!(locks.inspect("echo:prod").await.unwrap().is_none());
        locks.acquire("echo:prod").await.unwrap();
    }

    #[tokio::test]
    async fn release_without_lock_is_noop() {
        let locks = manager();
        assert!(!locks.release("echo:prod").await.unwrap());
    }
}
