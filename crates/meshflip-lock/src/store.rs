//! RedbLockStore: redb-backed lock table.
//!
//! Records are JSON-serialized into redb's `&[u8]` value column. redb
//! serializes write transactions, so reading the key and inserting the
//! record inside one write transaction is an atomic compare-and-insert.
//!
//! redb does blocking file I/O; the [`LockBackend`] methods run each
//! transaction on tokio's blocking pool.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::backend::{LockBackend, LockRecord};
use crate::error::{LockError, LockResult};
use crate::tables::LOCKS;

/// Convert any `Display` error into a `LockError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| LockError::$variant(e.to_string())
    };
}

/// Thread-safe lock table backed by redb.
#[derive(Clone)]
pub struct RedbLockStore {
    db: Arc<Database>,
}

impl RedbLockStore {
    /// Open (or create) a persistent lock table at the given path.
    pub fn open(path: &Path) -> LockResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "lock store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory lock table (for testing and rehearsals).
    pub fn open_in_memory() -> LockResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory lock store opened");
        Ok(store)
    }

    /// Run a synchronous store operation off the async worker threads.
    async fn blocking<T, F>(&self, op: F) -> LockResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> LockResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(map_err!(Task))?
    }

    fn ensure_tables(&self) -> LockResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_record(&self, key: &str) -> LockResult<Option<LockRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: LockRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn try_insert(&self, record: &LockRecord) -> LockResult<Option<LockRecord>> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existing = {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let existing = match table.get(record.key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice::<LockRecord>(guard.value())
                        .map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            if existing.is_none() {
                table
                    .insert(record.key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            existing
        };
        if existing.is_some() {
            txn.abort().map_err(map_err!(Transaction))?;
        } else {
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(key = %record.key, "lock record written");
        }
        Ok(existing)
    }

    fn remove_record(&self, key: &str) -> LockResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "lock record deleted");
        Ok(existed)
    }

    fn list_records(&self) -> LockResult<Vec<LockRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: LockRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }
}

#[async_trait]
impl LockBackend for RedbLockStore {
    async fn get(&self, key: &str) -> LockResult<Option<LockRecord>> {
        let key = key.to_string();
        self.blocking(move |store| store.get_record(&key)).await
    }

    async fn insert_if_absent(&self, record: &LockRecord) -> LockResult<Option<LockRecord>> {
        let record = record.clone();
        self.blocking(move |store| store.try_insert(&record)).await
    }

    async fn delete(&self, key: &str) -> LockResult<bool> {
        let key = key.to_string();
        self.blocking(move |store| store.remove_record(&key)).await
    }

    async fn list(&self) -> LockResult<Vec<LockRecord>> {
        self.blocking(|store| store.list_records()).await
    }
}
