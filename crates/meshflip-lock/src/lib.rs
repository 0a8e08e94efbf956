//! meshflip-lock: per-key deployment locks.
//!
//! A lock is a single `{key, comment}` record; absence of the record means
//! unlocked. Acquisition is a compare-and-insert: the backend checks for
//! an existing record and writes the new one as a single atomic step, so
//! two racing acquirers cannot both succeed.
//!
//! # Components
//!
//! - **`backend`**: the [`LockBackend`] trait and [`LockRecord`]
//! - **`store`**: [`RedbLockStore`], an embedded redb lock table
//! - **`manager`**: [`LockManager`], acquire/release with logging

pub mod backend;
pub mod error;
pub mod manager;
pub mod store;
pub mod tables;

pub use backend::{LockBackend, LockRecord};
pub use error::{LockError, LockResult};
pub use manager::LockManager;
pub use store::RedbLockStore;
