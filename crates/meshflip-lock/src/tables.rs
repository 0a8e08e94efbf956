//! redb table definitions for the lock store.

use redb::TableDefinition;

/// Lock records keyed by deployment key, JSON-serialized.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("meshflip-deploy-locks");
