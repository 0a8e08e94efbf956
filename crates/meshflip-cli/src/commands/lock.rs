use std::path::{Path, PathBuf};
use std::sync::Arc;

use meshflip_aws::DynamoLockStore;
use meshflip_core::MeshflipConfig;
use meshflip_lock::{LockManager, RedbLockStore};

/// Lock database used when neither the flags nor the config name a store.
pub const DEFAULT_LOCK_DB: &str = "meshflip-locks.redb";

/// Where deployment locks are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockTarget {
    /// Embedded redb file; only excludes runs on this host.
    File(PathBuf),
    /// DynamoDB table shared by every host.
    Table(String),
}

/// Flags win over the config file, and a table wins over a file at the
/// same level. With nothing set, [`DEFAULT_LOCK_DB`].
pub fn resolve_target(
    config: &MeshflipConfig,
    db_flag: Option<PathBuf>,
    table_flag: Option<String>,
) -> LockTarget {
    if let Some(table) = table_flag {
        return LockTarget::Table(table);
    }
    if let Some(path) = db_flag {
        return LockTarget::File(path);
    }
    if let Some(table) = &config.lock_table {
        return LockTarget::Table(table.clone());
    }
    LockTarget::File(
        config
            .lock_db
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_DB)),
    )
}

pub fn open_file(path: &Path) -> anyhow::Result<LockManager> {
    let store = RedbLockStore::open(path)?;
    Ok(LockManager::new(Arc::new(store)))
}

pub async fn open(target: &LockTarget) -> anyhow::Result<LockManager> {
    match target {
        LockTarget::File(path) => open_file(path),
        LockTarget::Table(table) => {
            let config = meshflip_aws::load_sdk_config().await;
            let store = DynamoLockStore::from_config(&config, table.as_str());
            Ok(LockManager::new(Arc::new(store)))
        }
    }
}

pub async fn status(target: &LockTarget, key: &str) -> anyhow::Result<()> {
    match open(target).await?.inspect(key).await? {
        Some(record) => println!("{key}: locked ({})", record.comment),
        None => println!("{key}: unlocked"),
    }
    Ok(())
}

pub async fn release(target: &LockTarget, key: &str) -> anyhow::Result<()> {
    if open(target).await?.release(key).await? {
        println!("✓ released {key}");
    } else {
        println!("{key} was not locked");
    }
    Ok(())
}

pub async fn list(target: &LockTarget) -> anyhow::Result<()> {
    let records = open(target).await?.list().await?;
    if records.is_empty() {
        println!("no locks held");
    }
    for record in records {
        println!("{:<24} {}", record.key, record.comment);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml: &str) -> MeshflipConfig {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn flags_beat_config() {
        let configured = config(
            "lock_db = \"/var/lib/meshflip/locks.redb\"\nlock_table = \"meshflip-deploy-locks\"",
        );

        assert_eq!(
            resolve_target(&configured, Some(PathBuf::from("/tmp/x.redb")), None),
            LockTarget::File(PathBuf::from("/tmp/x.redb"))
        );
        assert_eq!(
            resolve_target(&configured, None, Some("other-locks".to_string())),
            LockTarget::Table("other-locks".to_string())
        );
        assert_eq!(
            resolve_target(&configured, None, None),
            LockTarget::Table("meshflip-deploy-locks".to_string())
        );
    }

    #[test]
    fn config_lock_db_without_table() {
        let configured = config("lock_db = \"/var/lib/meshflip/locks.redb\"");
        assert_eq!(
            resolve_target(&configured, None, None),
            LockTarget::File(PathBuf::from("/var/lib/meshflip/locks.redb"))
        );
    }

    #[test]
    fn empty_config_falls_back_to_default_file() {
        assert_eq!(
            resolve_target(&MeshflipConfig::default(), None, None),
            LockTarget::File(PathBuf::from(DEFAULT_LOCK_DB))
        );
    }

    #[tokio::test]
    async fn release_clears_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let target = LockTarget::File(dir.path().join("locks.redb"));
        {
            let locks = open(&target).await.unwrap();
            locks.acquire("echo_server:prod").await.unwrap();
        }

        release(&target, "echo_server:prod").await.unwrap();
        let locks = open(&target).await.unwrap();
        assert!(locks.inspect("echo_server:prod").await.unwrap().is_none());
    }
}
