use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use meshflip_aws::AwsPlatform;
use meshflip_deploy::{LogReporter, Orchestrator};
use meshflip_health::HealthGate;
use meshflip_lock::LockManager;

use super::lock::{self, LockTarget};

/// Lock store selection for a deploy run.
pub struct LockFlags {
    pub lock_db: Option<PathBuf>,
    pub lock_table: Option<String>,
}

/// Cut over one environment on AWS.
pub async fn deploy(
    config_path: &Path,
    env: Option<&str>,
    inline: Option<&Path>,
    interval: Option<String>,
    flags: LockFlags,
) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let spec = super::resolve_spec(&config, env, inline)?;
    spec.validate()?;
    let health = super::health_settings(&config, interval);
    let gate = HealthGate::new(&health)?.with_cancellation(super::cancel_on_interrupt("deployment"));

    let aws = AwsPlatform::from_env().await;
    let locks = if spec.lock_key().is_some() {
        let target = lock::resolve_target(&config, flags.lock_db, flags.lock_table);
        Some(open_locks(&aws, target)?)
    } else {
        None
    };

    info!(
        key = spec.key.as_deref().unwrap_or("-"),
        service = %spec.service_name,
        cluster = %spec.cluster_name,
        "starting cutover"
    );
    let mut orchestrator = Orchestrator::new(spec, aws.platform(), gate)
        .release_lock_on_failure(config.release_lock_on_failure);
    if let Some(locks) = locks {
        orchestrator = orchestrator.with_locks(locks);
    }

    let outcome = orchestrator.run_and_report(&LogReporter).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

/// Locks for `target`, reusing the platform's AWS config for a table.
fn open_locks(aws: &AwsPlatform, target: LockTarget) -> anyhow::Result<LockManager> {
    match target {
        LockTarget::Table(table) => {
            info!(%table, "using shared lock table");
            Ok(LockManager::new(Arc::new(aws.lock_store(table))))
        }
        LockTarget::File(path) => {
            warn!(
                path = %path.display(),
                "lock file only excludes runs on this host; set lock_table to share locks"
            );
            lock::open_file(&path)
        }
    }
}
