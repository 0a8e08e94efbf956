use std::path::Path;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::sync::watch;
use tracing::info;

use meshflip_core::{DeploymentSpec, HealthSettings};
use meshflip_deploy::{DeploymentOutcome, InMemoryPlatform, LogReporter, Orchestrator, Platform};
use meshflip_health::HealthGate;
use meshflip_lock::{LockManager, RedbLockStore};

pub async fn rehearse(
    config_path: &Path,
    env: Option<&str>,
    inline: Option<&Path>,
    interval: Option<String>,
) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let spec = super::resolve_spec(&config, env, inline)?;
    let health = super::health_settings(&config, interval);
    let cancel = super::cancel_on_interrupt("rehearsal");

    let outcome = run(spec, &health, config.release_lock_on_failure, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

/// Cut over `spec` on a fresh in-memory platform whose live node went up
/// an hour ago.
pub async fn run(
    spec: DeploymentSpec,
    health: &HealthSettings,
    release_lock_on_failure: bool,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<DeploymentOutcome> {
    let now = Utc::now();
    let platform =
        InMemoryPlatform::seeded(&spec, now - TimeDelta::hours(1)).with_active_service(&spec);
    let locks = LockManager::new(Arc::new(RedbLockStore::open_in_memory()?));
    let gate = HealthGate::new(health)?.with_cancellation(cancel);

    info!(
        key = spec.key.as_deref().unwrap_or("-"),
        service = %spec.service_name,
        "rehearsing cutover"
    );
    let outcome = Orchestrator::new(spec, Platform::in_memory(&platform), gate)
        .with_locks(locks)
        .with_clock(Arc::new(move || now))
        .release_lock_on_failure(release_lock_on_failure)
        .run_and_report(&LogReporter)
        .await?;
    Ok(outcome)
}
