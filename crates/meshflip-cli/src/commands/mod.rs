pub mod deploy;
pub mod lock;
pub mod rehearse;
pub mod show;
pub mod validate;

use std::path::Path;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use meshflip_core::{DeploymentSpec, HealthSettings, MeshflipConfig, config::load_inline_spec};

/// The config file at `path`, or defaults when there is none.
pub fn load_config(path: &Path) -> anyhow::Result<MeshflipConfig> {
    if path.exists() {
        MeshflipConfig::from_file(path).with_context(|| format!("reading {}", path.display()))
    } else {
        Ok(MeshflipConfig::default())
    }
}

/// The environment named by `--env`, or the inline `--spec` file.
pub fn resolve_spec(
    config: &MeshflipConfig,
    env: Option<&str>,
    inline: Option<&Path>,
) -> anyhow::Result<DeploymentSpec> {
    match (env, inline) {
        (Some(key), _) => Ok(config.environment(key)?.clone()),
        (None, Some(path)) => {
            load_inline_spec(path).with_context(|| format!("reading {}", path.display()))
        }
        (None, None) => anyhow::bail!("either --env or --spec is required"),
    }
}

pub fn health_settings(config: &MeshflipConfig, interval: Option<String>) -> HealthSettings {
    let mut health = config.health.clone();
    if let Some(interval) = interval {
        health.interval = interval;
    }
    health
}

/// A cancellation signal that flips on the first Ctrl-C.
pub fn cancel_on_interrupt(what: &'static str) -> watch::Receiver<bool> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling {what}");
            let _ = cancel_tx.send(true);
        }
    });
    cancel_rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_is_looked_up_in_config() {
        let config: MeshflipConfig = toml::from_str(
            r#"
[[environments]]
key = "echo_server:qa1"
mesh_name = "echo-qa1-mesh"
namespace_name = "echo-qa1.local"
service_name = "echo_server"
port = 8080
virtual_router_name = "virtual-router"
route_name = "route"
cluster_name = "echo-qa1"
compute_service_name = "echo_server"
task_definition_family = "echo-qa1-echo-server"
network = { mode = "discover" }
"#,
        )
        .unwrap();

        let spec = resolve_spec(&config, Some("echo_server:qa1"), None).unwrap();
        assert_eq!(spec.cluster_name, "echo-qa1");
        assert!(resolve_spec(&config, Some("echo_server:prod"), None).is_err());
        assert!(resolve_spec(&config, None, None).is_err());
    }

    #[test]
    fn interval_flag_overrides_config() {
        let config = MeshflipConfig::default();
        assert_eq!(health_settings(&config, None), config.health);
        assert_eq!(
            health_settings(&config, Some("100ms".to_string())).interval,
            "100ms"
        );
    }

    #[test]
    fn missing_config_file_gives_defaults() {
        let config = load_config(Path::new("/nonexistent/meshflip.toml")).unwrap();
        assert!(config.environments.is_empty());
    }
}
