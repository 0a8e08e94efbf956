//! meshflip.toml configuration parser.
//!
//! The file holds the static table of known environments plus the
//! health gate settings shared by every run:
//!
//! ```toml
//! release_lock_on_failure = false
//! lock_table = "meshflip-deploy-locks"
//!
//! [health]
//! interval = "5s"
//! max_interval = "30s"
//! deadline = "20m"
//!
//! [[environments]]
//! key = "echo_server:prod"
//! mesh_name = "echo-mesh"
//! # ...
//! network = { mode = "static", subnets = ["subnet-a"], security_groups = ["sg-1"] }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SpecError, SpecResult};
use crate::types::DeploymentSpec;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeshflipConfig {
    /// Lock database path. The CLI falls back to its `--lock-db` default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_db: Option<PathBuf>,
    /// Shared lock table. When set, locks live there instead of `lock_db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_table: Option<String>,
    /// Release the lock when a run fails instead of leaving it held.
    #[serde(default)]
    pub release_lock_on_failure: bool,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub environments: Vec<DeploymentSpec>,
}

/// Polling behaviour of the health gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSettings {
    /// Base delay between polls (e.g. "5s").
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Cap for the backoff delay.
    #[serde(default = "default_max_interval")]
    pub max_interval: String,
    /// Overall wait budget. Unset means wait indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    /// Maximum polls per stage. Unset means no cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_polls: Option<u32>,
    /// Wait for units to show up as not ready before waiting for them to
    /// become ready.
    #[serde(default = "default_await_transition")]
    pub await_transition: bool,
}

fn default_interval() -> String {
    "5s".to_string()
}

fn default_max_interval() -> String {
    "30s".to_string()
}

fn default_await_transition() -> bool {
    true
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            max_interval: default_max_interval(),
            deadline: None,
            max_polls: None,
            await_transition: true,
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> SpecResult<Duration> {
        parse_field("health.interval", &self.interval)
    }

    pub fn max_interval(&self) -> SpecResult<Duration> {
        parse_field("health.max_interval", &self.max_interval)
    }

    pub fn deadline(&self) -> SpecResult<Option<Duration>> {
        self.deadline
            .as_deref()
            .map(|d| parse_field("health.deadline", d))
            .transpose()
    }

    pub fn validate(&self) -> SpecResult<()> {
        self.interval()?;
        self.max_interval()?;
        self.deadline()?;
        Ok(())
    }
}

fn parse_field(field: &'static str, value: &str) -> SpecResult<Duration> {
    parse_duration(value).ok_or_else(|| SpecError::Duration {
        field,
        value: value.to_string(),
    })
}

/// Parse a duration string like "5s", "500ms", "2m". A bare number is
/// taken as seconds. Values too large to represent yield `None`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, unit_secs) = if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else {
        (s, 1)
    };
    digits
        .parse::<u64>()
        .ok()?
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
}

impl MeshflipConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MeshflipConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Look up an environment by its key.
    pub fn environment(&self, key: &str) -> SpecResult<&DeploymentSpec> {
        self.environments
            .iter()
            .find(|spec| spec.key.as_deref() == Some(key))
            .ok_or_else(|| SpecError::UnknownEnvironment(key.to_string()))
    }

    /// Validate the health settings and every environment. Table entries
    /// must carry a unique key, since the key is how they are looked up.
    pub fn validate(&self) -> SpecResult<()> {
        self.health.validate()?;
        if self.lock_table.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(SpecError::Invalid {
                issues: vec!["lock_table must not be empty when set".to_string()],
            });
        }
        let mut seen = HashSet::new();
        for spec in &self.environments {
            let Some(key) = spec.key.as_deref() else {
                return Err(SpecError::Invalid {
                    issues: vec![format!(
                        "environment for service {:?} has no key",
                        spec.service_name
                    )],
                });
            };
            if !seen.insert(key) {
                return Err(SpecError::DuplicateEnvironment(key.to_string()));
            }
            spec.validate()?;
        }
        Ok(())
    }
}

/// Load a single inline spec from a JSON file.
pub fn load_inline_spec(path: &Path) -> anyhow::Result<DeploymentSpec> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetworkPlacement;
    use std::io::Write;

    const SAMPLE: &str = r#"
release_lock_on_failure = true
lock_table = "meshflip-deploy-locks"

[health]
interval = "2s"
deadline = "15m"
max_polls = 200

[[environments]]
key = "echo_server:prod"
mesh_name = "echo-mesh"
namespace_name = "echo.local"
service_name = "echo_server"
port = 8080
virtual_router_name = "virtual-router"
route_name = "route"
cluster_name = "echo"
compute_service_name = "echo_server-20200626124812-service"
task_definition_family = "echo_server"
parameter_name = "/echo/params/APPMESH_VIRTUAL_NODE_NAME"
network = { mode = "static", subnets = ["subnet-014bbdb7bd7d197f5", "subnet-0a6cf45ab183e6057"], security_groups = ["sg-0e9bf54c2994de1b0"] }
capabilities = { locking = true, publish_parameter = true }

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
"#;

    #[test]
    fn parses_environment_table() {
        let config: MeshflipConfig = toml::from_str(SAMPLE).unwrap();
        assert!(config.release_lock_on_failure);
        assert_eq!(config.lock_table.as_deref(), Some("meshflip-deploy-locks"));
        assert_eq!(config.environments.len(), 2);
        config.validate().unwrap();

        let prod = config.environment("echo_server:prod").unwrap();
        assert_eq!(prod.mesh_name, "echo-mesh");
        assert_eq!(prod.static_network().unwrap().subnets.len(), 2);
        assert_eq!(
            prod.publish_target(),
            Some("/echo/params/APPMESH_VIRTUAL_NODE_NAME")
        );

        let qa = config.environment("echo_server:qa1").unwrap();
        assert_eq!(qa.network, NetworkPlacement::Discover);
    }

    #[test]
    fn unknown_environment_is_reported() {
        let config: MeshflipConfig = toml::from_str(SAMPLE).unwrap();
        assert!(matches!(
            config.environment("echo_server:dev"),
            Err(SpecError::UnknownEnvironment(key)) if key == "echo_server:dev"
        ));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut config: MeshflipConfig = toml::from_str(SAMPLE).unwrap();
        let dup = config.environments[0].clone();
        config.environments.push(dup);
        assert!(matches!(
            config.validate(),
            Err(SpecError::DuplicateEnvironment(_))
        ));
    }

    #[test]
    fn health_settings_resolve_durations() {
        let config: MeshflipConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.health.interval().unwrap(), Duration::from_secs(2));
        assert_eq!(config.health.max_interval().unwrap(), Duration::from_secs(30));
        assert_eq!(
            config.health.deadline().unwrap(),
            Some(Duration::from_secs(15 * 60))
        );
        assert_eq!(config.health.max_polls, Some(200));
        assert!(config.health.await_transition);
    }

    #[test]
    fn bad_duration_fails_validation() {
        let health = HealthSettings {
            interval: "soon".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            health.validate(),
            Err(SpecError::Duration { field: "health.interval", .. })
        ));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: MeshflipConfig = toml::from_str("").unwrap();
        assert!(config.environments.is_empty());
        assert_eq!(config.health, HealthSettings::default());
        assert!(!config.release_lock_on_failure);
        assert!(config.lock_table.is_none());
    }

    #[test]
    fn blank_lock_table_is_rejected() {
        let config: MeshflipConfig = toml::from_str("lock_table = \"  \"").unwrap();
        assert!(matches!(config.validate(), Err(SpecError::Invalid { .. })));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("fast"), None);
    }

    #[test]
    fn oversized_duration_is_rejected_not_wrapped() {
        assert_eq!(parse_duration("307445734561825861m"), None);
        assert_eq!(parse_duration("5124095576030432h"), None);
        assert_eq!(
            parse_duration("18446744073709551615s"),
            Some(Duration::from_secs(u64::MAX))
        );

        let health = HealthSettings {
            deadline: Some("307445734561825861m".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            health.validate(),
            Err(SpecError::Duration { field: "health.deadline", .. })
        ));
    }

    #[test]
    fn from_file_and_inline_spec() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("meshflip.toml");
        std::fs::File::create(&toml_path)
            .unwrap()
            .write_all(SAMPLE.as_bytes())
            .unwrap();
        let config = MeshflipConfig::from_file(&toml_path).unwrap();

        let json_path = dir.path().join("spec.json");
        let spec = config.environment("echo_server:qa1").unwrap();
        std::fs::write(&json_path, serde_json::to_vec(spec).unwrap()).unwrap();
        let inline = load_inline_spec(&json_path).unwrap();
        assert_eq!(&inline, spec);
    }
}
