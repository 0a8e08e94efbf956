//! Deployment spec types shared across meshflip crates.
//!
//! A [`DeploymentSpec`] names every external resource a cutover touches.
//! It is supplied once per run (inline or from the environment table)
//! and never mutated.

use serde::{Deserialize, Serialize};

use crate::error::{SpecError, SpecResult};

/// Default name of the mesh proxy container in the task definition.
pub const DEFAULT_SIDECAR_CONTAINER: &str = "envoy";

/// Default env var through which the sidecar learns its mesh node.
pub const DEFAULT_NODE_ENV_VAR: &str = "APPMESH_VIRTUAL_NODE_NAME";

/// Default launch type for new task sets.
pub const DEFAULT_LAUNCH_TYPE: &str = "FARGATE";

/// Everything a single cutover needs to know about its environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentSpec {
    /// Lock key; identifies this environment in the lock table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Name of the service mesh.
    pub mesh_name: String,
    /// Discovery namespace, e.g. `echo.local`.
    pub namespace_name: String,
    /// Discovery service name. Also the prefix of every mesh node name.
    pub service_name: String,
    /// Port the gRPC backend listens on.
    pub port: u16,
    pub virtual_router_name: String,
    pub route_name: String,
    pub cluster_name: String,
    /// Service name as known to the compute platform.
    pub compute_service_name: String,
    /// Task definition family the new revision is derived from.
    pub task_definition_family: String,
    pub network: NetworkPlacement,
    /// Parameter that receives the active node path after cutover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_name: Option<String>,
    #[serde(default)]
    pub sidecar: SidecarConfig,
    #[serde(default = "default_launch_type")]
    pub launch_type: String,
    #[serde(default)]
    pub capabilities: Capabilities,
}

fn default_launch_type() -> String {
    DEFAULT_LAUNCH_TYPE.to_string()
}

/// Where new task sets are placed on the network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NetworkPlacement {
    /// Subnets and security groups listed in config.
    Static {
        subnets: Vec<String>,
        security_groups: Vec<String>,
    },
    /// Reuse the network configuration of the live compute service.
    Discover,
}

/// Resolved subnets and security groups for a task set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NetworkConfig {
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
}

/// Identifies the proxy container and the env var naming its mesh node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SidecarConfig {
    pub container_name: String,
    pub node_env_var: String,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            container_name: DEFAULT_SIDECAR_CONTAINER.to_string(),
            node_env_var: DEFAULT_NODE_ENV_VAR.to_string(),
        }
    }
}

/// Optional orchestrator behaviours, toggled per environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    /// Hold the deployment lock for the duration of the run.
    #[serde(default = "enabled")]
    pub locking: bool,
    /// Publish the active node path to the parameter store after cutover.
    #[serde(default)]
    pub publish_parameter: bool,
}

fn enabled() -> bool {
    true
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            locking: true,
            publish_parameter: false,
        }
    }
}

impl DeploymentSpec {
    /// Lock key, when locking is enabled and a key is configured.
    pub fn lock_key(&self) -> Option<&str> {
        if self.capabilities.locking {
            self.key.as_deref()
        } else {
            None
        }
    }

    /// Parameter to publish to, when publishing is enabled.
    pub fn publish_target(&self) -> Option<&str> {
        if self.capabilities.publish_parameter {
            self.parameter_name.as_deref()
        } else {
            None
        }
    }

    /// Static network config, if placement is not discovered.
    pub fn static_network(&self) -> Option<NetworkConfig> {
        match &self.network {
            NetworkPlacement::Static {
                subnets,
                security_groups,
            } => Some(NetworkConfig {
                subnets: subnets.clone(),
                security_groups: security_groups.clone(),
            }),
            NetworkPlacement::Discover => None,
        }
    }

    /// Check the deployment spec for missing or inconsistent values.
    ///
    /// Only shape is checked here; whether the named resources exist is
    /// discovered during the run.
    pub fn validate(&self) -> SpecResult<()> {
        let mut issues = Vec::new();

        let required = [
            ("mesh_name", &self.mesh_name),
            ("namespace_name", &self.namespace_name),
            ("service_name", &self.service_name),
            ("virtual_router_name", &self.virtual_router_name),
            ("route_name", &self.route_name),
            ("cluster_name", &self.cluster_name),
            ("compute_service_name", &self.compute_service_name),
            ("task_definition_family", &self.task_definition_family),
            ("launch_type", &self.launch_type),
            ("sidecar.container_name", &self.sidecar.container_name),
            ("sidecar.node_env_var", &self.sidecar.node_env_var),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                issues.push(format!("{field} must not be empty"));
            }
        }

        if self.port == 0 {
            issues.push("port must be non-zero".to_string());
        }

        if let NetworkPlacement::Static { subnets, .. } = &self.network {
            if subnets.is_empty() {
                issues.push("static network placement needs at least one subnet".to_string());
            }
        }

        if self.capabilities.locking && self.key.as_deref().is_none_or(str::is_empty) {
            issues.push("locking is enabled but no key is set".to_string());
        }

        if self.capabilities.publish_parameter
            && self.parameter_name.as_deref().is_none_or(str::is_empty)
        {
            issues.push("publish_parameter is enabled but no parameter_name is set".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(SpecError::Invalid { issues })
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_spec() -> DeploymentSpec {
        DeploymentSpec {
            key: Some("echo_server:prod".to_string()),
            mesh_name: "echo-mesh".to_string(),
            namespace_name: "echo.local".to_string(),
            service_name: "echo_server".to_string(),
            port: 8080,
            virtual_router_name: "virtual-router".to_string(),
            route_name: "route".to_string(),
            cluster_name: "echo".to_string(),
            compute_service_name: "echo_server-service".to_string(),
            task_definition_family: "echo_server".to_string(),
            network: NetworkPlacement::Static {
                subnets: vec!["subnet-a".to_string(), "subnet-b".to_string()],
                security_groups: vec!["sg-1".to_string()],
            },
            parameter_name: None,
            sidecar: SidecarConfig::default(),
            launch_type: DEFAULT_LAUNCH_TYPE.to_string(),
            capabilities: Capabilities::default(),
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(test_spec().validate().is_ok());
    }

    #[test]
    fn empty_names_and_port_are_reported_together() {
        let spec = DeploymentSpec {
            mesh_name: String::new(),
            port: 0,
            ..test_spec()
        };
        match spec.validate() {
            Err(SpecError::Invalid { issues }) => {
                assert_eq!(issues.len(), 2);
                assert!(issues[0].contains("mesh_name"));
                assert!(issues[1].contains("port"));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn locking_requires_key() {
        let spec = DeploymentSpec {
            key: None,
            ..test_spec()
        };
        assert!(spec.validate().is_err());

        let unlocked = DeploymentSpec {
            key: None,
            capabilities: Capabilities {
                locking: false,
                publish_parameter: false,
            },
            ..test_spec()
        };
        assert!(unlocked.validate().is_ok());
        assert_eq!(unlocked.lock_key(), None);
    }

    #[test]
    fn publish_requires_parameter_name() {
        let spec = DeploymentSpec {
            capabilities: Capabilities {
                locking: true,
                publish_parameter: true,
            },
            ..test_spec()
        };
        assert!(spec.validate().is_err());

        let spec = DeploymentSpec {
            parameter_name: Some("/echo/params/node".to_string()),
            ..spec
        };
        assert!(spec.validate().is_ok());
        assert_eq!(spec.publish_target(), Some("/echo/params/node"));
    }

    #[test]
    fn parameter_is_ignored_when_publishing_disabled() {
        let spec = DeploymentSpec {
            parameter_name: Some("/echo/params/node".to_string()),
            ..test_spec()
        };
        assert_eq!(spec.publish_target(), None);
    }

    #[test]
    fn static_placement_needs_subnets() {
        let spec = DeploymentSpec {
            network: NetworkPlacement::Static {
                subnets: vec![],
                security_groups: vec![],
            },
            ..test_spec()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn discovered_placement_has_no_static_network() {
        let spec = DeploymentSpec {
            network: NetworkPlacement::Discover,
            ..test_spec()
        };
        assert!(spec.validate().is_ok());
        assert!(spec.static_network().is_none());
    }

    #[test]
    fn json_defaults_fill_optional_sections() {
        let json = r#"{
            "key": "echo_server:qa1",
            "mesh_name": "echo-qa1-mesh",
            "namespace_name": "echo-qa1.local",
            "service_name": "echo_server",
            "port": 8080,
            "virtual_router_name": "virtual-router",
            "route_name": "route",
            "cluster_name": "echo-qa1",
            "compute_service_name": "echo_server",
            "task_definition_family": "echo-qa1-echo-server",
            "network": { "mode": "discover" }
        }"#;
        let spec: DeploymentSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.sidecar, SidecarConfig::default());
        assert_eq!(spec.launch_type, "FARGATE");
        assert!(spec.capabilities.locking);
        assert_eq!(spec.network, NetworkPlacement::Discover);
    }
}
