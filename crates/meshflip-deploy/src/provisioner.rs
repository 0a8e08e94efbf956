//! Resource provisioner: compute service, mesh node, task revision and
//! task set for one cutover.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use meshflip_core::naming::{external_id, mesh_node_name, qualified_node_path};
use meshflip_core::{DeploymentSpec, NetworkConfig, NetworkPlacement};

use crate::error::{DeployError, DeployResult};
use crate::platform::*;

/// Health check of the new node's listener: 2 passes to mark healthy,
/// 3 failures to mark unhealthy, every 5s with a 2s timeout.
const HEALTHY_THRESHOLD: u32 = 2;
const UNHEALTHY_THRESHOLD: u32 = 3;
const HEALTH_INTERVAL_MILLIS: u64 = 5_000;
const HEALTH_TIMEOUT_MILLIS: u64 = 2_000;

const MAXIMUM_PERCENT: u32 = 200;
const MINIMUM_HEALTHY_PERCENT: u32 = 100;

/// The compute service a run deploys into, with its resolved placement.
#[derive(Debug, Clone)]
pub struct EnsuredService {
    pub service: ComputeService,
    pub network: NetworkConfig,
    pub created: bool,
}

/// A freshly created mesh node and the discovery service it binds to.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub node: MeshNode,
    pub registry: DiscoveryService,
}

impl NewNode {
    pub fn name(&self) -> &str {
        &self.node.name
    }
}

pub struct Provisioner {
    spec: Arc<DeploymentSpec>,
    compute: Arc<dyn ComputePlatform>,
    mesh: Arc<dyn MeshControlPlane>,
    discovery: Arc<dyn DiscoveryRegistry>,
}

impl Provisioner {
    pub fn new(
        spec: Arc<DeploymentSpec>,
        compute: Arc<dyn ComputePlatform>,
        mesh: Arc<dyn MeshControlPlane>,
        discovery: Arc<dyn DiscoveryRegistry>,
    ) -> Self {
        Self {
            spec,
            compute,
            mesh,
            discovery,
        }
    }

    /// Make sure an active compute service exists, creating it if needed.
    ///
    /// An active service is left untouched. With discovered placement the
    /// network config is read from the live service, so the service must
    /// already exist.
    pub async fn ensure_service(&self) -> DeployResult<EnsuredService> {
        let spec = &self.spec;
        let existing = self
            .compute
            .describe_service(&spec.cluster_name, &spec.compute_service_name)
            .await?;

        if let Some(service) = existing.filter(ComputeService::is_active) {
            info!(arn = %service.arn, "found active compute service");
            let network = match &spec.network {
                NetworkPlacement::Static { .. } => spec.static_network().unwrap_or_default(),
                NetworkPlacement::Discover => service.network.clone().ok_or_else(|| {
                    DeployError::configuration(format!(
                        "service '{}' has no network configuration to discover",
                        spec.compute_service_name
                    ))
                })?,
            };
            return Ok(EnsuredService {
                service,
                network,
                created: false,
            });
        }

        let Some(network) = spec.static_network() else {
            return Err(DeployError::configuration(format!(
                "missing active service '{}' in cluster '{}'; discovered network placement needs it to exist",
                spec.compute_service_name, spec.cluster_name
            )));
        };

        let request = CreateServiceRequest {
            cluster: spec.cluster_name.clone(),
            service_name: spec.compute_service_name.clone(),
            desired_count: network.subnets.len() as u32,
            maximum_percent: MAXIMUM_PERCENT,
            minimum_healthy_percent: MINIMUM_HEALTHY_PERCENT,
            scheduling_strategy: SchedulingStrategy::Replica,
            deployment_controller: DeploymentController::External,
            network: Some(network.clone()),
        };
        info!(
            service = %request.service_name,
            desired_count = request.desired_count,
            "missing compute service, creating"
        );
        let service = self.compute.create_service(&request).await?;
        info!(arn = %service.arn, "created compute service");

        Ok(EnsuredService {
            service,
            network,
            created: true,
        })
    }

    /// Look up the discovery service by namespace and service name.
    pub async fn resolve_discovery_service(&self) -> DeployResult<DiscoveryService> {
        let spec = &self.spec;
        let namespace = self
            .discovery
            .list_namespaces()
            .await?
            .into_iter()
            .find(|n| n.name == spec.namespace_name)
            .ok_or_else(|| {
                DeployError::configuration(format!(
                    "missing namespace '{}' in the discovery registry",
                    spec.namespace_name
                ))
            })?;

        self.discovery
            .list_services(&namespace.id)
            .await?
            .into_iter()
            .find(|s| s.name == spec.service_name)
            .ok_or_else(|| {
                DeployError::configuration(format!(
                    "missing service '{}' in namespace '{}'",
                    spec.service_name, spec.namespace_name
                ))
            })
    }

    /// Create the mesh node for this run, named after `now`.
    pub async fn create_mesh_node(&self, now: DateTime<Utc>) -> DeployResult<NewNode> {
        let registry = self.resolve_discovery_service().await?;
        let node_spec = self.node_spec(now);

        info!(node = %node_spec.node_name, mesh = %node_spec.mesh_name, "creating mesh node");
        let node = self.mesh.create_mesh_node(&node_spec).await?;
        info!(node = %node.name, arn = %node.arn, "created mesh node");

        Ok(NewNode { node, registry })
    }

    fn node_spec(&self, now: DateTime<Utc>) -> MeshNodeSpec {
        let spec = &self.spec;
        let node_name = mesh_node_name(&spec.service_name, now);
        let external_id = external_id(&node_name);
        let health_check = HealthCheckPolicy {
            healthy_threshold: HEALTHY_THRESHOLD,
            unhealthy_threshold: UNHEALTHY_THRESHOLD,
            interval_millis: HEALTH_INTERVAL_MILLIS,
            timeout_millis: HEALTH_TIMEOUT_MILLIS,
            port: spec.port,
            protocol: MeshProtocol::Grpc,
        };

        MeshNodeSpec {
            mesh_name: spec.mesh_name.clone(),
            node_name,
            discovery: DiscoveryBinding {
                namespace_name: spec.namespace_name.clone(),
                service_name: spec.service_name.clone(),
                attributes: BTreeMap::from([(
                    TASK_SET_EXTERNAL_ID_ATTRIBUTE.to_string(),
                    external_id.clone(),
                )]),
            },
            listeners: vec![Listener {
                port: spec.port,
                protocol: MeshProtocol::Grpc,
                health_check,
            }],
            tags: BTreeMap::from([
                (SERVICE_TAG.to_string(), spec.service_name.clone()),
                (EXTERNAL_ID_TAG.to_string(), external_id),
            ]),
        }
    }

    /// The active task definition of the configured family: exact family
    /// match, last one listed wins.
    pub async fn resolve_task_definition(&self) -> DeployResult<TaskDefinitionRef> {
        let family = &self.spec.task_definition_family;
        self.compute
            .list_task_definitions(family)
            .await?
            .into_iter()
            .filter(|r| &r.family == family)
            .last()
            .ok_or_else(|| {
                DeployError::configuration(format!("missing task definition family '{family}'"))
            })
    }

    /// Register a new revision whose sidecar is bound to `node`.
    pub async fn register_revision(&self, node: &NewNode) -> DeployResult<TaskDefinition> {
        let spec = &self.spec;
        let current = self.resolve_task_definition().await?;
        debug!(arn = %current.arn, "deriving revision from active task definition");

        let mut input = self
            .compute
            .describe_task_definition(&current.arn)
            .await?
            .into_input();

        let sidecar = input
            .container_mut(&spec.sidecar.container_name)
            .ok_or_else(|| {
                DeployError::configuration(format!(
                    "task definition '{}' has no '{}' container",
                    current.arn, spec.sidecar.container_name
                ))
            })?;
        let bound = sidecar.replace_env(
            &spec.sidecar.node_env_var,
            qualified_node_path(&spec.mesh_name, node.name()),
        );
        if !bound {
            return Err(DeployError::configuration(format!(
                "'{}' container in '{}' does not set {}; it is not bound to a mesh node",
                spec.sidecar.container_name, current.arn, spec.sidecar.node_env_var
            )));
        }

        info!(family = %input.family, node = %node.name(), "registering task definition");
        let registered = self.compute.register_task_definition(&input).await?;
        info!(arn = %registered.arn, revision = registered.revision, "registered task definition");
        Ok(registered)
    }

    /// Create the task set serving `node` and promote it to primary.
    pub async fn create_task_set(
        &self,
        service: &EnsuredService,
        node: &NewNode,
        revision: &TaskDefinition,
    ) -> DeployResult<TaskSet> {
        let spec = &self.spec;
        let request = CreateTaskSetRequest {
            cluster: spec.cluster_name.clone(),
            service: service.service.arn.clone(),
            external_id: external_id(node.name()),
            task_definition: revision.arn.clone(),
            registry_arn: node.registry.arn.clone(),
            scale_percent: 100,
            launch_type: spec.launch_type.clone(),
            network: service.network.clone(),
            assign_public_ip: false,
            tags: BTreeMap::from([(MESH_NODE_TAG.to_string(), node.name().to_string())]),
        };

        info!(external_id = %request.external_id, task_definition = %request.task_definition, "creating task set");
        let task_set = self.compute.create_task_set(&request).await?;
        info!(arn = %task_set.arn, "created task set");

        let primary = self
            .compute
            .update_primary_task_set(&spec.cluster_name, &service.service.name, &task_set.arn)
            .await?;
        info!(arn = %primary.arn, "promoted task set to primary");

        Ok(primary)
    }
}
