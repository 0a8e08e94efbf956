//! External systems a cutover talks to, and the resources they return.
//!
//! Each system is an object-safe async trait so the orchestrator can run
//! against real cloud clients or the in-memory platform alike:
//!
//! - [`ComputePlatform`]: services, task definitions, task sets, tasks
//! - [`MeshControlPlane`]: mesh nodes and routes
//! - [`DiscoveryRegistry`]: namespaces, services, instance health
//! - [`ParameterStore`]: publishes the active node for other consumers
//! - [`PipelineReporter`]: success/failure callback to the invoking pipeline

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use meshflip_core::NetworkConfig;

use crate::error::DeployError;
use crate::orchestrator::DeploymentOutcome;

/// Service status meaning the service accepts task sets.
pub const SERVICE_ACTIVE: &str = "ACTIVE";

/// Task status meaning the task is up.
pub const TASK_RUNNING: &str = "RUNNING";

/// Task set tag naming the mesh node the task set serves.
pub const MESH_NODE_TAG: &str = "meshflip:mesh-node";

/// Mesh node tag naming the discovery service it was created for.
pub const SERVICE_TAG: &str = "meshflip:service";

/// Mesh node tag holding the external ID of its task set.
pub const EXTERNAL_ID_TAG: &str = "meshflip:external-id";

/// Discovery attribute the sidecar matches against task set external IDs.
pub const TASK_SET_EXTERNAL_ID_ATTRIBUTE: &str = "ECS_TASK_SET_EXTERNAL_ID";

pub type PlatformResult<T> = Result<T, PlatformError>;

/// A failed call to an external system.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed: {message}")]
pub struct PlatformError {
    pub operation: &'static str,
    pub message: String,
}

impl PlatformError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

// ── Compute ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeService {
    pub arn: String,
    pub name: String,
    pub status: String,
    pub desired_count: u32,
    pub network: Option<NetworkConfig>,
    pub deployment_controller: DeploymentController,
    pub task_sets: Vec<TaskSet>,
}

impl ComputeService {
    pub fn is_active(&self) -> bool {
        self.status == SERVICE_ACTIVE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentController {
    /// The platform shifts traffic itself.
    Platform,
    /// Traffic shifting is driven from outside (here: by the mesh route).
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulingStrategy {
    Replica,
    Daemon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateServiceRequest {
    pub cluster: String,
    pub service_name: String,
    pub desired_count: u32,
    pub maximum_percent: u32,
    pub minimum_healthy_percent: u32,
    pub scheduling_strategy: SchedulingStrategy,
    pub deployment_controller: DeploymentController,
    pub network: Option<NetworkConfig>,
}

/// One entry from a task definition listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinitionRef {
    pub arn: String,
    pub family: String,
    pub revision: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub environment: Vec<EnvVar>,
    /// Fields meshflip passes through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ContainerDefinition {
    pub fn env(&self, name: &str) -> Option<&str> {
        self.environment
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    /// Overwrite `name` if the container already sets it. Returns false,
    /// leaving the container untouched, when it does not.
    pub fn replace_env(&mut self, name: &str, value: String) -> bool {
        match self.environment.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }
}

/// What gets sent when registering a task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinitionInput {
    pub family: String,
    pub container_definitions: Vec<ContainerDefinition>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskDefinitionInput {
    pub fn container(&self, name: &str) -> Option<&ContainerDefinition> {
        self.container_definitions.iter().find(|c| c.name == name)
    }

    pub fn container_mut(&mut self, name: &str) -> Option<&mut ContainerDefinition> {
        self.container_definitions.iter_mut().find(|c| c.name == name)
    }
}

/// A registered task definition: the input plus server-assigned fields,
/// which are not accepted on re-registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub arn: String,
    pub revision: u32,
    pub status: String,
    #[serde(default)]
    pub compatibilities: Vec<String>,
    #[serde(default)]
    pub requires_attributes: Vec<String>,
    #[serde(flatten)]
    pub input: TaskDefinitionInput,
}

impl TaskDefinition {
    /// Drop the server-assigned fields, keeping what can be registered.
    pub fn into_input(self) -> TaskDefinitionInput {
        self.input
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSet {
    pub arn: String,
    pub external_id: Option<String>,
    pub task_definition: String,
    pub status: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskSetRequest {
    pub cluster: String,
    /// Service ARN.
    pub service: String,
    pub external_id: String,
    pub task_definition: String,
    pub registry_arn: String,
    pub scale_percent: u32,
    pub launch_type: String,
    pub network: NetworkConfig,
    pub assign_public_ip: bool,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub arn: String,
    pub task_definition_arn: String,
    pub last_status: String,
}

#[async_trait]
pub trait ComputePlatform: Send + Sync {
    async fn describe_service(
        &self,
        cluster: &str,
        service: &str,
    ) -> PlatformResult<Option<ComputeService>>;

    async fn create_service(&self, request: &CreateServiceRequest) -> PlatformResult<ComputeService>;

    /// Task definitions whose family starts with `family_prefix`, oldest
    /// registration first.
    async fn list_task_definitions(
        &self,
        family_prefix: &str,
    ) -> PlatformResult<Vec<TaskDefinitionRef>>;

    async fn describe_task_definition(&self, arn: &str) -> PlatformResult<TaskDefinition>;

    async fn register_task_definition(
        &self,
        input: &TaskDefinitionInput,
    ) -> PlatformResult<TaskDefinition>;

    async fn create_task_set(&self, request: &CreateTaskSetRequest) -> PlatformResult<TaskSet>;

    async fn update_primary_task_set(
        &self,
        cluster: &str,
        service: &str,
        task_set_arn: &str,
    ) -> PlatformResult<TaskSet>;

    async fn delete_task_set(
        &self,
        cluster: &str,
        service: &str,
        task_set_arn: &str,
    ) -> PlatformResult<()>;

    async fn list_tasks(&self, cluster: &str, service: &str) -> PlatformResult<Vec<String>>;

    async fn describe_tasks(&self, cluster: &str, task_arns: &[String]) -> PlatformResult<Vec<Task>>;
}

// ── Mesh ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshProtocol {
    Grpc,
    Http,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckPolicy {
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub interval_millis: u64,
    pub timeout_millis: u64,
    pub port: u16,
    pub protocol: MeshProtocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub port: u16,
    pub protocol: MeshProtocol,
    pub health_check: HealthCheckPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryBinding {
    pub namespace_name: String,
    pub service_name: String,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshNodeSpec {
    pub mesh_name: String,
    pub node_name: String,
    pub discovery: DiscoveryBinding,
    pub listeners: Vec<Listener>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshNode {
    pub mesh_name: String,
    pub name: String,
    pub arn: String,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedTarget {
    pub node: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RouteMatch {
    pub service_name: Option<String>,
    pub method_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub priority: Option<u32>,
    pub route_match: Option<RouteMatch>,
    pub weighted_targets: Vec<WeightedTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub mesh_name: String,
    pub router_name: String,
    pub route_name: String,
    pub spec: RouteSpec,
}

impl Route {
    /// Targets currently receiving traffic.
    pub fn live_targets(&self) -> impl Iterator<Item = &WeightedTarget> {
        self.spec.weighted_targets.iter().filter(|t| t.weight > 0)
    }
}

#[async_trait]
pub trait MeshControlPlane: Send + Sync {
    /// Names of every node in the mesh.
    async fn list_mesh_nodes(&self, mesh: &str) -> PlatformResult<Vec<String>>;

    async fn create_mesh_node(&self, spec: &MeshNodeSpec) -> PlatformResult<MeshNode>;

    async fn delete_mesh_node(&self, mesh: &str, node: &str) -> PlatformResult<()>;

    async fn describe_route(
        &self,
        mesh: &str,
        router: &str,
        route: &str,
    ) -> PlatformResult<Option<Route>>;

    async fn update_route(&self, route: &Route) -> PlatformResult<Route>;
}

// ── Discovery ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryService {
    pub id: String,
    pub arn: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

#[async_trait]
pub trait DiscoveryRegistry: Send + Sync {
    async fn list_namespaces(&self) -> PlatformResult<Vec<Namespace>>;

    async fn list_services(&self, namespace_id: &str) -> PlatformResult<Vec<DiscoveryService>>;

    /// Health of every registered instance, keyed by instance ID.
    async fn instances_health(
        &self,
        service_id: &str,
    ) -> PlatformResult<BTreeMap<String, InstanceHealth>>;
}

// ── Parameters & pipeline ──────────────────────────────────────────

#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Create or overwrite a string parameter.
    async fn put_parameter(&self, name: &str, value: &str) -> PlatformResult<()>;
}

#[async_trait]
pub trait PipelineReporter: Send + Sync {
    async fn report_success(&self, outcome: &DeploymentOutcome) -> PlatformResult<()>;

    async fn report_failure(&self, error: &DeployError) -> PlatformResult<()>;
}
