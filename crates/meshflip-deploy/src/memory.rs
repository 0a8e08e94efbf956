//! In-memory platform for rehearsals and tests.
//!
//! One [`InMemoryPlatform`] implements the compute, mesh, discovery and
//! parameter traits over shared state. Clones share that state, so a test
//! can hand a clone to the orchestrator and inspect the original.
//!
//! Readiness is scripted: tasks of a newly created task set report
//! `PROVISIONING` for `polls_until_running` polls and `RUNNING` after;
//! their registry instances report `UNHEALTHY` for `polls_until_healthy`
//! polls and `HEALTHY` after. Resources added through the `with_*`
//! builders are already settled and are not recorded as mutations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use meshflip_core::naming::{external_id, mesh_node_name, qualified_node_path};
use meshflip_core::{DeploymentSpec, NetworkConfig};

use crate::platform::*;

const TASK_PROVISIONING: &str = "PROVISIONING";
const TASK_SET_PRIMARY: &str = "PRIMARY";
const TASK_SET_ACTIVE: &str = "ACTIVE";

/// A state-changing call made through one of the platform traits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CreateService(String),
    RegisterTaskDefinition(String),
    CreateTaskSet(String),
    PromoteTaskSet(String),
    DeleteTaskSet(String),
    CreateMeshNode(String),
    DeleteMeshNode(String),
    UpdateRoute(String),
    PutParameter(String),
}

struct TaskState {
    arn: String,
    cluster: String,
    service_name: String,
    task_set_arn: String,
    task_definition_arn: String,
    polls_left: u32,
}

struct InstanceState {
    service_id: String,
    task_arn: String,
    polls_left: u32,
}

struct State {
    services: BTreeMap<(String, String), ComputeService>,
    task_definitions: Vec<TaskDefinition>,
    tasks: Vec<TaskState>,
    nodes: BTreeMap<(String, String), MeshNodeSpec>,
    routes: BTreeMap<(String, String, String), Route>,
    namespaces: Vec<Namespace>,
    discovery_services: Vec<(String, DiscoveryService)>,
    instances: BTreeMap<String, InstanceState>,
    parameters: BTreeMap<String, String>,
    created_services: Vec<CreateServiceRequest>,
    created_task_sets: Vec<CreateTaskSetRequest>,
    mutations: Vec<Mutation>,
    polls_until_running: u32,
    polls_until_healthy: u32,
    instance_failures: u32,
    failing_task_set_deletes: BTreeSet<String>,
    failing_node_deletes: BTreeSet<String>,
    next_id: u64,
}

impl State {
    fn new() -> Self {
        Self {
            services: BTreeMap::new(),
            task_definitions: Vec::new(),
            tasks: Vec::new(),
            nodes: BTreeMap::new(),
            routes: BTreeMap::new(),
            namespaces: Vec::new(),
            discovery_services: Vec::new(),
            instances: BTreeMap::new(),
            parameters: BTreeMap::new(),
            created_services: Vec::new(),
            created_task_sets: Vec::new(),
            mutations: Vec::new(),
            polls_until_running: 1,
            polls_until_healthy: 1,
            instance_failures: 0,
            failing_task_set_deletes: BTreeSet::new(),
            failing_node_deletes: BTreeSet::new(),
            next_id: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn register(&mut self, input: TaskDefinitionInput) -> TaskDefinition {
        let revision = self
            .task_definitions
            .iter()
            .filter(|d| d.input.family == input.family)
            .count() as u32
            + 1;
        let definition = TaskDefinition {
            arn: format!("arn:meshflip:task-definition/{}:{revision}", input.family),
            revision,
            status: "ACTIVE".to_string(),
            compatibilities: vec!["EC2".to_string(), "FARGATE".to_string()],
            requires_attributes: Vec::new(),
            input,
        };
        self.task_definitions.push(definition.clone());
        definition
    }

    fn latest_revision(&self, family: &str) -> Option<&TaskDefinition> {
        self.task_definitions
            .iter()
            .rev()
            .find(|d| d.input.family == family)
    }

    fn discovery_service_by_arn(&self, arn: &str) -> Option<&DiscoveryService> {
        self.discovery_services
            .iter()
            .map(|(_, s)| s)
            .find(|s| s.arn == arn)
    }

    fn insert_service(
        &mut self,
        cluster: &str,
        name: &str,
        desired_count: u32,
        network: Option<NetworkConfig>,
    ) {
        let service = ComputeService {
            arn: format!("arn:meshflip:service/{cluster}/{name}"),
            name: name.to_string(),
            status: SERVICE_ACTIVE.to_string(),
            desired_count,
            network,
            deployment_controller: DeploymentController::External,
            task_sets: Vec::new(),
        };
        self.services
            .insert((cluster.to_string(), name.to_string()), service);
    }

    /// Add a task set with one task and one registry instance per desired
    /// task. `pending` tasks and instances go through the scripted
    /// readiness sequence.
    #[allow(clippy::too_many_arguments)]
    fn add_task_set(
        &mut self,
        cluster: &str,
        service_name: &str,
        external_id: String,
        task_definition: String,
        registry_arn: Option<&str>,
        tags: BTreeMap<String, String>,
        pending: bool,
    ) -> Option<TaskSet> {
        let id = self.next_id();
        let key = (cluster.to_string(), service_name.to_string());
        let desired = self.services.get(&key)?.desired_count.max(1);

        let task_set = TaskSet {
            arn: format!("arn:meshflip:task-set/{cluster}/{service_name}/ts-{id}"),
            external_id: Some(external_id),
            task_definition: task_definition.clone(),
            status: TASK_SET_ACTIVE.to_string(),
            tags,
        };

        let service_id = registry_arn
            .and_then(|arn| self.discovery_service_by_arn(arn))
            .map(|s| s.id.clone());
        let (task_polls, instance_polls) = if pending {
            (self.polls_until_running, self.polls_until_healthy)
        } else {
            (0, 0)
        };

        for n in 0..desired {
            let task_arn = format!("arn:meshflip:task/{cluster}/{id}-{n}");
            if let Some(service_id) = &service_id {
                self.instances.insert(
                    format!("inst-{id}-{n}"),
                    InstanceState {
                        service_id: service_id.clone(),
                        task_arn: task_arn.clone(),
                        polls_left: instance_polls,
                    },
                );
            }
            self.tasks.push(TaskState {
                arn: task_arn,
                cluster: cluster.to_string(),
                service_name: service_name.to_string(),
                task_set_arn: task_set.arn.clone(),
                task_definition_arn: task_definition.clone(),
                polls_left: task_polls,
            });
        }

        self.services.get_mut(&key)?.task_sets.push(task_set.clone());
        Some(task_set)
    }

    fn registry_arn_for(&self, spec: &DeploymentSpec) -> Option<String> {
        let namespace = self
            .namespaces
            .iter()
            .find(|n| n.name == spec.namespace_name)?;
        self.discovery_services
            .iter()
            .find(|(ns, s)| ns == &namespace.id && s.name == spec.service_name)
            .map(|(_, s)| s.arn.clone())
    }
}

#[derive(Clone)]
pub struct InMemoryPlatform {
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("platform state lock")
    }

    /// A platform with everything `spec` names except the compute
    /// service: the namespace and discovery service, one task definition
    /// revision, and a mesh node created at `live_since` that receives all
    /// traffic on the route.
    pub fn seeded(spec: &DeploymentSpec, live_since: DateTime<Utc>) -> Self {
        let platform = Self::new();
        let live = mesh_node_name(&spec.service_name, live_since);
        {
            let mut state = platform.state();

            let namespace = Namespace {
                id: "ns-1".to_string(),
                name: spec.namespace_name.clone(),
            };
            state.discovery_services.push((
                namespace.id.clone(),
                DiscoveryService {
                    id: "srv-1".to_string(),
                    arn: "arn:meshflip:discovery/srv-1".to_string(),
                    name: spec.service_name.clone(),
                },
            ));
            state.namespaces.push(namespace);

            let input = TaskDefinitionInput {
                family: spec.task_definition_family.clone(),
                container_definitions: vec![
                    ContainerDefinition {
                        name: "app".to_string(),
                        image: format!("{}:latest", spec.service_name),
                        environment: Vec::new(),
                        extra: serde_json::Map::from_iter([(
                            "portMappings".to_string(),
                            serde_json::json!([{ "containerPort": spec.port }]),
                        )]),
                    },
                    ContainerDefinition {
                        name: spec.sidecar.container_name.clone(),
                        image: "envoy:v1.27".to_string(),
                        environment: vec![EnvVar {
                            name: spec.sidecar.node_env_var.clone(),
                            value: qualified_node_path(&spec.mesh_name, &live),
                        }],
                        extra: serde_json::Map::new(),
                    },
                ],
                extra: serde_json::Map::from_iter([
                    ("cpu".to_string(), serde_json::json!("256")),
                    ("memory".to_string(), serde_json::json!("512")),
                ]),
            };
            state.register(input);

            let route = Route {
                mesh_name: spec.mesh_name.clone(),
                router_name: spec.virtual_router_name.clone(),
                route_name: spec.route_name.clone(),
                spec: RouteSpec {
                    priority: Some(1),
                    route_match: Some(RouteMatch {
                        service_name: Some(spec.service_name.clone()),
                        method_name: None,
                    }),
                    weighted_targets: vec![WeightedTarget {
                        node: live.clone(),
                        weight: 1,
                    }],
                },
            };
            state.routes.insert(
                (
                    spec.mesh_name.clone(),
                    spec.virtual_router_name.clone(),
                    spec.route_name.clone(),
                ),
                route,
            );
        }
        platform.with_mesh_node(spec, &live)
    }

    /// Add an active compute service for `spec` whose primary task set
    /// serves the node currently on the route. Discovered placement gets a
    /// single placeholder subnet.
    pub fn with_active_service(self, spec: &DeploymentSpec) -> Self {
        {
            let mut state = self.state();
            let network = spec.static_network().unwrap_or_else(|| NetworkConfig {
                subnets: vec!["subnet-0".to_string()],
                security_groups: vec!["sg-0".to_string()],
            });
            state.insert_service(
                &spec.cluster_name,
                &spec.compute_service_name,
                network.subnets.len() as u32,
                Some(network),
            );

            let live = state
                .routes
                .get(&(
                    spec.mesh_name.clone(),
                    spec.virtual_router_name.clone(),
                    spec.route_name.clone(),
                ))
                .and_then(|r| r.live_targets().next().map(|t| t.node.clone()));
            let definition = state
                .latest_revision(&spec.task_definition_family)
                .map(|d| d.arn.clone());
            if let (Some(live), Some(definition)) = (live, definition) {
                let registry = state.registry_arn_for(spec);
                let created = state.add_task_set(
                    &spec.cluster_name,
                    &spec.compute_service_name,
                    external_id(&live),
                    definition,
                    registry.as_deref(),
                    BTreeMap::from([(MESH_NODE_TAG.to_string(), live)]),
                    false,
                );
                if let Some(created) = created {
                    promote(&mut state, &spec.cluster_name, &spec.compute_service_name, &created.arn);
                }
            }
        }
        self
    }

    pub fn with_mesh_node(self, spec: &DeploymentSpec, name: &str) -> Self {
        {
            let mut state = self.state();
            let node_spec = MeshNodeSpec {
                mesh_name: spec.mesh_name.clone(),
                node_name: name.to_string(),
                discovery: DiscoveryBinding {
                    namespace_name: spec.namespace_name.clone(),
                    service_name: spec.service_name.clone(),
                    attributes: BTreeMap::from([(
                        TASK_SET_EXTERNAL_ID_ATTRIBUTE.to_string(),
                        external_id(name),
                    )]),
                },
                listeners: Vec::new(),
                tags: BTreeMap::new(),
            };
            insert_node(&mut state, node_spec);
        }
        self
    }

    /// Add a settled task set serving `node`. Untagged task sets get their
    /// own task revision whose sidecar names the node.
    pub fn with_task_set(self, spec: &DeploymentSpec, node: &str, tagged: bool) -> Self {
        self.add_task_set_for(spec, node, tagged, false);
        self
    }

    /// Add a tagged task set serving `node` whose tasks and instances are
    /// still converging.
    pub fn with_pending_task_set(self, spec: &DeploymentSpec, node: &str) -> Self {
        self.add_task_set_for(spec, node, true, true);
        self
    }

    fn add_task_set_for(&self, spec: &DeploymentSpec, node: &str, tagged: bool, pending: bool) {
        let mut state = self.state();
        let key = (spec.cluster_name.clone(), spec.compute_service_name.clone());
        if !state.services.contains_key(&key) {
            let network = spec.static_network();
            let desired = network.as_ref().map_or(1, |n| n.subnets.len() as u32);
            state.insert_service(&spec.cluster_name, &spec.compute_service_name, desired, network);
        }

        let Some(latest) = state.latest_revision(&spec.task_definition_family).cloned() else {
            return;
        };
        let (definition, tags) = if tagged {
            (
                latest.arn,
                BTreeMap::from([(MESH_NODE_TAG.to_string(), node.to_string())]),
            )
        } else {
            let mut input = latest.into_input();
            if let Some(sidecar) = input.container_mut(&spec.sidecar.container_name) {
                sidecar.replace_env(
                    &spec.sidecar.node_env_var,
                    qualified_node_path(&spec.mesh_name, node),
                );
            }
            (state.register(input).arn, BTreeMap::new())
        };

        let registry = state.registry_arn_for(spec);
        state.add_task_set(
            &spec.cluster_name,
            &spec.compute_service_name,
            external_id(node),
            definition,
            registry.as_deref(),
            tags,
            pending,
        );
    }

    pub fn with_route_targets(self, spec: &DeploymentSpec, targets: &[(&str, u32)]) -> Self {
        {
            let mut state = self.state();
            let key = (
                spec.mesh_name.clone(),
                spec.virtual_router_name.clone(),
                spec.route_name.clone(),
            );
            if let Some(route) = state.routes.get_mut(&key) {
                route.spec.weighted_targets = targets
                    .iter()
                    .map(|(node, weight)| WeightedTarget {
                        node: node.to_string(),
                        weight: *weight,
                    })
                    .collect();
            }
        }
        self
    }

    pub fn with_polls_until_running(self, polls: u32) -> Self {
        self.state().polls_until_running = polls;
        self
    }

    pub fn with_polls_until_healthy(self, polls: u32) -> Self {
        self.state().polls_until_healthy = polls;
        self
    }

    pub fn set_service_status(&self, cluster: &str, service: &str, status: &str) {
        if let Some(s) = self
            .state()
            .services
            .get_mut(&(cluster.to_string(), service.to_string()))
        {
            s.status = status.to_string();
        }
    }

    /// Register another revision of `family`, copied from its latest
    /// revision or, for a new family, from the first registered one.
    pub fn register_family_revision(&self, family: &str) {
        let mut state = self.state();
        let template = state
            .latest_revision(family)
            .or_else(|| state.task_definitions.first())
            .map(|d| d.input.clone());
        let mut input = template.unwrap_or_else(|| TaskDefinitionInput {
            family: family.to_string(),
            container_definitions: Vec::new(),
            extra: serde_json::Map::new(),
        });
        input.family = family.to_string();
        state.register(input);
    }

    /// Fail the next `times` instance health queries.
    pub fn fail_instance_health(&self, times: u32) {
        self.state().instance_failures = times;
    }

    pub fn fail_task_set_delete(&self, arn: &str) {
        self.state().failing_task_set_deletes.insert(arn.to_string());
    }

    pub fn fail_node_delete(&self, node: &str) {
        self.state().failing_node_deletes.insert(node.to_string());
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state().mutations.clone()
    }

    pub fn created_services(&self) -> Vec<CreateServiceRequest> {
        self.state().created_services.clone()
    }

    pub fn created_task_sets(&self) -> Vec<CreateTaskSetRequest> {
        self.state().created_task_sets.clone()
    }

    /// Node names in `mesh`, sorted.
    pub fn mesh_nodes(&self, mesh: &str) -> Vec<String> {
        self.state()
            .nodes
            .keys()
            .filter(|(m, _)| m == mesh)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn mesh_node_spec(&self, mesh: &str, node: &str) -> Option<MeshNodeSpec> {
        self.state()
            .nodes
            .get(&(mesh.to_string(), node.to_string()))
            .cloned()
    }

    pub fn route(&self, spec: &DeploymentSpec) -> Option<Route> {
        self.state()
            .routes
            .get(&(
                spec.mesh_name.clone(),
                spec.virtual_router_name.clone(),
                spec.route_name.clone(),
            ))
            .cloned()
    }

    pub fn service(&self, spec: &DeploymentSpec) -> Option<ComputeService> {
        self.state()
            .services
            .get(&(spec.cluster_name.clone(), spec.compute_service_name.clone()))
            .cloned()
    }

    pub fn task_sets(&self, spec: &DeploymentSpec) -> Vec<TaskSet> {
        self.service(spec).map(|s| s.task_sets).unwrap_or_default()
    }

    pub fn parameter(&self, name: &str) -> Option<String> {
        self.state().parameters.get(name).cloned()
    }

    pub fn discovery_service_id(&self, spec: &DeploymentSpec) -> Option<String> {
        let state = self.state();
        let arn = state.registry_arn_for(spec)?;
        state.discovery_service_by_arn(&arn).map(|s| s.id.clone())
    }
}

fn insert_node(state: &mut State, spec: MeshNodeSpec) -> MeshNode {
    let node = MeshNode {
        mesh_name: spec.mesh_name.clone(),
        name: spec.node_name.clone(),
        arn: format!(
            "arn:meshflip:mesh/{}/virtualNode/{}",
            spec.mesh_name, spec.node_name
        ),
        tags: spec.tags.clone(),
    };
    state
        .nodes
        .insert((spec.mesh_name.clone(), spec.node_name.clone()), spec);
    node
}

/// Mark `arn` primary and demote every other task set of the service.
fn promote(state: &mut State, cluster: &str, service: &str, arn: &str) -> Option<TaskSet> {
    let service = state
        .services
        .get_mut(&(cluster.to_string(), service.to_string()))?;
    let mut promoted = None;
    for task_set in &mut service.task_sets {
        if task_set.arn == arn {
            task_set.status = TASK_SET_PRIMARY.to_string();
            promoted = Some(task_set.clone());
        } else {
            task_set.status = TASK_SET_ACTIVE.to_string();
        }
    }
    promoted
}

#[async_trait]
impl ComputePlatform for InMemoryPlatform {
    async fn describe_service(
        &self,
        cluster: &str,
        service: &str,
    ) -> PlatformResult<Option<ComputeService>> {
        Ok(self
            .state()
            .services
            .get(&(cluster.to_string(), service.to_string()))
            .cloned())
    }

    async fn create_service(&self, request: &CreateServiceRequest) -> PlatformResult<ComputeService> {
        let mut state = self.state();
        let key = (request.cluster.clone(), request.service_name.clone());
        if state.services.get(&key).is_some_and(ComputeService::is_active) {
            return Err(PlatformError::new(
                "create_service",
                format!("service '{}' is already active", request.service_name),
            ));
        }

        state.insert_service(
            &request.cluster,
            &request.service_name,
            request.desired_count,
            request.network.clone(),
        );
        let service = state.services.get_mut(&key).map(|s| {
            s.deployment_controller = request.deployment_controller;
            s.clone()
        });
        let service = service
            .ok_or_else(|| PlatformError::new("create_service", "service vanished"))?;

        state.created_services.push(request.clone());
        state
            .mutations
            .push(Mutation::CreateService(service.arn.clone()));
        Ok(service)
    }

    async fn list_task_definitions(
        &self,
        family_prefix: &str,
    ) -> PlatformResult<Vec<TaskDefinitionRef>> {
        Ok(self
            .state()
            .task_definitions
            .iter()
            .filter(|d| d.input.family.starts_with(family_prefix))
            .map(|d| TaskDefinitionRef {
                arn: d.arn.clone(),
                family: d.input.family.clone(),
                revision: d.revision,
            })
            .collect())
    }

    async fn describe_task_definition(&self, arn: &str) -> PlatformResult<TaskDefinition> {
        self.state()
            .task_definitions
            .iter()
            .find(|d| d.arn == arn)
            .cloned()
            .ok_or_else(|| {
                PlatformError::new("describe_task_definition", format!("unknown task definition '{arn}'"))
            })
    }

    async fn register_task_definition(
        &self,
        input: &TaskDefinitionInput,
    ) -> PlatformResult<TaskDefinition> {
        let mut state = self.state();
        let definition = state.register(input.clone());
        state
            .mutations
            .push(Mutation::RegisterTaskDefinition(definition.arn.clone()));
        Ok(definition)
    }

    async fn create_task_set(&self, request: &CreateTaskSetRequest) -> PlatformResult<TaskSet> {
        let mut state = self.state();
        let service_name = state
            .services
            .iter()
            .find(|((cluster, _), s)| cluster == &request.cluster && s.arn == request.service)
            .map(|(_, s)| s.name.clone())
            .ok_or_else(|| {
                PlatformError::new("create_task_set", format!("unknown service '{}'", request.service))
            })?;
        if state.discovery_service_by_arn(&request.registry_arn).is_none() {
            return Err(PlatformError::new(
                "create_task_set",
                format!("unknown service registry '{}'", request.registry_arn),
            ));
        }

        let task_set = state
            .add_task_set(
                &request.cluster,
                &service_name,
                request.external_id.clone(),
                request.task_definition.clone(),
                Some(&request.registry_arn),
                request.tags.clone(),
                true,
            )
            .ok_or_else(|| PlatformError::new("create_task_set", "service vanished"))?;

        state.created_task_sets.push(request.clone());
        state
            .mutations
            .push(Mutation::CreateTaskSet(task_set.arn.clone()));
        Ok(task_set)
    }

    async fn update_primary_task_set(
        &self,
        cluster: &str,
        service: &str,
        task_set_arn: &str,
    ) -> PlatformResult<TaskSet> {
        let mut state = self.state();
        let promoted = promote(&mut state, cluster, service, task_set_arn).ok_or_else(|| {
            PlatformError::new(
                "update_primary_task_set",
                format!("unknown task set '{task_set_arn}'"),
            )
        })?;
        state
            .mutations
            .push(Mutation::PromoteTaskSet(task_set_arn.to_string()));
        Ok(promoted)
    }

    async fn delete_task_set(
        &self,
        cluster: &str,
        service: &str,
        task_set_arn: &str,
    ) -> PlatformResult<()> {
        let mut state = self.state();
        if state.failing_task_set_deletes.contains(task_set_arn) {
            return Err(PlatformError::new("delete_task_set", "injected failure"));
        }

        let owner = state
            .services
            .get_mut(&(cluster.to_string(), service.to_string()))
            .ok_or_else(|| {
                PlatformError::new("delete_task_set", format!("unknown service '{service}'"))
            })?;
        let before = owner.task_sets.len();
        owner.task_sets.retain(|ts| ts.arn != task_set_arn);
        if owner.task_sets.len() == before {
            return Err(PlatformError::new(
                "delete_task_set",
                format!("unknown task set '{task_set_arn}'"),
            ));
        }

        let gone: BTreeSet<String> = state
            .tasks
            .iter()
            .filter(|t| t.task_set_arn == task_set_arn)
            .map(|t| t.arn.clone())
            .collect();
        state.tasks.retain(|t| !gone.contains(&t.arn));
        state.instances.retain(|_, i| !gone.contains(&i.task_arn));
        state
            .mutations
            .push(Mutation::DeleteTaskSet(task_set_arn.to_string()));
        Ok(())
    }

    async fn list_tasks(&self, cluster: &str, service: &str) -> PlatformResult<Vec<String>> {
        Ok(self
            .state()
            .tasks
            .iter()
            .filter(|t| t.cluster == cluster && t.service_name == service)
            .map(|t| t.arn.clone())
            .collect())
    }

    async fn describe_tasks(&self, cluster: &str, task_arns: &[String]) -> PlatformResult<Vec<Task>> {
        let mut state = self.state();
        let mut tasks = Vec::new();
        for task in state
            .tasks
            .iter_mut()
            .filter(|t| t.cluster == cluster && task_arns.contains(&t.arn))
        {
            let last_status = if task.polls_left > 0 {
                task.polls_left -= 1;
                TASK_PROVISIONING
            } else {
                TASK_RUNNING
            };
            tasks.push(Task {
                arn: task.arn.clone(),
                task_definition_arn: task.task_definition_arn.clone(),
                last_status: last_status.to_string(),
            });
        }
        Ok(tasks)
    }
}

#[async_trait]
impl MeshControlPlane for InMemoryPlatform {
    async fn list_mesh_nodes(&self, mesh: &str) -> PlatformResult<Vec<String>> {
        Ok(self.mesh_nodes(mesh))
    }

    async fn create_mesh_node(&self, spec: &MeshNodeSpec) -> PlatformResult<MeshNode> {
        let mut state = self.state();
        let key = (spec.mesh_name.clone(), spec.node_name.clone());
        if state.nodes.contains_key(&key) {
            return Err(PlatformError::new(
                "create_mesh_node",
                format!("node '{}' already exists", spec.node_name),
            ));
        }
        let node = insert_node(&mut state, spec.clone());
        state
            .mutations
            .push(Mutation::CreateMeshNode(node.name.clone()));
        Ok(node)
    }

    async fn delete_mesh_node(&self, mesh: &str, node: &str) -> PlatformResult<()> {
        let mut state = self.state();
        if state.failing_node_deletes.contains(node) {
            return Err(PlatformError::new("delete_mesh_node", "injected failure"));
        }
        let referenced = state
            .routes
            .values()
            .filter(|r| r.mesh_name == mesh)
            .any(|r| r.live_targets().any(|t| t.node == node));
        if referenced {
            return Err(PlatformError::new(
                "delete_mesh_node",
                format!("node '{node}' is still a route target"),
            ));
        }
        state
            .nodes
            .remove(&(mesh.to_string(), node.to_string()))
            .ok_or_else(|| PlatformError::new("delete_mesh_node", format!("unknown node '{node}'")))?;
        state
            .mutations
            .push(Mutation::DeleteMeshNode(node.to_string()));
        Ok(())
    }

    async fn describe_route(
        &self,
        mesh: &str,
        router: &str,
        route: &str,
    ) -> PlatformResult<Option<Route>> {
        Ok(self
            .state()
            .routes
            .get(&(mesh.to_string(), router.to_string(), route.to_string()))
            .cloned())
    }

    async fn update_route(&self, route: &Route) -> PlatformResult<Route> {
        let mut state = self.state();
        for target in &route.spec.weighted_targets {
            if !state
                .nodes
                .contains_key(&(route.mesh_name.clone(), target.node.clone()))
            {
                return Err(PlatformError::new(
                    "update_route",
                    format!("unknown target node '{}'", target.node),
                ));
            }
        }
        let key = (
            route.mesh_name.clone(),
            route.router_name.clone(),
            route.route_name.clone(),
        );
        let slot = state.routes.get_mut(&key).ok_or_else(|| {
            PlatformError::new("update_route", format!("unknown route '{}'", route.route_name))
        })?;
        *slot = route.clone();
        state
            .mutations
            .push(Mutation::UpdateRoute(route.route_name.clone()));
        Ok(route.clone())
    }
}

#[async_trait]
impl DiscoveryRegistry for InMemoryPlatform {
    async fn list_namespaces(&self) -> PlatformResult<Vec<Namespace>> {
        Ok(self.state().namespaces.clone())
    }

    async fn list_services(&self, namespace_id: &str) -> PlatformResult<Vec<DiscoveryService>> {
        Ok(self
            .state()
            .discovery_services
            .iter()
            .filter(|(ns, _)| ns == namespace_id)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn instances_health(
        &self,
        service_id: &str,
    ) -> PlatformResult<BTreeMap<String, InstanceHealth>> {
        let mut state = self.state();
        if state.instance_failures > 0 {
            state.instance_failures -= 1;
            return Err(PlatformError::new("instances_health", "throttled"));
        }

        let mut health = BTreeMap::new();
        for (id, instance) in state
            .instances
            .iter_mut()
            .filter(|(_, i)| i.service_id == service_id)
        {
            let status = if instance.polls_left > 0 {
                instance.polls_left -= 1;
                InstanceHealth::Unhealthy
            } else {
                InstanceHealth::Healthy
            };
            health.insert(id.clone(), status);
        }
        Ok(health)
    }
}

#[async_trait]
impl ParameterStore for InMemoryPlatform {
    async fn put_parameter(&self, name: &str, value: &str) -> PlatformResult<()> {
        let mut state = self.state();
        state.parameters.insert(name.to_string(), value.to_string());
        state.mutations.push(Mutation::PutParameter(name.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{at, test_spec};

    #[tokio::test]
    async fn seeded_route_targets_live_node() {
        let spec = test_spec();
        let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0));

        let route = platform.route(&spec).unwrap();
        let live: Vec<_> = route.live_targets().map(|t| t.node.clone()).collect();
        assert_eq!(live, vec!["echo_server-20230101000000"]);
        assert_eq!(platform.mesh_nodes(&spec.mesh_name), live);
        assert!(platform.service(&spec).is_none());
    }

    #[tokio::test]
    async fn referenced_node_cannot_be_deleted() {
        let spec = test_spec();
        let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0));

        let err = platform
            .delete_mesh_node(&spec.mesh_name, "echo_server-20230101000000")
            .await
            .unwrap_err();
        assert!(err.message.contains("route target"));
    }

    #[tokio::test]
    async fn promotion_keeps_single_primary() {
        let spec = test_spec();
        let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0))
            .with_active_service(&spec)
            .with_task_set(&spec, "echo_server-20230101000100", true);
        let newest = platform.task_sets(&spec).pop().unwrap();

        platform
            .update_primary_task_set(&spec.cluster_name, &spec.compute_service_name, &newest.arn)
            .await
            .unwrap();

        let primaries: Vec<_> = platform
            .task_sets(&spec)
            .into_iter()
            .filter(|ts| ts.status == "PRIMARY")
            .map(|ts| ts.arn)
            .collect();
        assert_eq!(primaries, vec![newest.arn]);
    }

    #[tokio::test]
    async fn deleting_task_set_removes_its_tasks() {
        let spec = test_spec();
        let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0))
            .with_active_service(&spec)
            .with_task_set(&spec, "echo_server-20230101000100", true);
        let stale = platform.task_sets(&spec).pop().unwrap();
        assert_eq!(
            platform.list_tasks(&spec.cluster_name, &spec.compute_service_name).await.unwrap().len(),
            4
        );

        platform
            .delete_task_set(&spec.cluster_name, &spec.compute_service_name, &stale.arn)
            .await
            .unwrap();
        assert_eq!(
            platform.list_tasks(&spec.cluster_name, &spec.compute_service_name).await.unwrap().len(),
            2
        );
    }
}
