//! [`ComputePlatform`] on Amazon ECS.
//!
//! Task definitions are re-registered from the raw SDK shape of the
//! revision they were described from. Only container environments (and
//! images) come from the [`TaskDefinitionInput`]; every other field is
//! carried over as ECS returned it, so nothing meshflip does not model is
//! lost between revisions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_sdk_ecs::Client;
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, ContainerDefinition as SdkContainer,
    DeploymentConfiguration, DeploymentController as SdkController, DeploymentControllerType,
    KeyValuePair, LaunchType, NetworkConfiguration, Scale, ScaleUnit,
    SchedulingStrategy as SdkScheduling, Service, ServiceRegistry, SortOrder, Tag,
    TaskDefinition as SdkTaskDefinition, TaskSet as SdkTaskSet, TaskSetField,
};
use tracing::debug;

use meshflip_core::NetworkConfig;
use meshflip_deploy::platform::{
    ComputePlatform, ComputeService, ContainerDefinition, CreateServiceRequest,
    CreateTaskSetRequest, DeploymentController, EnvVar, PlatformResult, SchedulingStrategy, Task,
    TaskDefinition, TaskDefinitionInput, TaskDefinitionRef, TaskSet,
};

use crate::error::{missing, non_empty, sdk_error, to_i32, to_u32};

/// DescribeTasks accepts at most this many task ARNs per call.
const DESCRIBE_TASKS_BATCH: usize = 100;

/// Task set status of the set currently taking the service's traffic.
const PRIMARY_STATUS: &str = "PRIMARY";

#[derive(Clone)]
pub struct EcsCompute {
    client: Client,
    /// Last described revision per family, in SDK shape.
    described: Arc<Mutex<HashMap<String, SdkTaskDefinition>>>,
}

impl EcsCompute {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            described: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn remember(&self, def: &SdkTaskDefinition) {
        if let Some(family) = def.family() {
            self.described
                .lock()
                .expect("task definition cache lock")
                .insert(family.to_string(), def.clone());
        }
    }

    fn cached(&self, family: &str) -> Option<SdkTaskDefinition> {
        self.described
            .lock()
            .expect("task definition cache lock")
            .get(family)
            .cloned()
    }

    async fn describe_raw(&self, reference: &str) -> PlatformResult<SdkTaskDefinition> {
        let out = self
            .client
            .describe_task_definition()
            .task_definition(reference)
            .send()
            .await
            .map_err(sdk_error("describe_task_definition"))?;
        let def = out
            .task_definition()
            .ok_or_else(|| missing("describe_task_definition", "task definition"))?;
        self.remember(def);
        Ok(def.clone())
    }

    async fn tagged_task_sets(
        &self,
        cluster: &str,
        service_arn: &str,
    ) -> PlatformResult<Vec<SdkTaskSet>> {
        let out = self
            .client
            .describe_task_sets()
            .cluster(cluster)
            .service(service_arn)
            .include(TaskSetField::Tags)
            .send()
            .await
            .map_err(sdk_error("describe_task_sets"))?;
        Ok(out.task_sets().to_vec())
    }
}

#[async_trait]
impl ComputePlatform for EcsCompute {
    async fn describe_service(
        &self,
        cluster: &str,
        service: &str,
    ) -> PlatformResult<Option<ComputeService>> {
        let out = self
            .client
            .describe_services()
            .cluster(cluster)
            .services(service)
            .send()
            .await
            .map_err(sdk_error("describe_services"))?;
        let Some(found) = out.services().first() else {
            debug!(cluster, service, failures = out.failures().len(), "service not found");
            return Ok(None);
        };

        // DescribeServices omits task set tags; mesh node ownership lives there.
        let task_sets = match (controller_from_sdk(found), found.service_arn()) {
            (DeploymentController::External, Some(arn)) => {
                self.tagged_task_sets(cluster, arn).await?
            }
            _ => found.task_sets().to_vec(),
        };
        Ok(Some(service_from_sdk(found, &task_sets)))
    }

    async fn create_service(&self, request: &CreateServiceRequest) -> PlatformResult<ComputeService> {
        let controller = SdkController::builder()
            .r#type(match request.deployment_controller {
                DeploymentController::Platform => DeploymentControllerType::Ecs,
                DeploymentController::External => DeploymentControllerType::External,
            })
            .build()
            .map_err(sdk_error("create_service"))?;
        let mut call = self
            .client
            .create_service()
            .cluster(&request.cluster)
            .service_name(&request.service_name)
            .desired_count(to_i32(request.desired_count))
            .deployment_configuration(
                DeploymentConfiguration::builder()
                    .maximum_percent(to_i32(request.maximum_percent))
                    .minimum_healthy_percent(to_i32(request.minimum_healthy_percent))
                    .build(),
            )
            .scheduling_strategy(match request.scheduling_strategy {
                SchedulingStrategy::Replica => SdkScheduling::Replica,
                SchedulingStrategy::Daemon => SdkScheduling::Daemon,
            })
            .deployment_controller(controller);

        // Under an external controller the network belongs to each task set.
        match (&request.network, request.deployment_controller) {
            (Some(network), DeploymentController::Platform) => {
                call = call.network_configuration(network_to_sdk(network, false)?);
            }
            (Some(_), DeploymentController::External) => {
                debug!(service = %request.service_name, "network left to task sets");
            }
            (None, _) => {}
        }

        let out = call.send().await.map_err(sdk_error("create_service"))?;
        let created = out
            .service()
            .ok_or_else(|| missing("create_service", "service"))?;
        Ok(service_from_sdk(created, created.task_sets()))
    }

    async fn list_task_definitions(
        &self,
        family_prefix: &str,
    ) -> PlatformResult<Vec<TaskDefinitionRef>> {
        let mut refs = Vec::new();
        let mut token = None;
        loop {
            let out = self
                .client
                .list_task_definitions()
                .family_prefix(family_prefix)
                .sort(SortOrder::Asc)
                .set_next_token(token)
                .send()
                .await
                .map_err(sdk_error("list_task_definitions"))?;
            refs.extend(
                out.task_definition_arns()
                    .iter()
                    .filter_map(|arn| parse_task_definition_arn(arn))
                    .filter(|r| r.family.starts_with(family_prefix)),
            );
            token = out.next_token().map(str::to_string);
            if token.is_none() {
                return Ok(refs);
            }
        }
    }

    async fn describe_task_definition(&self, arn: &str) -> PlatformResult<TaskDefinition> {
        let def = self.describe_raw(arn).await?;
        Ok(task_definition_from_sdk(&def))
    }

    async fn register_task_definition(
        &self,
        input: &TaskDefinitionInput,
    ) -> PlatformResult<TaskDefinition> {
        let template = match self.cached(&input.family) {
            Some(def) => def,
            // Latest active revision of the family.
            None => self.describe_raw(&input.family).await?,
        };
        let containers: Vec<SdkContainer> = template
            .container_definitions()
            .iter()
            .filter_map(|c| merge_container(c, input))
            .collect();

        let out = self
            .client
            .register_task_definition()
            .family(&input.family)
            .set_container_definitions(Some(containers))
            .set_task_role_arn(template.task_role_arn().map(str::to_string))
            .set_execution_role_arn(template.execution_role_arn().map(str::to_string))
            .set_network_mode(template.network_mode().cloned())
            .set_volumes(non_empty(template.volumes().to_vec()))
            .set_placement_constraints(non_empty(template.placement_constraints().to_vec()))
            .set_requires_compatibilities(non_empty(template.requires_compatibilities().to_vec()))
            .set_cpu(template.cpu().map(str::to_string))
            .set_memory(template.memory().map(str::to_string))
            .set_pid_mode(template.pid_mode().cloned())
            .set_ipc_mode(template.ipc_mode().cloned())
            .set_proxy_configuration(template.proxy_configuration().cloned())
            .set_inference_accelerators(non_empty(template.inference_accelerators().to_vec()))
            .set_ephemeral_storage(template.ephemeral_storage().cloned())
            .set_runtime_platform(template.runtime_platform().cloned())
            .send()
            .await
            .map_err(sdk_error("register_task_definition"))?;
        let def = out
            .task_definition()
            .ok_or_else(|| missing("register_task_definition", "task definition"))?;
        self.remember(def);
        Ok(task_definition_from_sdk(def))
    }

    async fn create_task_set(&self, request: &CreateTaskSetRequest) -> PlatformResult<TaskSet> {
        let tags: Vec<Tag> = request
            .tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect();
        let out = self
            .client
            .create_task_set()
            .cluster(&request.cluster)
            .service(&request.service)
            .external_id(&request.external_id)
            .task_definition(&request.task_definition)
            .service_registries(
                ServiceRegistry::builder()
                    .registry_arn(&request.registry_arn)
                    .build(),
            )
            .scale(
                Scale::builder()
                    .unit(ScaleUnit::Percent)
                    .value(f64::from(request.scale_percent))
                    .build(),
            )
            .launch_type(LaunchType::from(request.launch_type.as_str()))
            .network_configuration(network_to_sdk(&request.network, request.assign_public_ip)?)
            .set_tags(non_empty(tags))
            .send()
            .await
            .map_err(sdk_error("create_task_set"))?;
        let created = out
            .task_set()
            .ok_or_else(|| missing("create_task_set", "task set"))?;

        let mut task_set = task_set_from_sdk(created);
        if task_set.tags.is_empty() {
            task_set.tags = request.tags.clone();
        }
        Ok(task_set)
    }

    async fn update_primary_task_set(
        &self,
        cluster: &str,
        service: &str,
        task_set_arn: &str,
    ) -> PlatformResult<TaskSet> {
        let out = self
            .client
            .update_service_primary_task_set()
            .cluster(cluster)
            .service(service)
            .primary_task_set(task_set_arn)
            .send()
            .await
            .map_err(sdk_error("update_service_primary_task_set"))?;
        out.task_set()
            .map(task_set_from_sdk)
            .ok_or_else(|| missing("update_service_primary_task_set", "task set"))
    }

    async fn delete_task_set(
        &self,
        cluster: &str,
        service: &str,
        task_set_arn: &str,
    ) -> PlatformResult<()> {
        self.client
            .delete_task_set()
            .cluster(cluster)
            .service(service)
            .task_set(task_set_arn)
            .send()
            .await
            .map_err(sdk_error("delete_task_set"))?;
        Ok(())
    }

    async fn list_tasks(&self, cluster: &str, service: &str) -> PlatformResult<Vec<String>> {
        let mut arns = Vec::new();
        let mut token = None;
        loop {
            let out = self
                .client
                .list_tasks()
                .cluster(cluster)
                .service_name(service)
                .set_next_token(token)
                .send()
                .await
                .map_err(sdk_error("list_tasks"))?;
            arns.extend(out.task_arns().iter().cloned());
            token = out.next_token().map(str::to_string);
            if token.is_none() {
                return Ok(arns);
            }
        }
    }

    async fn describe_tasks(&self, cluster: &str, task_arns: &[String]) -> PlatformResult<Vec<Task>> {
        let mut tasks = Vec::with_capacity(task_arns.len());
        for batch in task_arns.chunks(DESCRIBE_TASKS_BATCH) {
            let out = self
                .client
                .describe_tasks()
                .cluster(cluster)
                .set_tasks(Some(batch.to_vec()))
                .send()
                .await
                .map_err(sdk_error("describe_tasks"))?;
            tasks.extend(out.tasks().iter().map(|t| Task {
                arn: t.task_arn().unwrap_or_default().to_string(),
                task_definition_arn: t.task_definition_arn().unwrap_or_default().to_string(),
                last_status: t.last_status().unwrap_or_default().to_string(),
            }));
        }
        Ok(tasks)
    }
}

/// Split `arn:aws:ecs:<region>:<account>:task-definition/<family>:<revision>`.
pub(crate) fn parse_task_definition_arn(arn: &str) -> Option<TaskDefinitionRef> {
    let (_, tail) = arn.rsplit_once("task-definition/")?;
    let (family, revision) = tail.rsplit_once(':')?;
    Some(TaskDefinitionRef {
        arn: arn.to_string(),
        family: family.to_string(),
        revision: revision.parse().ok()?,
    })
}

fn controller_from_sdk(service: &Service) -> DeploymentController {
    match service.deployment_controller().map(|c| c.r#type()) {
        Some(DeploymentControllerType::External) => DeploymentController::External,
        _ => DeploymentController::Platform,
    }
}

fn service_from_sdk(service: &Service, task_sets: &[SdkTaskSet]) -> ComputeService {
    ComputeService {
        arn: service.service_arn().unwrap_or_default().to_string(),
        name: service.service_name().unwrap_or_default().to_string(),
        status: service.status().unwrap_or_default().to_string(),
        desired_count: to_u32(service.desired_count()),
        network: network_of_service(service, task_sets),
        deployment_controller: controller_from_sdk(service),
        task_sets: task_sets.iter().map(task_set_from_sdk).collect(),
    }
}

/// The service's own network, or its primary task set's when the service
/// has none (as with externally controlled services).
pub(crate) fn network_of_service(
    service: &Service,
    task_sets: &[SdkTaskSet],
) -> Option<NetworkConfig> {
    service
        .network_configuration()
        .or_else(|| {
            task_sets
                .iter()
                .find(|ts| ts.status() == Some(PRIMARY_STATUS))
                .and_then(|ts| ts.network_configuration())
        })
        .and_then(network_from_sdk)
}

fn network_from_sdk(network: &NetworkConfiguration) -> Option<NetworkConfig> {
    let vpc = network.awsvpc_configuration()?;
    Some(NetworkConfig {
        subnets: vpc.subnets().to_vec(),
        security_groups: vpc.security_groups().to_vec(),
    })
}

fn network_to_sdk(
    network: &NetworkConfig,
    assign_public_ip: bool,
) -> PlatformResult<NetworkConfiguration> {
    let vpc = AwsVpcConfiguration::builder()
        .set_subnets(Some(network.subnets.clone()))
        .set_security_groups(non_empty(network.security_groups.clone()))
        .assign_public_ip(if assign_public_ip {
            AssignPublicIp::Enabled
        } else {
            AssignPublicIp::Disabled
        })
        .build()
        .map_err(sdk_error("awsvpc_configuration"))?;
    Ok(NetworkConfiguration::builder()
        .awsvpc_configuration(vpc)
        .build())
}

fn task_set_from_sdk(ts: &SdkTaskSet) -> TaskSet {
    TaskSet {
        arn: ts.task_set_arn().unwrap_or_default().to_string(),
        external_id: ts.external_id().map(str::to_string),
        task_definition: ts.task_definition().unwrap_or_default().to_string(),
        status: ts.status().unwrap_or_default().to_string(),
        tags: ts
            .tags()
            .iter()
            .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
            .collect::<BTreeMap<_, _>>(),
    }
}

fn task_definition_from_sdk(def: &SdkTaskDefinition) -> TaskDefinition {
    let mut extra = serde_json::Map::new();
    if let Some(cpu) = def.cpu() {
        extra.insert("cpu".to_string(), cpu.into());
    }
    if let Some(memory) = def.memory() {
        extra.insert("memory".to_string(), memory.into());
    }
    if let Some(mode) = def.network_mode() {
        extra.insert("networkMode".to_string(), mode.as_str().into());
    }

    TaskDefinition {
        arn: def.task_definition_arn().unwrap_or_default().to_string(),
        revision: to_u32(def.revision()),
        status: def.status().map(|s| s.as_str().to_string()).unwrap_or_default(),
        compatibilities: def
            .compatibilities()
            .iter()
            .map(|c| c.as_str().to_string())
            .collect(),
        requires_attributes: def
            .requires_attributes()
            .iter()
            .map(|a| a.name().to_string())
            .collect(),
        input: TaskDefinitionInput {
            family: def.family().unwrap_or_default().to_string(),
            container_definitions: def.container_definitions().iter().map(container_from_sdk).collect(),
            extra,
        },
    }
}

fn container_from_sdk(container: &SdkContainer) -> ContainerDefinition {
    ContainerDefinition {
        name: container.name().unwrap_or_default().to_string(),
        image: container.image().unwrap_or_default().to_string(),
        environment: container
            .environment()
            .iter()
            .filter_map(|kv| {
                Some(EnvVar {
                    name: kv.name()?.to_string(),
                    value: kv.value().unwrap_or_default().to_string(),
                })
            })
            .collect(),
        extra: serde_json::Map::new(),
    }
}

/// The raw container with image and environment taken from `input`, or
/// `None` when `input` dropped the container.
pub(crate) fn merge_container(raw: &SdkContainer, input: &TaskDefinitionInput) -> Option<SdkContainer> {
    let wanted = input.container(raw.name()?)?;
    let mut container = raw.clone();
    container.image = Some(wanted.image.clone());
    container.environment = Some(
        wanted
            .environment
            .iter()
            .map(|e| KeyValuePair::builder().name(&e.name).value(&e.value).build())
            .collect(),
    );
    Some(container)
}
