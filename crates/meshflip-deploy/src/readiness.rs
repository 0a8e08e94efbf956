//! Readiness probes over the compute platform and the discovery registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use meshflip_core::DeploymentSpec;
use meshflip_health::{BoxError, ReadinessProbe};

use crate::platform::{ComputePlatform, DiscoveryRegistry, InstanceHealth, TASK_RUNNING};

/// Counts the service's tasks whose last status is not `RUNNING`.
pub struct TaskReadiness {
    spec: Arc<DeploymentSpec>,
    compute: Arc<dyn ComputePlatform>,
}

impl TaskReadiness {
    pub fn new(spec: Arc<DeploymentSpec>, compute: Arc<dyn ComputePlatform>) -> Self {
        Self { spec, compute }
    }
}

#[async_trait]
impl ReadinessProbe for TaskReadiness {
    fn stage(&self) -> &'static str {
        "tasks"
    }

    async fn count_unready(&self) -> Result<usize, BoxError> {
        let cluster = &self.spec.cluster_name;
        let arns = self
            .compute
            .list_tasks(cluster, &self.spec.compute_service_name)
            .await?;
        if arns.is_empty() {
            warn!(service = %self.spec.compute_service_name, "service has no tasks");
            return Ok(0);
        }

        let tasks = self.compute.describe_tasks(cluster, &arns).await?;
        let mut statuses: BTreeMap<&str, usize> = BTreeMap::new();
        for task in &tasks {
            *statuses.entry(task.last_status.as_str()).or_default() += 1;
        }
        debug!(?statuses, "task statuses");

        Ok(tasks.iter().filter(|t| t.last_status != TASK_RUNNING).count())
    }
}

/// Counts registry instances that are not `HEALTHY`. A failed query is
/// tolerated by the gate.
pub struct InstanceReadiness {
    discovery: Arc<dyn DiscoveryRegistry>,
    service_id: String,
}

impl InstanceReadiness {
    pub fn new(discovery: Arc<dyn DiscoveryRegistry>, service_id: impl Into<String>) -> Self {
        Self {
            discovery,
            service_id: service_id.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for InstanceReadiness {
    fn stage(&self) -> &'static str {
        "instances"
    }

    async fn count_unready(&self) -> Result<usize, BoxError> {
        let health = self.discovery.instances_health(&self.service_id).await?;
        debug!(service_id = %self.service_id, ?health, "instance health");
        Ok(health
            .values()
            .filter(|h| **h != InstanceHealth::Healthy)
            .count())
    }

    fn tolerates_errors(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPlatform;
    use crate::testutil::{at, test_spec};

    #[tokio::test]
    async fn no_tasks_counts_as_ready() {
        let spec = test_spec();
        let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0));
        let probe = TaskReadiness::new(Arc::new(spec), Arc::new(platform));
        assert_eq!(probe.count_unready().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn new_tasks_are_unready_until_running() {
        let spec = test_spec();
        let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0))
            .with_active_service(&spec)
            .with_pending_task_set(&spec, "echo_server-20230101000100");
        let probe = TaskReadiness::new(Arc::new(spec), Arc::new(platform));

        // Two subnets: two new tasks next to the two seeded running ones.
        assert_eq!(probe.count_unready().await.unwrap(), 2);
        assert_eq!(probe.count_unready().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn instance_probe_counts_unhealthy_and_tolerates_errors() {
        let spec = test_spec();
        let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0))
            .with_active_service(&spec)
            .with_pending_task_set(&spec, "echo_server-20230101000100");
        platform.fail_instance_health(1);
        let service_id = platform.discovery_service_id(&spec).unwrap();
        let probe = InstanceReadiness::new(Arc::new(platform), service_id);

        assert!(probe.tolerates_errors());
        assert!(probe.count_unready().await.is_err());
        assert_eq!(probe.count_unready().await.unwrap(), 2);
        assert_eq!(probe.count_unready().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn slow_instances_stay_unhealthy_for_configured_polls() {
        let spec = test_spec();
        let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0))
            .with_active_service(&spec)
            .with_polls_until_healthy(3)
            .with_pending_task_set(&spec, "echo_server-20230101000100");
        let service_id = platform.discovery_service_id(&spec).unwrap();
        let probe = InstanceReadiness::new(Arc::new(platform), service_id);

        for _ in 0..3 {
            assert_eq!(probe.count_unready().await.unwrap(), 2);
        }
        assert_eq!(probe.count_unready().await.unwrap(), 0);
    }
}
