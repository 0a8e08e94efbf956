//! Deployment orchestrator: sequences one blue/green cutover.
//!
//! ```text
//! Locked → Cleaned → ServiceEnsured → NodeCreated → RevisionRegistered
//!        → TaskSetPromoted → HealthConverged → TrafficSwitched
//!        → [ParameterPublished] → Unlocked
//! ```
//!
//! Locking and parameter publishing are capability flags on the
//! `DeploymentSpec`. A run that fails after `Locked` leaves the lock held
//! unless `release_lock_on_failure` is set; the half-provisioned resources
//! are picked up by the next run's collector.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use meshflip_core::DeploymentSpec;
use meshflip_core::naming::qualified_node_path;
use meshflip_health::{GateReport, HealthGate, ReadinessProbe};
use meshflip_lock::LockManager;

use crate::collector::{CollectionReport, GarbageCollector};
use crate::error::{DeployError, DeployResult};
use crate::memory::InMemoryPlatform;
use crate::platform::{
    ComputePlatform, DiscoveryRegistry, MeshControlPlane, ParameterStore, PipelineReporter, Route,
};
use crate::provisioner::Provisioner;
use crate::readiness::{InstanceReadiness, TaskReadiness};
use crate::switch::TrafficSwitch;

/// Source of "now" for node names and lock comments.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Handles to every external system a run talks to.
#[derive(Clone)]
pub struct Platform {
    pub compute: Arc<dyn ComputePlatform>,
    pub mesh: Arc<dyn MeshControlPlane>,
    pub discovery: Arc<dyn DiscoveryRegistry>,
    pub parameters: Option<Arc<dyn ParameterStore>>,
}

impl Platform {
    pub fn new(
        compute: Arc<dyn ComputePlatform>,
        mesh: Arc<dyn MeshControlPlane>,
        discovery: Arc<dyn DiscoveryRegistry>,
    ) -> Self {
        Self {
            compute,
            mesh,
            discovery,
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Arc<dyn ParameterStore>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Every system backed by one in-memory platform.
    pub fn in_memory(platform: &InMemoryPlatform) -> Self {
        let shared = Arc::new(platform.clone());
        Self::new(shared.clone(), shared.clone(), shared.clone()).with_parameters(shared)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    Locked,
    Cleaned,
    ServiceEnsured,
    NodeCreated,
    RevisionRegistered,
    TaskSetPromoted,
    HealthConverged,
    TrafficSwitched,
    ParameterPublished,
    Unlocked,
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub node_name: String,
    pub node_path: String,
    pub service_created: bool,
    pub revision_arn: String,
    pub task_set_arn: String,
    pub route: Route,
    pub collection: CollectionReport,
    pub health: GateReport,
    pub phases: Vec<DeployPhase>,
}

pub struct Orchestrator {
    spec: Arc<DeploymentSpec>,
    platform: Platform,
    gate: HealthGate,
    locks: Option<LockManager>,
    clock: Clock,
    release_lock_on_failure: bool,
}

impl Orchestrator {
    pub fn new(spec: DeploymentSpec, platform: Platform, gate: HealthGate) -> Self {
        Self {
            spec: Arc::new(spec),
            platform,
            gate,
            locks: None,
            clock: Arc::new(Utc::now),
            release_lock_on_failure: false,
        }
    }

    pub fn with_locks(mut self, locks: LockManager) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn release_lock_on_failure(mut self, release: bool) -> Self {
        self.release_lock_on_failure = release;
        self
    }

    pub fn spec(&self) -> &DeploymentSpec {
        &self.spec
    }

    /// Run one cutover end to end.
    pub async fn run(&self) -> DeployResult<DeploymentOutcome> {
        self.preflight()?;

        let mut phases = Vec::new();
        let lock = match (self.spec.lock_key(), &self.locks) {
            (Some(key), Some(locks)) => {
                locks.acquire_at(key, (self.clock)()).await?;
                phases.push(DeployPhase::Locked);
                Some((key, locks))
            }
            _ => None,
        };

        match self.cutover(&mut phases).await {
            Ok(mut outcome) => {
                if let Some((key, locks)) = lock {
                    locks.release(key).await?;
                    phases.push(DeployPhase::Unlocked);
                }
                outcome.phases = phases;
                info!(node = %outcome.node_name, phases = outcome.phases.len(), "deployment finished");
                Ok(outcome)
            }
            Err(e) => {
                error!(error = %e, reached = ?phases.last(), "deployment failed");
                if let Some((key, locks)) = lock {
                    if self.release_lock_on_failure {
                        if let Err(release) = locks.release(key).await {
                            warn!(key, error = %release, "failed to release lock after failure");
                        }
                    } else {
                        warn!(key, "lock left held; release it once the failure is understood");
                    }
                }
                Err(e)
            }
        }
    }

    /// Run, then tell the pipeline how it went. The run's own result is
    /// returned either way; a reporter failure is only logged.
    pub async fn run_and_report(
        &self,
        reporter: &dyn PipelineReporter,
    ) -> DeployResult<DeploymentOutcome> {
        let result = self.run().await;
        let reported = match &result {
            Ok(outcome) => reporter.report_success(outcome).await,
            Err(e) => reporter.report_failure(e).await,
        };
        if let Err(e) = reported {
            warn!(error = %e, "failed to report deployment result");
        }
        result
    }

    fn preflight(&self) -> DeployResult<()> {
        self.spec.validate()?;
        if self.spec.lock_key().is_some() && self.locks.is_none() {
            return Err(DeployError::configuration(
                "locking is enabled but no lock store is configured",
            ));
        }
        if self.spec.publish_target().is_some() && self.platform.parameters.is_none() {
            return Err(DeployError::configuration(
                "parameter publishing is enabled but no parameter store is configured",
            ));
        }
        Ok(())
    }

    async fn cutover(&self, phases: &mut Vec<DeployPhase>) -> DeployResult<DeploymentOutcome> {
        let spec = &self.spec;
        let platform = &self.platform;

        let collection = GarbageCollector::new(
            spec.clone(),
            platform.compute.clone(),
            platform.mesh.clone(),
        )
        .collect()
        .await?;
        phases.push(DeployPhase::Cleaned);

        let provisioner = Provisioner::new(
            spec.clone(),
            platform.compute.clone(),
            platform.mesh.clone(),
            platform.discovery.clone(),
        );

        let service = provisioner.ensure_service().await?;
        phases.push(DeployPhase::ServiceEnsured);

        let node = provisioner.create_mesh_node((self.clock)()).await?;
        phases.push(DeployPhase::NodeCreated);

        let revision = provisioner.register_revision(&node).await?;
        phases.push(DeployPhase::RevisionRegistered);

        let task_set = provisioner
            .create_task_set(&service, &node, &revision)
            .await?;
        phases.push(DeployPhase::TaskSetPromoted);

        let tasks = TaskReadiness::new(spec.clone(), platform.compute.clone());
        let instances = InstanceReadiness::new(platform.discovery.clone(), node.registry.id.clone());
        let probes: [&dyn ReadinessProbe; 2] = [&tasks, &instances];
        let health = self.gate.wait(&probes).await?;
        phases.push(DeployPhase::HealthConverged);

        let route = TrafficSwitch::new(spec.clone(), platform.mesh.clone())
            .switch_to(node.name())
            .await?;
        phases.push(DeployPhase::TrafficSwitched);

        let node_path = qualified_node_path(&spec.mesh_name, node.name());
        if let (Some(name), Some(store)) = (spec.publish_target(), &platform.parameters) {
            info!(parameter = name, value = %node_path, "publishing active node");
            store.put_parameter(name, &node_path).await?;
            phases.push(DeployPhase::ParameterPublished);
        }

        Ok(DeploymentOutcome {
            key: spec.key.clone(),
            node_name: node.name().to_string(),
            node_path,
            service_created: service.created,
            revision_arn: revision.arn,
            task_set_arn: task_set.arn,
            route,
            collection,
            health,
            phases: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{at, settings, test_spec};
    use meshflip_core::Capabilities;
    use meshflip_lock::RedbLockStore;

    fn locks() -> LockManager {
        LockManager::new(Arc::new(RedbLockStore::open_in_memory().unwrap()))
    }

    fn fixed(now: DateTime<Utc>) -> Clock {
        Arc::new(move || now)
    }

    #[tokio::test(start_paused = true)]
    async fn phases_are_recorded_in_order() {
        let spec = DeploymentSpec {
            parameter_name: Some("/echo/params/APPMESH_VIRTUAL_NODE_NAME".to_string()),
            capabilities: Capabilities {
                locking: true,
                publish_parameter: true,
            },
            ..test_spec()
        };
        let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0));
        let outcome = Orchestrator::new(
            spec,
            Platform::in_memory(&platform),
            HealthGate::new(&settings()).unwrap(),
        )
        .with_locks(locks())
        .with_clock(fixed(at(0, 1, 0)))
        .run()
        .await
        .unwrap();

        use DeployPhase::*;
        assert_eq!(
            outcome.phases,
            vec![
                Locked,
                Cleaned,
                ServiceEnsured,
                NodeCreated,
                RevisionRegistered,
                TaskSetPromoted,
                HealthConverged,
                TrafficSwitched,
                ParameterPublished,
                Unlocked,
            ]
        );
        assert!(outcome.service_created);
        assert_eq!(
            platform.parameter("/echo/params/APPMESH_VIRTUAL_NODE_NAME").as_deref(),
            Some("mesh/echo-mesh/virtualNode/echo_server-20230101000100")
        );
    }

    #[tokio::test]
    async fn locking_without_store_fails_before_any_call() {
        let spec = test_spec();
        let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0));
        let err = Orchestrator::new(
            spec,
            Platform::in_memory(&platform),
            HealthGate::new(&settings()).unwrap(),
        )
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, DeployError::Configuration(msg) if msg.contains("lock store")));
        assert!(platform.mutations().is_empty());
    }

    #[tokio::test]
    async fn publishing_without_store_is_rejected() {
        let spec = DeploymentSpec {
            parameter_name: Some("/p".to_string()),
            capabilities: Capabilities {
                locking: false,
                publish_parameter: true,
            },
            ..test_spec()
        };
        let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0));
        let shared = Arc::new(platform.clone());
        let without_params = Platform::new(shared.clone(), shared.clone(), shared);

        let err = Orchestrator::new(spec, without_params, HealthGate::new(&settings()).unwrap())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Configuration(msg) if msg.contains("parameter store")));
    }

    #[tokio::test]
    async fn invalid_spec_is_rejected() {
        let spec = DeploymentSpec {
            port: 0,
            ..test_spec()
        };
        let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0));
        let err = Orchestrator::new(
            spec,
            Platform::in_memory(&platform),
            HealthGate::new(&settings()).unwrap(),
        )
        .with_locks(locks())
        .run()
        .await
        .unwrap_err();
        assert!(matches!(err, DeployError::Spec(_)));
    }
}
