//! End-to-end cutover runs against the in-memory platform.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;

use meshflip_core::{
    Capabilities, DeploymentSpec, HealthSettings, NetworkPlacement, SidecarConfig,
};
use meshflip_deploy::platform::{PipelineReporter, PlatformResult, WeightedTarget};
use meshflip_deploy::{
    DeployError, DeployPhase, DeploymentOutcome, InMemoryPlatform, Mutation, Orchestrator,
    Platform,
};
use meshflip_health::HealthGate;
use meshflip_lock::{LockManager, RedbLockStore};

const KEY: &str = "echo_server:prod";
const PARAMETER: &str = "/echo/params/APPMESH_VIRTUAL_NODE_NAME";

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 1, 1, h, m, s).unwrap()
}

fn spec() -> DeploymentSpec {
    DeploymentSpec {
        key: Some(KEY.to_string()),
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
        parameter_name: Some(PARAMETER.to_string()),
        sidecar: SidecarConfig::default(),
        launch_type: "FARGATE".to_string(),
        capabilities: Capabilities {
            locking: true,
            publish_parameter: true,
        },
    }
}

fn gate(settings: HealthSettings) -> HealthGate {
    HealthGate::new(&settings).unwrap()
}

fn capped() -> HealthSettings {
    HealthSettings {
        max_polls: Some(20),
        ..Default::default()
    }
}

fn locks() -> LockManager {
    LockManager::new(Arc::new(RedbLockStore::open_in_memory().unwrap()))
}

fn orchestrator(
    spec: DeploymentSpec,
    platform: &InMemoryPlatform,
    locks: &LockManager,
    now: DateTime<Utc>,
) -> Orchestrator {
    Orchestrator::new(spec, Platform::in_memory(platform), gate(capped()))
        .with_locks(locks.clone())
        .with_clock(Arc::new(move || now))
}

fn single_target(node: &str) -> Vec<WeightedTarget> {
    vec![WeightedTarget {
        node: node.to_string(),
        weight: 1,
    }]
}

#[tokio::test(start_paused = true)]
async fn successful_run_routes_everything_to_new_node() {
    let spec = spec();
    let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0));
    let locks = locks();

    let outcome = orchestrator(spec.clone(), &platform, &locks, at(0, 1, 0))
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.node_name, "echo_server-20230101000100");
    assert_eq!(
        platform.route(&spec).unwrap().spec.weighted_targets,
        single_target("echo_server-20230101000100")
    );
    assert_eq!(outcome.route.spec.weighted_targets.len(), 1);
    assert_eq!(
        platform.parameter(PARAMETER).as_deref(),
        Some("mesh/echo-mesh/virtualNode/echo_server-20230101000100")
    );
    assert_eq!(outcome.phases.last(), Some(&DeployPhase::Unlocked));
    assert!(locks.inspect(KEY).await.unwrap().is_none());

    // The service did not exist: one task per subnet.
    assert!(outcome.service_created);
    assert_eq!(platform.service(&spec).unwrap().desired_count, 2);

    let primaries: Vec<_> = platform
        .task_sets(&spec)
        .into_iter()
        .filter(|ts| ts.status == "PRIMARY")
        .collect();
    assert_eq!(primaries.len(), 1);
    assert_eq!(primaries[0].arn, outcome.task_set_arn);
}

#[tokio::test(start_paused = true)]
async fn next_run_collects_previous_generation() {
    let spec = spec();
    let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0)).with_active_service(&spec);
    let locks = locks();

    let first = orchestrator(spec.clone(), &platform, &locks, at(0, 1, 0))
        .run()
        .await
        .unwrap();
    assert!(!first.service_created);
    assert!(first.collection.unused.is_empty());
    assert_eq!(first.collection.used, vec!["echo_server-20230101000000"]);

    let second = orchestrator(spec.clone(), &platform, &locks, at(0, 2, 0))
        .run()
        .await
        .unwrap();
    assert_eq!(second.collection.unused, vec!["echo_server-20230101000000"]);
    assert_eq!(second.collection.deleted_nodes, vec!["echo_server-20230101000000"]);
    assert_eq!(second.collection.deleted_task_sets.len(), 1);

    assert_eq!(
        platform.mesh_nodes(&spec.mesh_name),
        vec!["echo_server-20230101000100", "echo_server-20230101000200"]
    );
    assert_eq!(
        platform.route(&spec).unwrap().spec.weighted_targets,
        single_target("echo_server-20230101000200")
    );
    // The 00:01 task set stays until the route moves past it.
    assert_eq!(platform.task_sets(&spec).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn transient_instance_health_failure_does_not_fail_the_run() {
    let spec = spec();
    let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0));
    platform.fail_instance_health(1);
    let locks = locks();

    let outcome = orchestrator(spec, &platform, &locks, at(0, 1, 0))
        .run()
        .await
        .unwrap();

    let instances = &outcome.health.stages[1];
    assert_eq!(instances.stage, "instances");
    // The failed poll read as zero unhealthy, so the wait went on.
    assert_eq!(instances.transition_polls, 2);
    assert_eq!(instances.ready_polls, 1);
}

#[tokio::test(start_paused = true)]
async fn held_lock_blocks_run_before_any_mutation() {
    let spec = spec();
    let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0));
    let locks = locks();
    locks.acquire(KEY).await.unwrap();

    let err = orchestrator(spec, &platform, &locks, at(0, 1, 0))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::LockConflict { ref key, .. } if key == KEY));
    assert!(platform.mutations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_run_keeps_lock_unless_configured_to_release() {
    let seeded = spec();
    let platform = InMemoryPlatform::seeded(&seeded, at(0, 0, 0));
    let broken = DeploymentSpec {
        sidecar: SidecarConfig {
            container_name: "linkerd".to_string(),
            ..Default::default()
        },
        ..seeded.clone()
    };

    let held = locks();
    let err = orchestrator(broken.clone(), &platform, &held, at(0, 1, 0))
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::Configuration(ref msg) if msg.contains("linkerd")));
    let record = held.inspect(KEY).await.unwrap().unwrap();
    assert!(record.comment.starts_with("Began creating at 2023-01-01T00:01:00"));

    let released = locks();
    orchestrator(broken, &platform, &released, at(0, 2, 0))
        .release_lock_on_failure(true)
        .run()
        .await
        .unwrap_err();
    assert!(released.inspect(KEY).await.unwrap().is_none());

    // Traffic never moved.
    assert_eq!(
        platform.route(&seeded).unwrap().spec.weighted_targets,
        single_target("echo_server-20230101000000")
    );
}

#[tokio::test(start_paused = true)]
async fn stuck_tasks_hit_the_poll_cap() {
    let spec = spec();
    let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0)).with_polls_until_running(100);
    let settings = HealthSettings {
        max_polls: Some(3),
        ..Default::default()
    };

    let err = Orchestrator::new(spec.clone(), Platform::in_memory(&platform), gate(settings))
        .with_locks(locks())
        .with_clock(Arc::new(|| at(0, 1, 0)))
        .run()
        .await
        .unwrap_err();

    match err {
        DeployError::HealthTimeout {
            stage,
            phase,
            polls,
        } => {
            assert_eq!(stage, "tasks");
            assert_eq!(phase, "awaiting ready");
            assert_eq!(polls, 3);
        }
        other => panic!("expected HealthTimeout, got {other:?}"),
    }
    assert!(
        !platform
            .mutations()
            .iter()
            .any(|m| matches!(m, Mutation::UpdateRoute(_)))
    );
}

#[tokio::test(start_paused = true)]
async fn cancelled_wait_stops_the_run() {
    let spec = spec();
    let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0)).with_polls_until_running(5);
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let err = Orchestrator::new(
        spec,
        Platform::in_memory(&platform),
        gate(capped()).with_cancellation(rx),
    )
    .with_locks(locks())
    .with_clock(Arc::new(|| at(0, 1, 0)))
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, DeployError::Cancelled { stage: "tasks" }));
}

#[derive(Default)]
struct RecordingReporter {
    successes: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

#[async_trait]
impl PipelineReporter for RecordingReporter {
    async fn report_success(&self, outcome: &DeploymentOutcome) -> PlatformResult<()> {
        self.successes.lock().unwrap().push(outcome.node_name.clone());
        Ok(())
    }

    async fn report_failure(&self, error: &DeployError) -> PlatformResult<()> {
        self.failures.lock().unwrap().push(error.to_string());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn pipeline_hears_about_success_and_failure() {
    let spec = spec();
    let platform = InMemoryPlatform::seeded(&spec, at(0, 0, 0));
    let locks = locks();
    let reporter = RecordingReporter::default();

    orchestrator(spec.clone(), &platform, &locks, at(0, 1, 0))
        .run_and_report(&reporter)
        .await
        .unwrap();

    // Same second as the live node: the node name collides.
    orchestrator(spec, &platform, &locks, at(0, 1, 0))
        .run_and_report(&reporter)
        .await
        .unwrap_err();

    assert_eq!(
        *reporter.successes.lock().unwrap(),
        vec!["echo_server-20230101000100"]
    );
    let failures = reporter.failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("already exists"));
}
