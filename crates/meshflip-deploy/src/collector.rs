//! Garbage collector for mesh nodes and task sets left behind by earlier
//! cutovers.
//!
//! Runs against the live route before anything new is provisioned. A node
//! is *used* while a positive-weight target names it; every other node
//! generated for the service is unused, and so is any task set bound to
//! it. Delete failures are recorded and skipped so a stuck resource never
//! blocks the deployment that follows.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use meshflip_core::naming::node_from_path;
use meshflip_core::{DeploymentSpec, NodeNamePattern};

use crate::error::DeployResult;
use crate::platform::{ComputePlatform, MESH_NODE_TAG, MeshControlPlane, TaskSet};

/// A delete the collector attempted and gave up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionFailure {
    pub resource: String,
    pub error: String,
}

/// What one collection pass saw and removed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CollectionReport {
    pub used: Vec<String>,
    pub unused: Vec<String>,
    pub deleted_task_sets: Vec<String>,
    pub deleted_nodes: Vec<String>,
    pub failures: Vec<CollectionFailure>,
    /// Set when the pass was skipped, with the reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl CollectionReport {
    fn skipped(reason: String) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }
}

pub struct GarbageCollector {
    spec: Arc<DeploymentSpec>,
    compute: Arc<dyn ComputePlatform>,
    mesh: Arc<dyn MeshControlPlane>,
}

impl GarbageCollector {
    pub fn new(
        spec: Arc<DeploymentSpec>,
        compute: Arc<dyn ComputePlatform>,
        mesh: Arc<dyn MeshControlPlane>,
    ) -> Self {
        Self {
            spec,
            compute,
            mesh,
        }
    }

    /// Delete unused task sets, then unused nodes.
    pub async fn collect(&self) -> DeployResult<CollectionReport> {
        let spec = &self.spec;
        let pattern = NodeNamePattern::new(&spec.service_name)?;

        let route = self
            .mesh
            .describe_route(&spec.mesh_name, &spec.virtual_router_name, &spec.route_name)
            .await?;
        let Some(route) = route else {
            let reason = format!("route '{}' does not exist", spec.route_name);
            warn!(%reason, "skipping garbage collection");
            return Ok(CollectionReport::skipped(reason));
        };

        let live: BTreeSet<String> = route.live_targets().map(|t| t.node.clone()).collect();
        if live.is_empty() {
            let reason = format!("route '{}' has no positive-weight target", spec.route_name);
            warn!(%reason, "skipping garbage collection");
            return Ok(CollectionReport::skipped(reason));
        }

        let mut report = CollectionReport::default();
        for node in self.mesh.list_mesh_nodes(&spec.mesh_name).await? {
            if !pattern.matches(&node) {
                continue;
            }
            if live.contains(&node) {
                report.used.push(node);
            } else {
                report.unused.push(node);
            }
        }
        info!(used = ?report.used, unused = ?report.unused, "partitioned mesh nodes");

        let unused: BTreeSet<&str> = report.unused.iter().map(String::as_str).collect();
        let service = self
            .compute
            .describe_service(&spec.cluster_name, &spec.compute_service_name)
            .await?;

        let mut doomed = Vec::new();
        match service {
            Some(service) => {
                for task_set in &service.task_sets {
                    let Some(node) = self.bound_node(task_set).await else {
                        continue;
                    };
                    if unused.contains(node.as_str()) {
                        doomed.push((task_set.arn.clone(), node));
                    }
                }
            }
            None => debug!(
                service = %spec.compute_service_name,
                "no compute service, no task sets to collect"
            ),
        }

        for (arn, node) in doomed {
            info!(task_set = %arn, %node, "deleting unused task set");
            match self
                .compute
                .delete_task_set(&spec.cluster_name, &spec.compute_service_name, &arn)
                .await
            {
                Ok(()) => report.deleted_task_sets.push(arn),
                Err(e) => {
                    warn!(task_set = %arn, error = %e, "failed to delete task set");
                    report.failures.push(CollectionFailure {
                        resource: arn,
                        error: e.to_string(),
                    });
                }
            }
        }

        for node in &report.unused {
            info!(%node, "deleting unused mesh node");
            match self.mesh.delete_mesh_node(&spec.mesh_name, node).await {
                Ok(()) => report.deleted_nodes.push(node.clone()),
                Err(e) => {
                    warn!(%node, error = %e, "failed to delete mesh node");
                    report.failures.push(CollectionFailure {
                        resource: node.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            deleted_task_sets = report.deleted_task_sets.len(),
            deleted_nodes = report.deleted_nodes.len(),
            failures = report.failures.len(),
            "garbage collection finished"
        );
        Ok(report)
    }

    /// The mesh node a task set serves: its tag, or failing that the node
    /// its task revision's sidecar is configured for.
    async fn bound_node(&self, task_set: &TaskSet) -> Option<String> {
        if let Some(node) = task_set.tags.get(MESH_NODE_TAG) {
            return Some(node.clone());
        }

        let spec = &self.spec;
        let definition = match self
            .compute
            .describe_task_definition(&task_set.task_definition)
            .await
        {
            Ok(definition) => definition,
            Err(e) => {
                warn!(task_set = %task_set.arn, error = %e, "cannot inspect task set, keeping it");
                return None;
            }
        };

        let node = definition
            .input
            .container(&spec.sidecar.container_name)
            .and_then(|c| c.env(&spec.sidecar.node_env_var))
            .and_then(|path| node_from_path(&spec.mesh_name, path))
            .map(str::to_string);
        if node.is_none() {
            debug!(task_set = %task_set.arn, "task set is not bound to a mesh node");
        }
        node
    }
}
