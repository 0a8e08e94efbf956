//! Traffic switch: repoints the mesh route at a single node.

use std::sync::Arc;

use tracing::info;

use meshflip_core::DeploymentSpec;

use crate::error::{DeployError, DeployResult};
use crate::platform::{MeshControlPlane, Route, WeightedTarget};

/// Replace every weighted target of `route` with `node` at weight 1.
///
/// Match and priority are left untouched. Fails if the route has no
/// targets, since there is no live traffic to move.
pub fn cut_over(mut route: Route, node: &str) -> DeployResult<Route> {
    if route.spec.weighted_targets.is_empty() {
        return Err(DeployError::configuration(format!(
            "route '{}' on router '{}' has no weighted targets",
            route.route_name, route.router_name
        )));
    }
    route.spec.weighted_targets = vec![WeightedTarget {
        node: node.to_string(),
        weight: 1,
    }];
    Ok(route)
}

pub struct TrafficSwitch {
    spec: Arc<DeploymentSpec>,
    mesh: Arc<dyn MeshControlPlane>,
}

impl TrafficSwitch {
    pub fn new(spec: Arc<DeploymentSpec>, mesh: Arc<dyn MeshControlPlane>) -> Self {
        Self { spec, mesh }
    }

    /// Send all traffic on the configured route to `node`.
    pub async fn switch_to(&self, node: &str) -> DeployResult<Route> {
        let spec = &self.spec;
        let route = self
            .mesh
            .describe_route(&spec.mesh_name, &spec.virtual_router_name, &spec.route_name)
            .await?
            .ok_or_else(|| {
                DeployError::configuration(format!(
                    "missing route '{}' on router '{}' in mesh '{}'",
                    spec.route_name, spec.virtual_router_name, spec.mesh_name
                ))
            })?;

        let previous: Vec<String> = route.live_targets().map(|t| t.node.clone()).collect();
        let updated = cut_over(route, node)?;

        info!(route = %updated.route_name, ?previous, node, "switching traffic");
        let written = self.mesh.update_route(&updated).await?;
        info!(route = %written.route_name, node, "traffic switched");
        Ok(written)
    }
}
