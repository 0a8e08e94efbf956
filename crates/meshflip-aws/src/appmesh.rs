//! [`MeshControlPlane`] on AWS App Mesh.
//!
//! Route updates resend the spec App Mesh last returned with only the
//! gRPC weighted targets replaced, so retry and timeout policies set
//! outside meshflip survive a cutover.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_sdk_appmesh::Client;
use aws_sdk_appmesh::types::{
    AwsCloudMapInstanceAttribute, AwsCloudMapServiceDiscovery, GrpcRoute, GrpcRouteAction,
    GrpcRouteMatch, HealthCheckPolicy as SdkHealthCheck, Listener as SdkListener, PortMapping,
    PortProtocol, RouteData, RouteSpec as SdkRouteSpec, ServiceDiscovery, TagRef, VirtualNodeSpec,
    WeightedTarget as SdkWeightedTarget,
};
use tracing::debug;

use meshflip_deploy::platform::{
    Listener, MeshControlPlane, MeshNode, MeshNodeSpec, MeshProtocol, PlatformResult, Route,
    RouteMatch, RouteSpec, WeightedTarget,
};

use crate::error::{missing, non_empty, sdk_error, to_i32, to_u32};

type RouteKey = (String, String, String);

#[derive(Clone)]
pub struct AppMeshControlPlane {
    client: Client,
    routes: Arc<Mutex<HashMap<RouteKey, SdkRouteSpec>>>,
}

impl AppMeshControlPlane {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            routes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn remember(&self, data: &RouteData) {
        if let Some(spec) = data.spec() {
            let key = (
                data.mesh_name().to_string(),
                data.virtual_router_name().to_string(),
                data.route_name().to_string(),
            );
            self.routes
                .lock()
                .expect("route cache lock")
                .insert(key, spec.clone());
        }
    }

    fn cached(&self, route: &Route) -> Option<SdkRouteSpec> {
        let key = (
            route.mesh_name.clone(),
            route.router_name.clone(),
            route.route_name.clone(),
        );
        self.routes.lock().expect("route cache lock").get(&key).cloned()
    }
}

#[async_trait]
impl MeshControlPlane for AppMeshControlPlane {
    async fn list_mesh_nodes(&self, mesh: &str) -> PlatformResult<Vec<String>> {
        let mut names = Vec::new();
        let mut token = None;
        loop {
            let out = self
                .client
                .list_virtual_nodes()
                .mesh_name(mesh)
                .set_next_token(token)
                .send()
                .await
                .map_err(sdk_error("list_virtual_nodes"))?;
            names.extend(
                out.virtual_nodes()
                    .iter()
                    .map(|n| n.virtual_node_name().to_string()),
            );
            token = out.next_token().map(str::to_string);
            if token.is_none() {
                return Ok(names);
            }
        }
    }

    async fn create_mesh_node(&self, spec: &MeshNodeSpec) -> PlatformResult<MeshNode> {
        let node_spec = node_spec_to_sdk(spec)?;
        let tags = spec
            .tags
            .iter()
            .map(|(k, v)| TagRef::builder().key(k).value(v).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(sdk_error("create_virtual_node"))?;
        let out = self
            .client
            .create_virtual_node()
            .mesh_name(&spec.mesh_name)
            .virtual_node_name(&spec.node_name)
            .spec(node_spec)
            .set_tags(non_empty(tags))
            .send()
            .await
            .map_err(sdk_error("create_virtual_node"))?;
        let node = out
            .virtual_node()
            .ok_or_else(|| missing("create_virtual_node", "virtual node"))?;
        Ok(MeshNode {
            mesh_name: spec.mesh_name.clone(),
            name: node.virtual_node_name().to_string(),
            arn: node.metadata().map(|m| m.arn().to_string()).unwrap_or_default(),
            tags: spec.tags.clone(),
        })
    }

    async fn delete_mesh_node(&self, mesh: &str, node: &str) -> PlatformResult<()> {
        self.client
            .delete_virtual_node()
            .mesh_name(mesh)
            .virtual_node_name(node)
            .send()
            .await
            .map_err(sdk_error("delete_virtual_node"))?;
        Ok(())
    }

    async fn describe_route(
        &self,
        mesh: &str,
        router: &str,
        route: &str,
    ) -> PlatformResult<Option<Route>> {
        let result = self
            .client
            .describe_route()
            .mesh_name(mesh)
            .virtual_router_name(router)
            .route_name(route)
            .send()
            .await;
        let out = match result {
            Ok(out) => out,
            Err(e) if e.as_service_error().is_some_and(|e| e.is_not_found_exception()) => {
                debug!(mesh, router, route, "route not found");
                return Ok(None);
            }
            Err(e) => return Err(sdk_error("describe_route")(e)),
        };
        let Some(data) = out.route() else {
            return Ok(None);
        };
        self.remember(data);
        Ok(Some(route_from_sdk(data)))
    }

    async fn update_route(&self, route: &Route) -> PlatformResult<Route> {
        let spec = retarget(self.cached(route), route)?;
        let out = self
            .client
            .update_route()
            .mesh_name(&route.mesh_name)
            .virtual_router_name(&route.router_name)
            .route_name(&route.route_name)
            .spec(spec)
            .send()
            .await
            .map_err(sdk_error("update_route"))?;
        let data = out.route().ok_or_else(|| missing("update_route", "route"))?;
        self.remember(data);
        Ok(route_from_sdk(data))
    }
}

fn protocol_to_sdk(protocol: MeshProtocol) -> PortProtocol {
    match protocol {
        MeshProtocol::Grpc => PortProtocol::Grpc,
        MeshProtocol::Http => PortProtocol::Http,
        MeshProtocol::Tcp => PortProtocol::Tcp,
    }
}

fn listener_to_sdk(listener: &Listener) -> PlatformResult<SdkListener> {
    let check = &listener.health_check;
    let health_check = SdkHealthCheck::builder()
        .healthy_threshold(to_i32(check.healthy_threshold))
        .unhealthy_threshold(to_i32(check.unhealthy_threshold))
        .interval_millis(i64::try_from(check.interval_millis).unwrap_or(i64::MAX))
        .timeout_millis(i64::try_from(check.timeout_millis).unwrap_or(i64::MAX))
        .port(i32::from(check.port))
        .protocol(protocol_to_sdk(check.protocol))
        .build()
        .map_err(sdk_error("health_check_policy"))?;
    let port_mapping = PortMapping::builder()
        .port(i32::from(listener.port))
        .protocol(protocol_to_sdk(listener.protocol))
        .build()
        .map_err(sdk_error("port_mapping"))?;
    Ok(SdkListener::builder()
        .port_mapping(port_mapping)
        .health_check(health_check)
        .build())
}

pub(crate) fn node_spec_to_sdk(spec: &MeshNodeSpec) -> PlatformResult<VirtualNodeSpec> {
    let attributes = spec
        .discovery
        .attributes
        .iter()
        .map(|(k, v)| AwsCloudMapInstanceAttribute::builder().key(k).value(v).build())
        .collect::<Result<Vec<_>, _>>()
        .map_err(sdk_error("aws_cloud_map_instance_attribute"))?;
    let discovery = AwsCloudMapServiceDiscovery::builder()
        .namespace_name(&spec.discovery.namespace_name)
        .service_name(&spec.discovery.service_name)
        .set_attributes(non_empty(attributes))
        .build()
        .map_err(sdk_error("aws_cloud_map_service_discovery"))?;
    let listeners = spec
        .listeners
        .iter()
        .map(listener_to_sdk)
        .collect::<PlatformResult<Vec<_>>>()?;
    Ok(VirtualNodeSpec::builder()
        .service_discovery(ServiceDiscovery::AwsCloudMap(discovery))
        .set_listeners(Some(listeners))
        .build())
}

/// `current` with its gRPC action pointing at `route`'s targets. Without a
/// current spec one is built from `route` alone.
pub(crate) fn retarget(current: Option<SdkRouteSpec>, route: &Route) -> PlatformResult<SdkRouteSpec> {
    let targets = route
        .spec
        .weighted_targets
        .iter()
        .map(|t| {
            SdkWeightedTarget::builder()
                .virtual_node(&t.node)
                .weight(to_i32(t.weight))
                .build()
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(sdk_error("weighted_target"))?;
    let action = GrpcRouteAction::builder()
        .set_weighted_targets(Some(targets))
        .build()
        .map_err(sdk_error("grpc_route_action"))?;

    let mut spec = current.unwrap_or_else(|| {
        SdkRouteSpec::builder()
            .set_priority(route.spec.priority.map(to_i32))
            .build()
    });
    let mut grpc = spec.grpc_route.take().unwrap_or_else(|| {
        let mut fresh = GrpcRoute::builder();
        if let Some(m) = &route.spec.route_match {
            fresh = fresh.r#match(
                GrpcRouteMatch::builder()
                    .set_service_name(m.service_name.clone())
                    .set_method_name(m.method_name.clone())
                    .build(),
            );
        }
        fresh.build()
    });
    grpc.action = Some(action);
    spec.grpc_route = Some(grpc);
    Ok(spec)
}

pub(crate) fn route_spec_from_sdk(spec: Option<&SdkRouteSpec>) -> RouteSpec {
    let grpc = spec.and_then(|s| s.grpc_route());
    RouteSpec {
        priority: spec.and_then(|s| s.priority()).map(to_u32),
        route_match: grpc.and_then(|g| g.r#match()).map(|m| RouteMatch {
            service_name: m.service_name().map(str::to_string),
            method_name: m.method_name().map(str::to_string),
        }),
        weighted_targets: grpc
            .and_then(|g| g.action())
            .map(|a| {
                a.weighted_targets()
                    .iter()
                    .map(|t| WeightedTarget {
                        node: t.virtual_node().to_string(),
                        weight: to_u32(t.weight()),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn route_from_sdk(data: &RouteData) -> Route {
    Route {
        mesh_name: data.mesh_name().to_string(),
        router_name: data.virtual_router_name().to_string(),
        route_name: data.route_name().to_string(),
        spec: route_spec_from_sdk(data.spec()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use meshflip_deploy::platform::{DiscoveryBinding, HealthCheckPolicy};

    use super::*;

    fn route(targets: &[(&str, u32)]) -> Route {
        Route {
            mesh_name: "echo-mesh".to_string(),
            router_name: "virtual-router".to_string(),
            route_name: "route".to_string(),
            spec: RouteSpec {
                priority: Some(1),
                route_match: Some(RouteMatch {
                    service_name: Some("echo.EchoService".to_string()),
                    method_name: None,
                }),
                weighted_targets: targets
                    .iter()
                    .map(|(node, weight)| WeightedTarget {
                        node: node.to_string(),
                        weight: *weight,
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn retarget_keeps_existing_match_and_priority() {
        let current = SdkRouteSpec::builder()
            .priority(7)
            .grpc_route(
                GrpcRoute::builder()
                    .r#match(GrpcRouteMatch::builder().service_name("live.Service").build())
                    .build(),
            )
            .build();

        let spec = retarget(Some(current), &route(&[("echo_server-new", 1)])).unwrap();
        let back = route_spec_from_sdk(Some(&spec));
        assert_eq!(back.priority, Some(7));
        assert_eq!(
            back.route_match.and_then(|m| m.service_name).as_deref(),
            Some("live.Service")
        );
        assert_eq!(
            back.weighted_targets,
            vec![WeightedTarget {
                node: "echo_server-new".to_string(),
                weight: 1
            }]
        );
    }

    #[test]
    fn retarget_without_current_spec_builds_from_route() {
        let spec = retarget(None, &route(&[("a", 0), ("b", 1)])).unwrap();
        let back = route_spec_from_sdk(Some(&spec));
        assert_eq!(back, route(&[("a", 0), ("b", 1)]).spec);
    }

    #[test]
    fn missing_grpc_route_reads_as_no_targets() {
        let spec = SdkRouteSpec::builder().priority(1).build();
        assert!(route_spec_from_sdk(Some(&spec)).weighted_targets.is_empty());
        assert!(route_spec_from_sdk(None).weighted_targets.is_empty());
    }

    #[test]
    fn node_spec_binds_cloud_map_attributes() {
        let spec = MeshNodeSpec {
            mesh_name: "echo-mesh".to_string(),
            node_name: "echo_server-20230101000100".to_string(),
            discovery: DiscoveryBinding {
                namespace_name: "echo.local".to_string(),
                service_name: "echo_server".to_string(),
                attributes: BTreeMap::from([(
                    "ECS_TASK_SET_EXTERNAL_ID".to_string(),
                    "echo_server-20230101000100".to_string(),
                )]),
            },
            listeners: vec![Listener {
                port: 8080,
                protocol: MeshProtocol::Grpc,
                health_check: HealthCheckPolicy {
                    healthy_threshold: 2,
                    unhealthy_threshold: 3,
                    interval_millis: 5000,
                    timeout_millis: 2000,
                    port: 8080,
                    protocol: MeshProtocol::Grpc,
                },
            }],
            tags: BTreeMap::new(),
        };

        let sdk = node_spec_to_sdk(&spec).unwrap();
        let Some(ServiceDiscovery::AwsCloudMap(cloud_map)) = sdk.service_discovery() else {
            panic!("expected cloud map discovery");
        };
        assert_eq!(cloud_map.namespace_name(), "echo.local");
        assert_eq!(cloud_map.attributes()[0].value(), "echo_server-20230101000100");

        let listener = &sdk.listeners()[0];
        assert_eq!(listener.port_mapping().map(|p| p.port()), Some(8080));
        assert_eq!(
            listener.health_check().map(|h| h.protocol()),
            Some(&PortProtocol::Grpc)
        );
    }
}
