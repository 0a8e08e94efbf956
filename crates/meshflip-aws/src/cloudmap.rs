//! [`DiscoveryRegistry`] on AWS Cloud Map.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_servicediscovery::Client;
use aws_sdk_servicediscovery::types::{FilterCondition, HealthStatus, ServiceFilter, ServiceFilterName};

use meshflip_deploy::platform::{
    DiscoveryRegistry, DiscoveryService, InstanceHealth, Namespace, PlatformResult,
};

use crate::error::sdk_error;

#[derive(Clone)]
pub struct CloudMapRegistry {
    client: Client,
}

impl CloudMapRegistry {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DiscoveryRegistry for CloudMapRegistry {
    async fn list_namespaces(&self) -> PlatformResult<Vec<Namespace>> {
        let mut namespaces = Vec::new();
        let mut token = None;
        loop {
            let out = self
                .client
                .list_namespaces()
                .set_next_token(token)
                .send()
                .await
                .map_err(sdk_error("list_namespaces"))?;
            namespaces.extend(out.namespaces().iter().filter_map(|n| {
                Some(Namespace {
                    id: n.id()?.to_string(),
                    name: n.name()?.to_string(),
                })
            }));
            token = out.next_token().map(str::to_string);
            if token.is_none() {
                return Ok(namespaces);
            }
        }
    }

    async fn list_services(&self, namespace_id: &str) -> PlatformResult<Vec<DiscoveryService>> {
        let filter = ServiceFilter::builder()
            .name(ServiceFilterName::NamespaceId)
            .values(namespace_id)
            .condition(FilterCondition::Eq)
            .build()
            .map_err(sdk_error("list_services"))?;
        let mut services = Vec::new();
        let mut token = None;
        loop {
            let out = self
                .client
                .list_services()
                .filters(filter.clone())
                .set_next_token(token)
                .send()
                .await
                .map_err(sdk_error("list_services"))?;
            services.extend(out.services().iter().filter_map(|s| {
                Some(DiscoveryService {
                    id: s.id()?.to_string(),
                    arn: s.arn().unwrap_or_default().to_string(),
                    name: s.name()?.to_string(),
                })
            }));
            token = out.next_token().map(str::to_string);
            if token.is_none() {
                return Ok(services);
            }
        }
    }

    async fn instances_health(
        &self,
        service_id: &str,
    ) -> PlatformResult<BTreeMap<String, InstanceHealth>> {
        let mut health = BTreeMap::new();
        let mut token = None;
        loop {
            let out = self
                .client
                .get_instances_health_status()
                .service_id(service_id)
                .set_next_token(token)
                .send()
                .await
                .map_err(sdk_error("get_instances_health_status"))?;
            if let Some(status) = out.status() {
                health.extend(
                    status
                        .iter()
                        .map(|(id, s)| (id.clone(), health_from_sdk(s))),
                );
            }
            token = out.next_token().map(str::to_string);
            if token.is_none() {
                return Ok(health);
            }
        }
    }
}

pub(crate) fn health_from_sdk(status: &HealthStatus) -> InstanceHealth {
    match status {
        HealthStatus::Healthy => InstanceHealth::Healthy,
        HealthStatus::Unhealthy => InstanceHealth::Unhealthy,
        _ => InstanceHealth::Unknown,
    }
}
