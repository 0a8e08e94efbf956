//! meshflip-aws: the platform traits on AWS.
//!
//! Compute runs on ECS, the mesh is App Mesh, discovery is Cloud Map and
//! the active node is published to SSM Parameter Store. Deployment locks
//! live in a DynamoDB table shared by every host that deploys.
//!
//! # Components
//!
//! - **`ecs`**: [`EcsCompute`], services, task definitions, task sets and tasks
//! - **`appmesh`**: [`AppMeshControlPlane`], virtual nodes and gRPC routes
//! - **`cloudmap`**: [`CloudMapRegistry`], namespaces, services and instance health
//! - **`ssm`**: [`SsmParameters`], the active-node parameter
//! - **`dynamodb`**: [`DynamoLockStore`], a conditional-put lock table

pub mod appmesh;
pub mod cloudmap;
pub mod dynamodb;
pub mod ecs;
mod error;
pub mod ssm;

use std::sync::Arc;

use aws_config::{BehaviorVersion, SdkConfig};
use tracing::debug;

use meshflip_deploy::Platform;

pub use appmesh::AppMeshControlPlane;
pub use cloudmap::CloudMapRegistry;
pub use dynamodb::DynamoLockStore;
pub use ecs::EcsCompute;
pub use ssm::SsmParameters;

/// Credentials and region from the standard AWS environment, profile and
/// instance metadata chain.
pub async fn load_sdk_config() -> SdkConfig {
    let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    debug!(region = ?config.region(), "aws config loaded");
    config
}

/// One client per AWS service, sharing a single [`SdkConfig`].
#[derive(Clone)]
pub struct AwsPlatform {
    config: SdkConfig,
    compute: EcsCompute,
    mesh: AppMeshControlPlane,
    discovery: CloudMapRegistry,
    parameters: SsmParameters,
}

impl AwsPlatform {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            config: config.clone(),
            compute: EcsCompute::new(aws_sdk_ecs::Client::new(config)),
            mesh: AppMeshControlPlane::new(aws_sdk_appmesh::Client::new(config)),
            discovery: CloudMapRegistry::new(aws_sdk_servicediscovery::Client::new(config)),
            parameters: SsmParameters::new(aws_sdk_ssm::Client::new(config)),
        }
    }

    pub async fn from_env() -> Self {
        Self::new(&load_sdk_config().await)
    }

    /// The orchestrator's view of these clients.
    pub fn platform(&self) -> Platform {
        Platform::new(
            Arc::new(self.compute.clone()),
            Arc::new(self.mesh.clone()),
            Arc::new(self.discovery.clone()),
        )
        .with_parameters(Arc::new(self.parameters.clone()))
    }

    pub fn lock_store(&self, table: impl Into<String>) -> DynamoLockStore {
        DynamoLockStore::from_config(&self.config, table)
    }
}
