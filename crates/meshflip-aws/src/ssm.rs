//! [`ParameterStore`] on SSM Parameter Store.

use async_trait::async_trait;
use aws_sdk_ssm::Client;
use aws_sdk_ssm::types::ParameterType;
use tracing::debug;

use meshflip_deploy::platform::{ParameterStore, PlatformResult};

use crate::error::sdk_error;

#[derive(Clone)]
pub struct SsmParameters {
    client: Client,
}

impl SsmParameters {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ParameterStore for SsmParameters {
    async fn put_parameter(&self, name: &str, value: &str) -> PlatformResult<()> {
        let out = self
            .client
            .put_parameter()
            .name(name)
            .value(value)
            .r#type(ParameterType::String)
            .overwrite(true)
            .send()
            .await
            .map_err(sdk_error("put_parameter"))?;
        debug!(name, version = out.version(), "parameter written");
        Ok(())
    }
}
