use async_trait::async_trait;
use tracing::{error, info};

use crate::error::DeployError;
use crate::orchestrator::DeploymentOutcome;
use crate::platform::{PipelineReporter, PlatformResult};

/// Reports the result of a run to the log instead of a pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[async_trait]
impl PipelineReporter for LogReporter {
    async fn report_success(&self, outcome: &DeploymentOutcome) -> PlatformResult<()> {
        info!(
            key = outcome.key.as_deref().unwrap_or("-"),
            node = %outcome.node_name,
            task_set = %outcome.task_set_arn,
            revision = %outcome.revision_arn,
            collected_nodes = outcome.collection.deleted_nodes.len(),
            "deployment succeeded"
        );
        Ok(())
    }

    async fn report_failure(&self, failure: &DeployError) -> PlatformResult<()> {
        error!(error = %failure, "deployment failed");
        Ok(())
    }
}
