//! Deployment error types.

use thiserror::Error;

use meshflip_core::SpecError;
use meshflip_health::GateError;
use meshflip_lock::LockError;

use crate::platform::PlatformError;

pub type DeployResult<T> = Result<T, DeployError>;

/// Reasons a cutover run stops.
#[derive(Debug, Error)]
pub enum DeployError {
    /// A named resource is missing or unusable; needs an operator.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("deployment key {key:?} is locked: {comment}")]
    LockConflict { key: String, comment: String },

    #[error("health of {stage} did not converge ({phase}) after {polls} polls")]
    HealthTimeout {
        stage: &'static str,
        phase: String,
        polls: u32,
    },

    #[error("deployment cancelled while waiting for {stage}")]
    Cancelled { stage: &'static str },

    #[error("health probe failed: {0}")]
    HealthProbe(#[source] GateError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("lock store error: {0}")]
    Lock(#[source] LockError),

    #[error(transparent)]
    Spec(#[from] SpecError),
}

impl DeployError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

impl From<LockError> for DeployError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Conflict { existing } => DeployError::LockConflict {
                key: existing.key,
                comment: existing.comment,
            },
            other => DeployError::Lock(other),
        }
    }
}

impl From<GateError> for DeployError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Timeout {
                stage,
                phase,
                polls,
            } => DeployError::HealthTimeout {
                stage,
                phase: phase.to_string(),
                polls,
            },
            GateError::Cancelled { stage } => DeployError::Cancelled { stage },
            probe @ GateError::Probe { .. } => DeployError::HealthProbe(probe),
        }
    }
}
