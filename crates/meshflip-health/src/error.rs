//! Health gate error types.

use thiserror::Error;

use crate::gate::GatePhase;
use crate::probe::BoxError;

pub type GateResult<T> = Result<T, GateError>;

/// Ways a health wait can end without convergence.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("{stage} did not converge ({phase}) after {polls} polls")]
    Timeout {
        stage: &'static str,
        phase: GatePhase,
        polls: u32,
    },

    #[error("health wait for {stage} was cancelled")]
    Cancelled { stage: &'static str },

    #[error("{stage} probe failed: {source}")]
    Probe {
        stage: &'static str,
        #[source]
        source: BoxError,
    },
}
