//! Readiness probes polled by the gate.

use async_trait::async_trait;

/// Error type returned by probes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Counts the units of one stage that are not ready yet.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Stage label used in logs and errors, e.g. "tasks".
    fn stage(&self) -> &'static str;

    /// Number of units that are not ready.
    async fn count_unready(&self) -> Result<usize, BoxError>;

    /// Treat a failed poll as zero unready units instead of failing the
    /// gate.
    fn tolerates_errors(&self) -> bool {
        false
    }
}
