//! meshflip-health: readiness gate for new task sets.
//!
//! After a task set is created the orchestrator blocks on the gate until
//! the compute tasks and then the discovery-registry instances have
//! converged. Each stage is two-phase:
//!
//! ```text
//! HealthGate::wait
//!   ├── stage "tasks"
//!   │   ├── AwaitTransition: unready count > 0 (new units showed up)
//!   │   └── AwaitReady:      unready count == 0 (all converged)
//!   └── stage "instances"
//!       ├── AwaitTransition
//!       └── AwaitReady
//! ```
//!
//! Polls back off exponentially while the observed count stays the same
//! and reset when it moves. An optional deadline and poll cap turn an
//! endless wait into a [`GateError::Timeout`], and a `watch` channel lets
//! the caller cancel the wait.

pub mod backoff;
pub mod error;
pub mod gate;
pub mod probe;

pub use backoff::PollBackoff;
pub use error::{GateError, GateResult};
pub use gate::{GatePhase, GateReport, HealthGate, StageReport};
pub use probe::{BoxError, ReadinessProbe};
