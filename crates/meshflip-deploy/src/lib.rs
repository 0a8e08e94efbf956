//! meshflip-deploy: blue/green cutover of a mesh-routed gRPC backend.
//!
//! One [`Orchestrator::run`] takes the deployment lock, collects what
//! earlier cutovers left behind, provisions a new mesh node and task set,
//! waits for them to become healthy, and then moves all traffic on the
//! route to the new node in a single write.
//!
//! # Components
//!
//! - **`collector`**: deletes mesh nodes and task sets the route no longer uses
//! - **`provisioner`**: compute service, mesh node, task revision, task set
//! - **`readiness`**: task and registry-instance probes for the health gate
//! - **`switch`**: 100% cutover of the mesh route
//! - **`orchestrator`**: sequences a run and reports its outcome
//! - **`platform`**: traits for the external systems and their resources
//! - **`memory`**: an in-memory implementation of every platform trait

pub mod collector;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod platform;
pub mod provisioner;
pub mod readiness;
pub mod report;
pub mod switch;

#[cfg(test)]
pub(crate) mod testutil;

pub use collector::{CollectionFailure, CollectionReport, GarbageCollector};
pub use error::{DeployError, DeployResult};
pub use memory::{InMemoryPlatform, Mutation};
pub use orchestrator::{Clock, DeployPhase, DeploymentOutcome, Orchestrator, Platform};
pub use provisioner::{EnsuredService, NewNode, Provisioner};
pub use readiness::{InstanceReadiness, TaskReadiness};
pub use report::LogReporter;
pub use switch::{TrafficSwitch, cut_over};
