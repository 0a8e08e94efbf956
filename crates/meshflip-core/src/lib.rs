//! meshflip-core: shared types for the meshflip cutover tooling.
//!
//! Holds the immutable [`DeploymentSpec`] consumed by every other crate,
//! the naming rules that tie mesh nodes, task sets and sidecars together,
//! and the `meshflip.toml` environment table.

pub mod config;
pub mod error;
pub mod naming;
pub mod types;

pub use config::{HealthSettings, MeshflipConfig, parse_duration};
pub use error::{SpecError, SpecResult};
pub use naming::NodeNamePattern;
pub use types::*;
