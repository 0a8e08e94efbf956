//! Naming rules linking mesh nodes, task sets and sidecars.
//!
//! A mesh node is named `{service}-{timestamp}` with a UTC timestamp at
//! second resolution, so two nodes created for the same service within
//! the same second get the same name. Its task set carries the external
//! ID `{node}-task-set`, and the sidecar addresses it by the qualified
//! path `mesh/{mesh}/virtualNode/{node}`.

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::SpecResult;

/// Timestamp layout of the mesh node suffix.
pub const NODE_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Name of the mesh node created for `service` at `at`.
pub fn mesh_node_name(service: &str, at: DateTime<Utc>) -> String {
    format!("{service}-{}", at.format(NODE_TIMESTAMP_FORMAT))
}

/// External ID correlating a task set with the mesh node it serves.
pub fn external_id(node: &str) -> String {
    format!("{node}-task-set")
}

/// Path the sidecar uses to identify itself as `node`.
pub fn qualified_node_path(mesh: &str, node: &str) -> String {
    format!("mesh/{mesh}/virtualNode/{node}")
}

/// Inverse of [`qualified_node_path`] for a known mesh.
pub fn node_from_path<'a>(mesh: &str, path: &'a str) -> Option<&'a str> {
    path.strip_prefix("mesh/")?
        .strip_prefix(mesh)?
        .strip_prefix("/virtualNode/")
        .filter(|node| !node.is_empty())
}

/// Matches mesh node names generated for one service.
#[derive(Debug, Clone)]
pub struct NodeNamePattern {
    regex: Regex,
}

impl NodeNamePattern {
    pub fn new(service: &str) -> SpecResult<Self> {
        let regex = Regex::new(&format!("^{}-([0-9]+)$", regex::escape(service)))?;
        Ok(Self { regex })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}
