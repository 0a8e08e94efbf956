use chrono::{DateTime, TimeZone, Utc};

use meshflip_core::{
    Capabilities, DEFAULT_LAUNCH_TYPE, DeploymentSpec, HealthSettings, NetworkPlacement,
    SidecarConfig,
};

/// A moment on 2023-01-01, UTC.
pub(crate) fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 1, 1, h, m, s).unwrap()
}

pub(crate) fn test_spec() -> DeploymentSpec {
    DeploymentSpec {
        key: Some("echo_server:prod".to_string()),
        mesh_name: "echo-mesh".to_string(),
        namespace_name: "echo.local".to_string(),
        service_name: "echo_server".to_string(),
        port: 8080,
        virtual_router_name: "virtual-router".to_string(),
        route_name: "route".to_string(),
        cluster_name: "echo".to_string(),
        compute_service_name: "echo_server-service".to_string(),
        task_definition_family: "echo_server".to_string(),
        network: NetworkPlacement::Static {
            subnets: vec!["subnet-a".to_string(), "subnet-b".to_string()],
            security_groups: vec!["sg-1".to_string()],
        },
        parameter_name: None,
        sidecar: SidecarConfig::default(),
        launch_type: DEFAULT_LAUNCH_TYPE.to_string(),
        capabilities: Capabilities::default(),
    }
}

/// Gate settings with a poll cap so a broken script cannot spin forever.
pub(crate) fn settings() -> HealthSettings {
    HealthSettings {
        max_polls: Some(20),
        ..Default::default()
    }
}
