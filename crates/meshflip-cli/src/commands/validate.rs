use std::path::Path;

use meshflip_core::{MeshflipConfig, NetworkPlacement};

pub fn validate(config_path: &Path) -> anyhow::Result<()> {
    let config = MeshflipConfig::from_file(config_path)?;
    if let Err(e) = config.validate() {
        eprintln!("✗ {}: {e}", config_path.display());
        return Err(e.into());
    }

    println!("✓ {} ({} environments)", config_path.display(), config.environments.len());
    for spec in &config.environments {
        let placement = match spec.network {
            NetworkPlacement::Static { .. } => "static",
            NetworkPlacement::Discover => "discover",
        };
        println!(
            "  {:<24} mesh={} service={} network={placement}",
            spec.key.as_deref().unwrap_or("-"),
            spec.mesh_name,
            spec.compute_service_name,
        );
    }
    Ok(())
}
