use std::path::Path;

use meshflip_core::MeshflipConfig;

pub fn show(config: &Path, key: &str) -> anyhow::Result<()> {
    let config = MeshflipConfig::from_file(config)?;
    let spec = config.environment(key)?;
    println!("{}", serde_json::to_string_pretty(spec)?);
    Ok(())
}
