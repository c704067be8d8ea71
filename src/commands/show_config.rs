//! Show-config command implementation

use anyhow::{Context, Result};
use regime_exit_engine::EngineConfig;
use std::path::Path;
use tracing::{info, warn};

pub fn run(config_path: String) -> Result<()> {
    let config = if Path::new(&config_path).exists() {
        info!("Loading configuration from: {}", config_path);
        EngineConfig::from_file(&config_path)?
    } else {
        warn!("Config file {} not found, showing defaults", config_path);
        EngineConfig::default().with_env_overrides().sanitized()
    };

    let json = serde_json::to_string_pretty(&config).context("Failed to serialize config")?;
    println!("{json}");
    Ok(())
}
