use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    pub sync: Option<SyncSection>,
    pub catalog: Option<CatalogSection>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SyncSection {
    pub thread_id: Option<String>,
    pub page_limit: Option<u32>,
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CatalogSection {
    pub users_file: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        let config_path = config_dir.join("reelvault").join("config.toml");

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            anyhow::anyhow!(
                "failed to read config file at {}: {}",
                config_path.display(),
                e
            )
        })?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse config file: {}", e))?;

        Ok(config)
    }
}
