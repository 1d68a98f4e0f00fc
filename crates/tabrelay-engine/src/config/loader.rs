use super::schema::TabrelayConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from default locations:
    /// 1. ./tabrelay.yaml
    /// 2. ~/.tabrelay/config.yaml
    /// 3. Default configuration
    pub async fn load_default() -> Result<TabrelayConfig, ConfigError> {
        let local_config = PathBuf::from("./tabrelay.yaml");
        if local_config.exists() {
            return Self::load_from(&local_config).await;
        }

        if let Some(home) = dirs::home_dir() {
            let home_config = home.join(".tabrelay").join("config.yaml");
            if home_config.exists() {
                return Self::load_from(&home_config).await;
            }
        }

        Ok(TabrelayConfig::default())
    }

    pub async fn load_from(path: &Path) -> Result<TabrelayConfig, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<TabrelayConfig, ConfigError> {
        if content.trim().is_empty() {
            return Ok(TabrelayConfig::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }
}
