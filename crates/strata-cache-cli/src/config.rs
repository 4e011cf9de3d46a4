//! CLI configuration management: where the cache lives on disk plus
//! repository scope, persisted the same way the rest of this codebase's
//! CLI tooling does — a YAML file under the platform's config directory.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    pub owner: Option<String>,
    pub repo: Option<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            owner: None,
            repo: None,
        }
    }
}

fn default_base_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "stratacache", "strata-cache")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".strata-cache"))
}

impl CliConfig {
    pub fn load() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
        let dirs = directories::ProjectDirs::from("dev", "stratacache", "strata-cache")
            .ok_or("could not determine config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }
}
