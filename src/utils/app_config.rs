/// Application configuration management
/// Stores user preferences in ~/.config/qitlalli-backup/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub project_root: Option<String>,
    pub backup_root: Option<String>,
    pub stack: StackSettings,
    pub gcp: Option<GcpSettings>,
}

/// Overrides for the local Docker Compose stack; unset fields use defaults
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackSettings {
    pub db_service: Option<String>,
    pub app_service: Option<String>,
    pub db_user: Option<String>,
    pub database: Option<String>,
    pub filestore_path: Option<String>,
    pub config_dir: Option<String>,
    pub env_file: Option<String>,
    pub access_url: Option<String>,
    pub settle_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpSettings {
    pub project_id: Option<String>,
    pub region: Option<String>,
    pub db_instance: Option<String>,
    pub database: Option<String>,
    pub export_bucket: Option<String>,
    pub service_name: Option<String>,
    pub terraform_dir: Option<String>,
}

impl AppConfig {
    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("qitlalli-backup");

        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from a specific file; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .context("Failed to read config file")?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Set and save project root
    pub fn set_project_root(&mut self, root: PathBuf) -> Result<()> {
        self.project_root = Some(root.to_string_lossy().to_string());
        self.save()
    }
}
