//! Configuration management for rootsmith

pub mod schema;

pub use schema::{AuthMode, Config, Environment};

use crate::error::{RootsmithError, RootsmithResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const DEPLOYED_CACHE_DIR: &str = "/orchestrator/build";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rootsmith")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rootsmith")
    }

    /// Directory of the diff cache, honoring the config override.
    ///
    /// Deployed environments share `/orchestrator/build` with the orchestrator.
    pub fn cache_dir(config: &Config) -> PathBuf {
        if let Some(dir) = &config.cache.dir {
            return dir.clone();
        }
        if config.general.environment.is_local() {
            Self::state_dir().join("build")
        } else {
            PathBuf::from(DEPLOYED_CACHE_DIR)
        }
    }

    /// Root of the filesystem object store, honoring the config override
    pub fn storage_root(config: &Config) -> PathBuf {
        config
            .storage
            .root
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("storage"))
    }

    /// Get the audit log path
    pub fn audit_log_path() -> PathBuf {
        Self::state_dir().join("audit.log")
    }

    /// Load configuration, falling back to defaults if the file does not exist
    pub async fn load(&self) -> RootsmithResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> RootsmithResult<Config> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            RootsmithError::io(format!("reading config from {}", path.display()), e)
        })?;

        toml::from_str(&content).map_err(|e| RootsmithError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> RootsmithResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            RootsmithError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    async fn ensure_config_dir(&self) -> RootsmithResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| RootsmithError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
