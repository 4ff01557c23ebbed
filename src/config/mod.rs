//! Configuration for the coordination engine
//!
//! Reads and writes .foreman/config.yaml for project-specific settings.
//! Every field has a default so a missing or partial file always resolves
//! to a usable configuration.

use crate::utils::ResultExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration from .foreman/config.yaml (optional)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForemanConfig {
    /// Dispatch and retry settings
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// File lock settings
    #[serde(default)]
    pub locks: LockConfig,
}

/// Dispatch-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Failed attempts allowed before a story is terminally failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Cap on concurrently assigned stories; unset means one per idle agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<u32>,
}

/// Lock-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Seconds after which an unreleased lock may be reclaimed
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_stale_after_secs() -> u64 {
    30
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_parallel: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            locks: LockConfig::default(),
        }
    }
}

/// Configuration file manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager for a project
    pub fn new(project_path: &Path) -> Self {
        Self {
            config_path: project_path.join(".foreman").join("config.yaml"),
        }
    }

    /// Check if config file exists
    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Read config from file, returning defaults if not found
    pub fn read(&self) -> Result<ForemanConfig, String> {
        if !self.config_path.exists() {
            return Ok(ForemanConfig::default());
        }

        let content =
            std::fs::read_to_string(&self.config_path).with_context("Failed to read config file")?;

        serde_yaml::from_str(&content).with_context("Failed to parse config file")
    }

    /// Write config to file
    pub fn write(&self, config: &ForemanConfig) -> Result<(), String> {
        // Ensure parent directory exists
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).with_context("Failed to create config directory")?;
        }

        let content =
            serde_yaml::to_string(config).with_context("Failed to serialize config")?;

        std::fs::write(&self.config_path, content).with_context("Failed to write config file")
    }

    /// Initialize config with defaults if it doesn't exist
    pub fn initialize(&self) -> Result<ForemanConfig, String> {
        if self.exists() {
            return self.read();
        }

        let config = ForemanConfig::default();
        self.write(&config)?;
        Ok(config)
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

/// Resolved runtime settings handed to the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Root of the coordinated project; durable state lives in its .foreman dir
    pub project_path: PathBuf,
    pub max_retries: u32,
    pub max_parallel: Option<u32>,
    pub lock_stale_secs: u64,
}

impl CoordinatorConfig {
    /// Default settings for a project, ignoring any config file
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            max_retries: default_max_retries(),
            max_parallel: None,
            lock_stale_secs: default_stale_after_secs(),
        }
    }

    /// Resolve settings from the project's config file, with defaults for
    /// anything unset
    pub fn load(project_path: impl Into<PathBuf>) -> Result<Self, String> {
        let project_path = project_path.into();
        let file = ConfigManager::new(&project_path).read()?;

        Ok(Self {
            max_retries: file.dispatch.max_retries,
            max_parallel: file.dispatch.max_parallel,
            lock_stale_secs: file.locks.stale_after_secs,
            project_path,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_lock_stale_secs(mut self, secs: u64) -> Self {
        self.lock_stale_secs = secs;
        self
    }

    pub fn with_max_parallel(mut self, cap: u32) -> Self {
        self.max_parallel = Some(cap);
        self
    }
}
