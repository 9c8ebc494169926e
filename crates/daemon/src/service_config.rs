//! TOML configuration file handling, and the write-back seam the model
//! uses when it adopts a peer's self-reported name.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use driftfs_common::config::ConfigError;
use driftfs_common::{Config, ConfigPersister};

#[derive(Debug, Error)]
pub enum ServiceConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config encode error: {0}")]
    Encode(#[from] toml::ser::Error),
}

pub fn load_config(path: &Path) -> Result<Config, ServiceConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config = toml::from_str(&raw)?;
    debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

pub fn save_config(path: &Path, config: &Config) -> Result<(), ServiceConfigError> {
    let raw = toml::to_string_pretty(config)?;
    std::fs::write(path, raw)?;
    debug!(path = %path.display(), "configuration saved");
    Ok(())
}

/// Persists configuration updates back to the file they were loaded from.
pub struct FileConfigPersister {
    path: PathBuf,
}

impl FileConfigPersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigPersister for FileConfigPersister {
    fn persist(&self, config: &Config) -> Result<(), ConfigError> {
        save_config(&self.path, config).map_err(|e| ConfigError::Persist(e.to_string()))
    }
}
