//! Configuration surface consumed by the model.
//!
//! The model receives an immutable snapshot of this at construction. File
//! parsing lives in the daemon; the one mutation the core makes (adopting a
//! peer's self-reported name from its cluster config) is written back
//! through the [`ConfigPersister`] seam.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{DeviceId, DEFAULT_BLOCK_SIZE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot parse byte size {0:?}")]
    InvalidByteSize(String),
    #[error("failed to persist configuration: {0}")]
    Persist(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name this device advertises in its cluster config.
    #[serde(default)]
    pub device_name: String,
    pub mount_point: PathBuf,
    #[serde(default)]
    pub listen_address: String,
    #[serde(default = "default_true")]
    pub local_announce_enabled: bool,
    #[serde(default = "default_true")]
    pub global_announce_enabled: bool,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub folders: Vec<FolderConfig>,
}

fn default_true() -> bool {
    true
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

impl Config {
    pub fn device(&self, id: &DeviceId) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.device_id == *id)
    }

    pub fn device_mut(&mut self, id: &DeviceId) -> Option<&mut DeviceConfig> {
        self.devices.iter_mut().find(|d| d.device_id == *id)
    }

    pub fn folder(&self, id: &str) -> Option<&FolderConfig> {
        self.folders.iter().find(|f| f.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: DeviceId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub cert_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfig {
    /// Globally unique folder id; also the name of the blob directory and
    /// the store key prefix.
    pub id: String,
    /// Peers authorized for this folder.
    pub devices: Vec<DeviceId>,
    /// Block cache budget, human-readable ("512 MiB").
    pub cache_size: String,
    /// Paths downloaded proactively and exempt from eviction.
    #[serde(default)]
    pub pinned_files: Vec<String>,
}

impl FolderConfig {
    pub fn cache_size_bytes(&self) -> Result<u64, ConfigError> {
        parse_byte_size(&self.cache_size)
    }
}

/// Write-back for configuration changes made at run time.
pub trait ConfigPersister: Send + Sync {
    fn persist(&self, config: &Config) -> Result<(), ConfigError>;
}

/// Parse a human-readable byte size such as `"512 MiB"`, `"1.5GB"` or
/// `"4096"`. Decimal (kB/MB/…) and binary (KiB/MiB/…) units are accepted,
/// case-insensitively.
pub fn parse_byte_size(input: &str) -> Result<u64, ConfigError> {
    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| ConfigError::InvalidByteSize(input.to_string()))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1000,
        "kib" => 1 << 10,
        "mb" => 1000 * 1000,
        "mib" => 1 << 20,
        "gb" => 1000 * 1000 * 1000,
        "gib" => 1 << 30,
        "tb" => 1000 * 1000 * 1000 * 1000,
        "tib" => 1 << 40,
        _ => return Err(ConfigError::InvalidByteSize(input.to_string())),
    };

    if value < 0.0 || !value.is_finite() {
        return Err(ConfigError::InvalidByteSize(input.to_string()));
    }

    Ok((value * multiplier as f64) as u64)
}
