//! Configuration file management.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use quickblue_core::QuickBlueConfig;
use serde::{Deserialize, Serialize};

/// Default scan duration when neither the flag nor the file sets one.
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 10;

/// Configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log filter used when `RUST_LOG` is unset (e.g. "info", "quickblue_core=debug")
    #[serde(default)]
    pub log_level: Option<String>,

    /// Scan duration in seconds for the `scan` command
    #[serde(default)]
    pub scan_timeout_secs: Option<u64>,

    /// Settings passed to the bridge core
    #[serde(default)]
    pub core: QuickBlueConfig,
}

impl Config {
    /// Get the default config file path
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quickblue")
            .join("config.toml")
    }

    /// Load config from `path` (or the default path). A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(Self::path, Path::to_path_buf);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Scan duration, preferring an explicit override.
    pub fn scan_timeout(&self, flag: Option<u64>) -> u64 {
        flag.or(self.scan_timeout_secs)
            .unwrap_or(DEFAULT_SCAN_TIMEOUT_SECS)
    }
}
