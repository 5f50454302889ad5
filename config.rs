//! Configuration management with environment variable support.
//!
//! This module provides [`Config`] for loading and validating sealpack
//! settings from JSON files and environment variables. The encryption profile,
//! compression algorithm and output file permissions are fixed and are not
//! part of the configuration.
//!
//! ## Environment Variables
//!
//! - `SEALPACK_KEY_PATH`: Override encryption key file path
//! - `SEALPACK_ARCHIVE_EXT`: Override the extension for default output names
//! - `SEALPACK_CONFIG`: Override config file path

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable names for configuration overrides
pub const ENV_KEY_PATH: &str = "SEALPACK_KEY_PATH";
pub const ENV_ARCHIVE_EXT: &str = "SEALPACK_ARCHIVE_EXT";
pub const ENV_CONFIG_PATH: &str = "SEALPACK_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub key_path: String,
    #[serde(default = "default_archive_extension")]
    pub archive_extension: String,
}

fn default_archive_extension() -> String {
    "spk".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_path: "./sealpack.key".to_string(),
            archive_extension: default_archive_extension(),
        }
    }
}

impl Config {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: Config = serde_json::from_str(&s)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s).with_context(|| format!("parsing config file {}", p))?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key_path) = env::var(ENV_KEY_PATH) {
            debug!(key_path = %key_path, "overriding key_path from environment");
            self.key_path = key_path;
        }

        if let Ok(ext) = env::var(ENV_ARCHIVE_EXT) {
            debug!(archive_extension = %ext, "overriding archive_extension from environment");
            self.archive_extension = ext;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.key_path.trim().is_empty() {
            anyhow::bail!("key_path cannot be empty");
        }

        let ext = self.archive_extension.trim();
        if ext.is_empty() || ext.contains(['/', '\\', '.']) {
            anyhow::bail!(
                "archive_extension must be a bare extension, got {:?}",
                self.archive_extension
            );
        }

        // Warn if key path looks like it might be in a public directory
        let key_path = Path::new(&self.key_path);
        if let Some(parent) = key_path.parent() {
            let parent_str = parent.to_string_lossy().to_lowercase();
            if parent_str.contains("public")
                || parent_str.contains("www")
                || parent_str.contains("htdocs")
            {
                warn!(
                    path = %self.key_path,
                    "key file path appears to be in a public directory - this is a security risk"
                );
            }
        }

        if self.key_path.contains("..") {
            warn!("key_path contains '..' - consider using absolute paths");
        }

        Ok(())
    }

    /// Create a new config with explicit values
    pub fn new(key_path: impl Into<String>, archive_extension: impl Into<String>) -> Self {
        Self {
            key_path: key_path.into(),
            archive_extension: archive_extension.into(),
        }
    }

    /// Default encrypted output for `input`: `<input>.<archive_extension>`.
    pub fn sealed_path(&self, input: &Path) -> PathBuf {
        let mut name = input.as_os_str().to_owned();
        name.push(".");
        name.push(&self.archive_extension);
        PathBuf::from(name)
    }

    /// Default decrypted output for `archive`: the archive path with this
    /// config's extension stripped, or `<archive>.out` otherwise.
    pub fn unsealed_path(&self, archive: &Path) -> PathBuf {
        match archive.extension() {
            Some(ext) if ext == self.archive_extension.as_str() => archive.with_extension(""),
            _ => {
                let mut name = archive.as_os_str().to_owned();
                name.push(".out");
                PathBuf::from(name)
            }
        }
    }
}
