//! Loader configuration.
//!
//! Loaded from `~/.eegpipe/config.toml` or an explicit path. Only
//! `data-root` is required:
//!
//! ```toml
//! data-root = "/data/tuh_eeg_artifact"
//! cache-root = "/scratch/eegpipe"        # defaults to data-root
//! index-path = "/data/index.sqlite"      # defaults to <data-root>/index.sqlite
//! workers = 8                            # defaults to available parallelism
//! excluded-channel-refs = ["02_tcp_le", "03_tcp_ar_a"]
//! compression-level = 3
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::{CacheSettings, DEFAULT_COMPRESSION_LEVEL};
use crate::index::DEFAULT_EXCLUDED_CHANNEL_REFS;
use crate::materialize::available_workers;

/// Errors loading or validating a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    NoHomeDir,

    #[error(
        "no config file found at {}\n\
         Create one with at minimum:\n\n  \
         data-root = \"/path/to/dataset\"",
        .0.display()
    )]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config at {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
}

/// Dataset loader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Root the indexed recording paths are relative to.
    pub data_root: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_root: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_path: Option<PathBuf>,

    /// Materialization workers. Unset means one per available core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Montages left out of datasets and channel sets.
    #[serde(default = "default_excluded_channel_refs")]
    pub excluded_channel_refs: Vec<String>,

    /// zstd level for stored artifacts.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

fn default_excluded_channel_refs() -> Vec<String> {
    DEFAULT_EXCLUDED_CHANNEL_REFS
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_compression_level() -> i32 {
    DEFAULT_COMPRESSION_LEVEL
}

impl Config {
    /// A config for `data_root` with every other key at its default.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            cache_root: None,
            index_path: None,
            workers: None,
            excluded_channel_refs: default_excluded_channel_refs(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }

    /// Load config from `~/.eegpipe/config.toml`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path().ok_or(ConfigError::NoHomeDir)?;
        Self::load_from(&path)
    }

    /// Load and validate the config file at `path`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate().map_err(|reason| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        })?;

        Ok(config)
    }

    /// The config file path: `~/.eegpipe/config.toml`.
    pub fn path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".eegpipe").join("config.toml"))
    }

    fn validate(&self) -> Result<(), String> {
        if self.data_root.as_os_str().is_empty() {
            return Err("data-root is empty".into());
        }
        if self.workers == Some(0) {
            return Err("workers must be at least 1".into());
        }
        let levels = zstd::compression_level_range();
        if !levels.contains(&self.compression_level) {
            return Err(format!(
                "compression-level {} is outside {}..={}",
                self.compression_level,
                levels.start(),
                levels.end()
            ));
        }
        Ok(())
    }

    /// Where derived artifacts are stored.
    pub fn cache_root(&self) -> PathBuf {
        self.cache_root
            .clone()
            .unwrap_or_else(|| self.data_root.clone())
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.data_root.join("index.sqlite"))
    }

    /// The configured worker count, or the host's available parallelism.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(available_workers).max(1)
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            root: self.cache_root(),
            compression_level: self.compression_level,
        }
    }
}
