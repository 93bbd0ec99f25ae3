//! Configuration structures and loading logic

use crate::downloader::DownloadPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Root of the model cache
    pub cache_dir: PathBuf,

    /// Manifest location; defaults to `<cache_dir>/manifest.json`
    pub manifest_file: Option<PathBuf>,

    /// Catalog of model descriptors
    pub catalog_file: PathBuf,

    pub max_parallel_models: usize,
    pub file_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub stall_timeout_secs: u64,

    /// Disk headroom multiplier for preflight
    pub buffer_ratio: f64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            manifest_file: None,
            catalog_file: default_catalog_file(),
            max_parallel_models: default_max_parallel_models(),
            file_attempts: default_file_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            stall_timeout_secs: default_stall_timeout_secs(),
            buffer_ratio: default_buffer_ratio(),
        }
    }
}

impl VaultConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(cache_dir) = std::env::var("MODELVAULT_CACHE_DIR") {
            config.cache_dir = PathBuf::from(cache_dir);
        }
        if let Ok(catalog) = std::env::var("MODELVAULT_CATALOG") {
            config.catalog_file = PathBuf::from(catalog);
        }
        if let Ok(parallelism) = std::env::var("MODELVAULT_PARALLELISM") {
            config.max_parallel_models = parallelism
                .parse()
                .context("Invalid MODELVAULT_PARALLELISM value")?;
        }

        Ok(config)
    }

    /// Validate configuration; performs no filesystem writes
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_models == 0 {
            anyhow::bail!("max_parallel_models must be >= 1");
        }
        if self.file_attempts == 0 {
            anyhow::bail!("file_attempts must be >= 1");
        }
        if self.buffer_ratio < 1.0 {
            anyhow::bail!(
                "buffer_ratio must be >= 1.0 (got {}); the buffer is headroom, not a discount",
                self.buffer_ratio
            );
        }
        if self.cache_dir.as_os_str().is_empty() {
            anyhow::bail!("cache_dir cannot be empty");
        }
        Ok(())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.manifest_file
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("manifest.json"))
    }

    /// Staging area for the hub backend's own cache layout
    pub fn staging_dir(&self) -> PathBuf {
        self.cache_dir.join(".staging")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn policy(&self) -> DownloadPolicy {
        DownloadPolicy {
            max_parallel_models: self.max_parallel_models,
            file_attempts: self.file_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            buffer_ratio: self.buffer_ratio,
        }
    }
}

// Default functions
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("modelvault"))
        .unwrap_or_else(|| PathBuf::from("/var/cache/modelvault"))
}
fn default_catalog_file() -> PathBuf {
    PathBuf::from("catalog.json")
}
fn default_max_parallel_models() -> usize {
    4
}
fn default_file_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_stall_timeout_secs() -> u64 {
    60
}
fn default_buffer_ratio() -> f64 {
    1.2
}
