use crate::backend::s3::S3Config;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    pub backend: BackendConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Localfs { root: PathBuf },
    S3(S3Config),
    /// Empty in-memory store; only useful for smoke tests.
    Memory,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DownloadConfig {
    /// Bytes pulled from a fetch source per reactor turn, and the largest
    /// slice a relay hands to its client at once.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_accept_timeout_ms() -> u64 {
    5000
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            accept_timeout_ms: default_accept_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl DownloadConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    #[serde(default = "default_metadata_capacity")]
    pub metadata_capacity: u64,
}

fn default_metadata_capacity() -> u64 {
    100_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_capacity: default_metadata_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Re-execute the current binary as a dedicated worker process.
    #[default]
    Process,
    /// Run the worker on its own thread and runtime inside this process.
    Thread,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    #[serde(default)]
    pub mode: WorkerMode,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.download.chunk_size == 0 {
            bail!("download.chunk_size must be greater than zero");
        }
        match &self.backend {
            BackendConfig::Localfs { root } if root.as_os_str().is_empty() => {
                bail!("backend.root must not be empty")
            }
            BackendConfig::S3(s3) if s3.bucket.is_empty() => {
                bail!("backend.bucket must not be empty")
            }
            _ => Ok(()),
        }
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    cfg.validate()?;
    Ok(cfg)
}
