//! Pipeline configuration loaded from TOML.
//!
//! Every key has a default, so an empty file (or no file) is a valid
//! configuration. Unknown keys are rejected to catch typos early.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stockdump_core::data::TableFormat;
use thiserror::Error;

/// zstd accepts negative "fast" levels down to -7 in the stable API.
pub const MIN_LEVEL: i32 = -7;
pub const MAX_LEVEL: i32 = 22;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    pub fetch: FetchConfig,
    pub consolidate: ConsolidateConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub manifest: PathBuf,
    pub dumps: PathBuf,
    pub table: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("dumps/manifests/yahoo.jsonl"),
            dumps: PathBuf::from("dumps/raw"),
            table: PathBuf::from("dumps/arrow/dump.parquet"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Concurrent fetch workers.
    pub concurrency: usize,
    /// Retries after the first attempt for transient failures.
    pub retries: u32,
    /// Per-request timeout.
    pub timeout_secs: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Minimum spacing between request starts across all workers.
    pub min_request_interval_ms: u64,
    /// zstd compression level for dumps.
    pub level: i32,
    /// Stop issuing new requests after this long.
    pub run_timeout_secs: Option<u64>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            retries: 2,
            timeout_secs: 15,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            min_request_interval_ms: 0,
            level: 3,
            run_timeout_secs: None,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsolidateConfig {
    pub format: TableFormat,
}

impl PipelineConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse from a TOML string and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let f = &self.fetch;
        if f.concurrency == 0 {
            return Err(ConfigError::Invalid("fetch.concurrency must be at least 1".into()));
        }
        if f.timeout_secs == 0 {
            return Err(ConfigError::Invalid("fetch.timeout_secs must be positive".into()));
        }
        if !(MIN_LEVEL..=MAX_LEVEL).contains(&f.level) {
            return Err(ConfigError::Invalid(format!(
                "fetch.level {} outside {MIN_LEVEL}..={MAX_LEVEL}",
                f.level
            )));
        }
        if f.base_delay_ms > f.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "fetch.base_delay_ms ({}) exceeds fetch.max_delay_ms ({})",
                f.base_delay_ms, f.max_delay_ms
            )));
        }
        Ok(())
    }
}
