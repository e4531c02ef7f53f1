use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Default minutes between the end of one cycle and the start of the next
pub const DEFAULT_INTERVAL_MINUTES: u64 = 5;
/// Smallest interval the scheduler accepts
pub const MIN_INTERVAL_MINUTES: u64 = 1;
/// Largest interval the scheduler accepts (one week)
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;
/// Largest re-fetch window behind the watermark (one week)
pub const MAX_LOOKBACK_MINUTES: u64 = 7 * 24 * 60;
/// Stream fetched when the configuration does not list any
pub const DEFAULT_STREAM: &str = "pump_events";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_streams")]
    pub streams: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub parse_batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub extract_batch_size: usize,
    /// Re-request this many minutes before the watermark to pick up events
    /// the vendor made visible late. Overlap is absorbed by external id dedup.
    #[serde(default)]
    pub lookback_minutes: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            streams: default_streams(),
            parse_batch_size: default_batch_size(),
            extract_batch_size: default_batch_size(),
            lookback_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub path: String,
    /// Maximum size of a single log file in megabytes
    #[serde(default = "default_log_size")]
    pub size: u64,
    #[serde(default = "default_log_max_files")]
    pub max_files: usize,
}

fn default_page_size() -> u32 {
    500
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_interval_minutes() -> u64 {
    DEFAULT_INTERVAL_MINUTES
}

fn default_streams() -> Vec<String> {
    vec![DEFAULT_STREAM.to_string()]
}

fn default_batch_size() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_size() -> u64 {
    10
}

fn default_log_max_files() -> usize {
    5
}

impl Config {
    /// Check the invariants the pipeline relies on. Runs before the scheduler
    /// leaves `Idle` for the first time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.interval_minutes < MIN_INTERVAL_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "interval_minutes must be at least {MIN_INTERVAL_MINUTES}, got {}",
                self.pipeline.interval_minutes
            )));
        }
        if self.pipeline.interval_minutes > MAX_INTERVAL_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "interval_minutes must be at most {MAX_INTERVAL_MINUTES}, got {}",
                self.pipeline.interval_minutes
            )));
        }
        if self.pipeline.lookback_minutes > MAX_LOOKBACK_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "lookback_minutes must be at most {MAX_LOOKBACK_MINUTES}, got {}",
                self.pipeline.lookback_minutes
            )));
        }
        if self.pipeline.streams.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one stream must be configured".to_string(),
            ));
        }
        if self.pipeline.streams.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "stream names must not be empty".to_string(),
            ));
        }
        if let Some(stream) = self
            .pipeline
            .streams
            .iter()
            .find(|s| s.contains(['/', '?', '#', '%']))
        {
            return Err(ConfigError::Invalid(format!(
                "stream name {stream:?} must not contain '/', '?', '#' or '%'"
            )));
        }
        if self.pipeline.parse_batch_size == 0 || self.pipeline.extract_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch sizes must be at least 1".to_string(),
            ));
        }
        if self.api.page_size == 0 {
            return Err(ConfigError::Invalid(
                "api.page_size must be at least 1".to_string(),
            ));
        }
        if self.api.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "api.request_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn parse_config(text: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(text)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config_text = fs::read_to_string(Path::new(path)).map_err(|e| ConfigError::Read {
        path: path.to_string(),
        source: e,
    })?;
    parse_config(&config_text)
}
