use crate::engine::QueueSettings;
use crate::policy::{RetryPolicy, DEFAULT_DELETE_STATUSES};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors found while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the upload queue service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Queue configuration
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Upload queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Root directory holding the pending/ and failed/ job stores
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Seconds per worker iteration, split in two sleeps
    #[serde(default = "default_execute_rate_secs")]
    pub execute_rate_secs: f64,
    /// Iterations between attempts from the failed store
    #[serde(default = "default_fail_skip_factor")]
    pub fail_skip_factor: u32,
    /// HTTP timeout per submission in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Failed retries allowed before a job is abandoned
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Log every server response at info level
    #[serde(default)]
    pub verbose: bool,
    /// Status codes that end a job; every other status is retried
    #[serde(default = "default_delete_statuses")]
    pub delete_statuses: Vec<u16>,
}

// Default value functions
fn default_service_name() -> String {
    "upload-queue".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("upload-queue")
}

fn default_execute_rate_secs() -> f64 {
    1.0
}

fn default_fail_skip_factor() -> u32 {
    20
}

fn default_timeout_secs() -> f64 {
    20.0
}

fn default_max_retries() -> u32 {
    50
}

fn default_delete_statuses() -> Vec<u16> {
    DEFAULT_DELETE_STATUSES.to_vec()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/uploader").required(false))
            .add_source(config::File::with_name("/etc/upload-queue/uploader").required(false))
            // Override with environment variables
            // UPLOADER__QUEUE__STORAGE_DIR -> queue.storage_dir
            .add_source(
                config::Environment::with_prefix("UPLOADER")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("queue.delete_statuses"),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired("queue.storage_dir".to_string()));
        }

        for (key, value) in [
            ("queue.execute_rate_secs", self.queue.execute_rate_secs),
            ("queue.timeout_secs", self.queue.timeout_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("must be a positive number of seconds, got {value}"),
                });
            }
        }

        Ok(())
    }
}

impl QueueConfig {
    /// Runtime settings for the worker
    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            timeout: Duration::from_secs_f64(self.timeout_secs),
            execute_rate: Duration::from_secs_f64(self.execute_rate_secs),
            fail_skip_factor: self.fail_skip_factor,
            max_retries: self.max_retries,
            verbose: self.verbose,
        }
    }

    /// Retry policy deleting jobs for `delete_statuses`
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::deleting(self.delete_statuses.iter().copied())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            execute_rate_secs: default_execute_rate_secs(),
            fail_skip_factor: default_fail_skip_factor(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            verbose: false,
            delete_statuses: default_delete_statuses(),
        }
    }
}
