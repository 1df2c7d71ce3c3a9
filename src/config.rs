/*!
 * Engine configuration file
 *
 * A TOML file with `[client]`, `[transfer]`, `[retry]` and `[logging]`
 * sections. Every field has a default, so an empty file is valid.
 *
 * ```toml
 * [client]
 * region = "eu-west-1"
 * endpoint = "http://localhost:9000"
 * force_path_style = true
 *
 * [transfer]
 * max_concurrency = 16
 * multipart_threshold = 33554432
 *
 * [retry]
 * max_attempts = 5
 * backoff = "exponential_with_jitter"
 *
 * [logging]
 * level = "debug"
 * json = true
 * ```
 */

use crate::error::{Result, TransferError};
use crate::store::{ClientConfig, ServerSideEncryption};
use crate::transfer::request::{
    TransferRequest, DEFAULT_MAX_CONCURRENCY, DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PART_SIZE,
};
use crate::transfer::retry::{BackoffStrategy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub client: ClientConfig,
    pub transfer: TransferSettings,
    pub retry: RetrySettings,
    pub logging: LoggingConfig,
}

/// Defaults applied to every transfer request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Maximum network calls in flight per invocation
    pub max_concurrency: usize,

    /// Size above which files go multipart (bytes)
    pub multipart_threshold: u64,

    /// Preferred part size (bytes)
    pub part_size: u64,

    pub server_side_encryption: ServerSideEncryption,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            server_side_encryption: ServerSideEncryption::None,
        }
    }
}

/// Retry policy in file form (durations in milliseconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: BackoffStrategy,
    pub jitter_factor: f64,

    /// Per-call timeout; unset means no timeout beyond the client's own
    pub call_timeout_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            backoff: policy.backoff,
            jitter_factor: policy.jitter_factor,
            call_timeout_ms: None,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff: self.backoff,
            jitter_factor: self.jitter_factor.clamp(0.0, 1.0),
            call_timeout: self.call_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Logging levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,

    /// Write logs to this file instead of stderr
    pub file: Option<PathBuf>,

    /// JSON lines instead of compact text
    pub json: bool,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TransferError::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
            .map_err(|e| e.context(format!("Invalid configuration file {}", path.display())))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(contents).map_err(|e| TransferError::Configuration(e.to_string()))?;
        config.client.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| TransferError::Configuration(e.to_string()))
    }

    /// A request carrying this configuration's defaults
    pub fn request(
        &self,
        bucket: impl Into<String>,
        key_prefix: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> TransferRequest {
        TransferRequest::new(bucket, key_prefix, local_path)
            .with_client(self.client.clone())
            .with_max_concurrency(self.transfer.max_concurrency)
            .with_retry(self.retry.to_policy())
            .with_multipart_threshold(self.transfer.multipart_threshold)
            .with_part_size(self.transfer.part_size)
            .with_server_side_encryption(self.transfer.server_side_encryption.clone())
    }
}
