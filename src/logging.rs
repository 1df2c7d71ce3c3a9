/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::error::{Result, TransferError};

/// Initialize structured logging based on configuration
///
/// `verbose` forces debug level. `RUST_LOG`, when set, overrides both.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let env_filter = build_filter(effective_level(config, verbose))?;

    match (&config.file, config.json) {
        (Some(log_path), _) => init_file_logging(log_path, env_filter),
        (None, true) => init_json_stderr_logging(env_filter),
        (None, false) => init_stderr_logging(env_filter),
    }
}

fn effective_level(config: &LoggingConfig, verbose: bool) -> Level {
    if verbose {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    }
}

fn build_filter(level: Level) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("stowage={}", level)))
        .map_err(|e| TransferError::Configuration(format!("Failed to create log filter: {}", e)))
}

/// Compact human-readable logs on stderr, keeping stdout for results
fn init_stderr_logging(env_filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TransferError::Configuration(format!("Logging already initialized: {}", e)))
}

fn init_json_stderr_logging(env_filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TransferError::Configuration(format!("Logging already initialized: {}", e)))
}

/// Initialize logging to a file
fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(log_path)
        .map_err(|e| TransferError::Configuration(format!("Failed to create log file: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false) // No ANSI colors in file
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TransferError::Configuration(format!("Logging already initialized: {}", e)))
}

/// Initialize logging with custom format for testing
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stowage=debug"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok(); // Ignore error if already initialized
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_verbose_overrides_log_level() {
        let config = LoggingConfig {
            level: LogLevel::Error,
            ..Default::default()
        };
        assert_eq!(effective_level(&config, true), Level::DEBUG);
        assert_eq!(effective_level(&config, false), Level::ERROR);
    }

    #[test]
    fn test_filter_builds_for_every_level() {
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert!(build_filter(level.to_tracing_level()).is_ok());
        }
    }

    #[test]
    fn test_init_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::debug!("test logging initialized");
    }
}
