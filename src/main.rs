/*!
 * Stowage CLI - Command Line Interface
 *
 * Thin wrapper over `TransferCoordinator` backed by the S3 store provider.
 * Results go to stdout (text, or JSON with `--json`); logs go to stderr or
 * the configured log file.
 */

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use stowage::{
    config::{EngineConfig, LogLevel},
    error::{EXIT_FATAL, EXIT_PARTIAL, EXIT_SUCCESS},
    logging,
    store::{S3StoreProvider, ServerSideEncryption},
    transfer::{CopyRequest, GetRequest},
    TransferCoordinator, TransferError, TransferRequest, TransferResult,
};
use tracing::warn;

#[derive(Parser)]
#[command(name = "stowage")]
#[command(version, about = "Move files, file lists and directory trees to and from S3-compatible object stores", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// AWS region
    #[arg(long, global = true)]
    region: Option<String>,

    /// Custom endpoint URL for S3-compatible services
    #[arg(long, value_name = "URL", global = true)]
    endpoint: Option<String>,

    /// Use path-style addressing
    #[arg(long, global = true)]
    path_style: bool,

    /// Send unsigned requests
    #[arg(long, global = true)]
    no_sign_request: bool,

    /// Maximum network operations in flight
    #[arg(long, value_name = "N", global = true)]
    concurrency: Option<usize>,

    /// Server-side encryption for written objects
    #[arg(long, value_enum, global = true)]
    sse: Option<SseArg>,

    /// KMS key id, with `--sse aws-kms`
    #[arg(long, value_name = "KEY_ID", global = true)]
    kms_key: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log level
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show object metadata
    Stat { bucket: String, key: String },

    /// Check that an object exists with the given size
    Validate {
        bucket: String,
        key: String,
        #[arg(long)]
        size: u64,
    },

    /// Create a directory marker
    Mkdir { bucket: String, prefix: String },

    /// List keys under a prefix
    Ls {
        bucket: String,
        #[arg(default_value = "")]
        prefix: String,
        /// Hide zero-byte directory markers
        #[arg(long)]
        no_markers: bool,
    },

    /// Upload one file to a key
    Put {
        local: PathBuf,
        bucket: String,
        key: String,
    },

    /// Upload listed files, keys relative to --root
    PutList {
        bucket: String,
        prefix: String,
        #[arg(long, value_name = "DIR")]
        root: PathBuf,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Upload a directory tree
    PutDir {
        local: PathBuf,
        bucket: String,
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Download one object
    Get {
        bucket: String,
        key: String,
        local: PathBuf,
    },

    /// Download every object under a prefix
    GetDir {
        bucket: String,
        prefix: String,
        local: PathBuf,
    },

    /// Server-side copy to the same key in another bucket
    Cp {
        source_bucket: String,
        key: String,
        target_bucket: String,
    },

    /// Delete one object
    Rm { bucket: String, key: String },

    /// Delete listed keys
    RmList {
        bucket: String,
        #[arg(required = true)]
        keys: Vec<PathBuf>,
    },

    /// Delete every key under a prefix
    RmDir { bucket: String, prefix: String },

    /// Abort multipart uploads older than a cutoff
    Reap {
        bucket: String,
        #[arg(long, default_value = "24")]
        older_than_hours: i64,
    },

    /// Presigned GET URL
    Presign {
        bucket: String,
        key: String,
        #[arg(long, default_value = "3600")]
        expires_secs: i64,
    },

    /// Print an object parsed as key=value properties
    CatProps { bucket: String, key: String },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum SseArg {
    None,
    Aes256,
    AwsKms,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<TransferError>()
                .map(TransferError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    let config = effective_config(&cli)?;

    if let Err(e) = logging::init_logging(&config.logging, cli.verbose) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(execute(cli, config))
}

/// Configuration file overlaid with command-line flags
fn effective_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    if let Some(region) = &cli.region {
        config.client.region = Some(region.clone());
    }
    if let Some(endpoint) = &cli.endpoint {
        config.client.endpoint = Some(endpoint.clone());
    }
    config.client.force_path_style |= cli.path_style;
    config.client.no_sign_request |= cli.no_sign_request;
    if let Some(concurrency) = cli.concurrency {
        config.transfer.max_concurrency = concurrency;
    }
    if let Some(sse) = cli.sse {
        config.transfer.server_side_encryption = match sse {
            SseArg::None => ServerSideEncryption::None,
            SseArg::Aes256 => ServerSideEncryption::Aes256,
            SseArg::AwsKms => ServerSideEncryption::AwsKms {
                key_id: cli.kms_key.clone(),
            },
        };
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level.into();
    }

    config.client.validate()?;
    Ok(config)
}

async fn execute(cli: Cli, config: EngineConfig) -> anyhow::Result<i32> {
    let coordinator = TransferCoordinator::new(Arc::new(S3StoreProvider::new()));

    let cancel = coordinator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling transfers");
            cancel.cancel();
        }
    });

    let json = cli.json;
    let req = |bucket: &str, prefix: &str, local: PathBuf| config.request(bucket, prefix, local);

    match cli.command {
        Commands::Stat { bucket, key } => {
            let meta = coordinator
                .get_object_metadata(&req(&bucket, &key, PathBuf::new()))
                .await?
                .ok_or(TransferError::NotFound { bucket, key })?;
            print_value(json, &meta, |m| {
                format!(
                    "size: {}\netag: {}\nlast-modified: {}\ncontent-type: {}",
                    m.size,
                    m.etag.as_deref().unwrap_or("-"),
                    m.last_modified.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string()),
                    m.content_type.as_deref().unwrap_or("-")
                )
            })?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Validate { bucket, key, size } => {
            coordinator
                .validate_file(&req(&bucket, &key, PathBuf::new()), size)
                .await?;
            println!("OK {}/{} ({} bytes)", bucket, key, size);
            Ok(EXIT_SUCCESS)
        }
        Commands::Mkdir { bucket, prefix } => {
            coordinator
                .create_directory(&req(&bucket, &prefix, PathBuf::new()))
                .await?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Ls {
            bucket,
            prefix,
            no_markers,
        } => {
            let files = coordinator
                .list_directory(&req(&bucket, &prefix, PathBuf::new()), no_markers)
                .await?;
            print_value(json, &files, |files| {
                files
                    .iter()
                    .map(|f| format!("{:>12}  {}", f.file_size_bytes, f.file_path))
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Put { local, bucket, key } => {
            let result = coordinator.upload_file(&req(&bucket, &key, local)).await?;
            report(json, &result)
        }
        Commands::PutList {
            bucket,
            prefix,
            root,
            files,
        } => {
            let request = req(&bucket, &prefix, root).with_files(files);
            let result = coordinator.upload_file_list(&request).await?;
            report(json, &result)
        }
        Commands::PutDir {
            local,
            bucket,
            prefix,
        } => {
            let result = coordinator
                .upload_directory(&req(&bucket, &prefix, local))
                .await?;
            report(json, &result)
        }
        Commands::Get { bucket, key, local } => {
            let result = coordinator.download_file(&req(&bucket, &key, local)).await?;
            report(json, &result)
        }
        Commands::GetDir {
            bucket,
            prefix,
            local,
        } => {
            let result = coordinator
                .download_directory(&req(&bucket, &prefix, local))
                .await?;
            report(json, &result)
        }
        Commands::Cp {
            source_bucket,
            key,
            target_bucket,
        } => {
            let copy = CopyRequest::new(source_bucket, key, target_bucket)
                .with_client(config.client.clone())
                .with_retry(config.retry.to_policy())
                .with_server_side_encryption(config.transfer.server_side_encryption.clone())
                .with_max_concurrency(config.transfer.max_concurrency);
            let result = coordinator.copy_file(&copy).await?;
            report(json, &result)
        }
        Commands::Rm { bucket, key } => {
            coordinator
                .delete_file(&req(&bucket, &key, PathBuf::new()))
                .await?;
            Ok(EXIT_SUCCESS)
        }
        Commands::RmList { bucket, keys } => {
            let request = req(&bucket, "", PathBuf::new()).with_files(keys);
            let deleted = coordinator.delete_file_list(&request).await?;
            println!("Deleted {} object(s)", deleted);
            Ok(EXIT_SUCCESS)
        }
        Commands::RmDir { bucket, prefix } => {
            let deleted = coordinator
                .delete_directory(&req(&bucket, &prefix, PathBuf::new()))
                .await?;
            println!("Deleted {} object(s)", deleted);
            Ok(EXIT_SUCCESS)
        }
        Commands::Reap {
            bucket,
            older_than_hours,
        } => {
            let threshold = Utc::now() - ChronoDuration::hours(older_than_hours);
            let aborted = coordinator
                .abort_stale_multipart_uploads(&req(&bucket, "", PathBuf::new()), threshold)
                .await?;
            println!("Aborted {} multipart upload(s)", aborted);
            Ok(EXIT_SUCCESS)
        }
        Commands::Presign {
            bucket,
            key,
            expires_secs,
        } => {
            let expiration = Utc::now() + ChronoDuration::seconds(expires_secs);
            let url = coordinator
                .generate_presigned_get_url(&bucket, &key, expiration, &req(&bucket, "", PathBuf::new()))
                .await?;
            println!("{}", url);
            Ok(EXIT_SUCCESS)
        }
        Commands::CatProps { bucket, key } => {
            let props = coordinator
                .get_properties(&bucket, &key, &req(&bucket, "", PathBuf::new()))
                .await?;
            let sorted: std::collections::BTreeMap<_, _> = props.into_iter().collect();
            print_value(json, &sorted, |props| {
                props
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            Ok(EXIT_SUCCESS)
        }
        Commands::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(EXIT_SUCCESS)
        }
    }
}

fn print_value<T: Serialize>(json: bool, value: &T, text: impl Fn(&T) -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text(value));
    }
    Ok(())
}

/// Print a job result and pick the exit code
fn report(json: bool, result: &TransferResult) -> anyhow::Result<i32> {
    print_value(json, result, |r| {
        let mut lines = vec![format!(
            "{} file(s), {} byte(s) in {:.2}s ({:.1} MiB/s), {} failed",
            r.total_files,
            r.total_bytes,
            r.elapsed.as_secs_f64(),
            r.throughput() / (1024.0 * 1024.0),
            r.failed()
        )];
        for failure in r.failures() {
            lines.push(format!("FAILED {}: {:?}", failure.item, failure.status));
        }
        lines.join("\n")
    })?;

    Ok(if result.all_succeeded() {
        EXIT_SUCCESS
    } else {
        EXIT_PARTIAL
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "stowage",
            "--region",
            "eu-west-1",
            "--concurrency",
            "7",
            "--sse",
            "aws-kms",
            "--kms-key",
            "alias/k",
            "ls",
            "my-bucket",
        ]);
        let config = effective_config(&cli).unwrap();
        assert_eq!(config.client.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.transfer.max_concurrency, 7);
        assert_eq!(
            config.transfer.server_side_encryption,
            ServerSideEncryption::AwsKms {
                key_id: Some("alias/k".to_string())
            }
        );
    }
}
