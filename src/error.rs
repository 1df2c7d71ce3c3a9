//! Error types for transfer operations

use crate::transfer::multipart::SessionState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_INTEGRITY: i32 = 3;

/// Flat classification of a [`TransferError`], recorded in per-item outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AccessDenied,
    TransientNetwork,
    Service,
    IntegrityMismatch,
    PathScope,
    PartUpload,
    Cancelled,
    Configuration,
    Listing,
    DeleteFailed,
    Io,
    InvalidRequest,
    IllegalTransition,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::Service => "service",
            ErrorKind::IntegrityMismatch => "integrity_mismatch",
            ErrorKind::PathScope => "path_scope",
            ErrorKind::PartUpload => "part_upload",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Listing => "listing",
            ErrorKind::DeleteFailed => "delete_failed",
            ErrorKind::Io => "io",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::IllegalTransition => "illegal_transition",
        };
        f.write_str(name)
    }
}

/// One key that a batch delete could not remove
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFailure {
    /// Object key
    pub key: String,

    /// Store error code, when the store reported one
    pub code: Option<String>,

    /// Error message
    pub message: String,
}

impl DeleteFailure {
    pub fn new(key: impl Into<String>, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            code,
            message: message.into(),
        }
    }
}

/// Errors that can occur while moving data to or from an object store
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    /// Object or prefix absent
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Credentials rejected or insufficient permissions
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Timeouts, 5xx responses, connection resets, throttling
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Store error that is not worth retrying
    #[error("Store service error ({code}): {message}")]
    Service { code: String, message: String },

    /// Size or checksum disagreement after a transfer or during validation
    #[error("Integrity mismatch for {bucket}/{key}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        bucket: String,
        key: String,
        expected: String,
        actual: String,
    },

    /// Local path escapes the configured root
    #[error("Path {} is outside local root {}", .path.display(), .root.display())]
    PathScope { root: PathBuf, path: PathBuf },

    /// A multipart part exhausted its retries
    #[error(
        "Part {part_number} of upload {upload_id} for {bucket}/{key} failed after {attempts} attempt(s): {message}"
    )]
    PartUpload {
        bucket: String,
        key: String,
        upload_id: String,
        part_number: u32,
        attempts: u32,
        message: String,
    },

    /// Cooperative cancellation observed
    #[error("Transfer cancelled")]
    Cancelled,

    /// Invalid proxy, signer, credential or endpoint setup
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A listing page could not be fetched
    #[error("Listing {bucket}/{prefix} failed: {message}")]
    Listing {
        bucket: String,
        prefix: String,
        message: String,
    },

    /// Some keys of a batch delete were not removed
    #[error("Failed to delete {} object(s) from {bucket}", .failures.len())]
    DeleteFailed {
        bucket: String,
        failures: Vec<DeleteFailure>,
    },

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(String),

    /// The request itself is unusable (missing file list, empty prefix, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Multipart session state machine misuse
    #[error("Illegal multipart session transition {from} -> {to}")]
    IllegalTransition { from: SessionState, to: SessionState },

    /// Error with added context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<TransferError>,
    },
}

impl TransferError {
    /// Add context to an error
    pub fn context<S: Into<String>>(self, context: S) -> Self {
        TransferError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context layers removed
    pub fn root(&self) -> &TransferError {
        match self {
            TransferError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            TransferError::NotFound { .. } => ErrorKind::NotFound,
            TransferError::AccessDenied(_) => ErrorKind::AccessDenied,
            TransferError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            TransferError::Service { .. } => ErrorKind::Service,
            TransferError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            TransferError::PathScope { .. } => ErrorKind::PathScope,
            TransferError::PartUpload { .. } => ErrorKind::PartUpload,
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::Configuration(_) => ErrorKind::Configuration,
            TransferError::Listing { .. } => ErrorKind::Listing,
            TransferError::DeleteFailed { .. } => ErrorKind::DeleteFailed,
            TransferError::Io(_) => ErrorKind::Io,
            TransferError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            TransferError::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            TransferError::WithContext { .. } => unreachable!("root() strips context"),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            TransferError::TransientNetwork(_) => true,
            TransferError::Service { code, .. } => is_retryable_code(code),
            _ => false,
        }
    }

    /// Errors that stop a whole multi-file job instead of a single item
    pub fn aborts_job(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Cancelled | ErrorKind::Configuration | ErrorKind::Listing
        )
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Configuration
            | ErrorKind::AccessDenied
            | ErrorKind::InvalidRequest
            | ErrorKind::PathScope => EXIT_FATAL,
            ErrorKind::IntegrityMismatch => EXIT_INTEGRITY,
            _ => EXIT_PARTIAL,
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TransferError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        TransferError::TransientNetwork(format!("call timed out: {}", err))
    }
}

/// Check if a store error code is retryable
pub(crate) fn is_retryable_code(code: &str) -> bool {
    matches!(
        code,
        "RequestTimeout"
            | "ServiceUnavailable"
            | "InternalError"
            | "SlowDown"
            | "Throttling"
            | "ThrottlingException"
            | "RequestTimeTooSkewed"
    )
}
