//! Transfer request values
//!
//! A request is built once and passed by reference to every coordinator
//! operation; nothing in the engine mutates it.

use super::retry::RetryPolicy;
use crate::error::{Result, TransferError};
use crate::store::{validate_bucket_name, ByteRange, ClientConfig, ServerSideEncryption, WriteOptions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Files above this size are uploaded as multipart sessions (16 MiB)
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Preferred multipart part size (8 MiB)
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Default network operations in flight per invocation
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Preferred part size of a multipart copy (100 MiB)
pub const DEFAULT_COPY_PART_SIZE: u64 = 100 * 1024 * 1024;

/// Upper bound accepted for `max_concurrency`
pub const MAX_CONCURRENCY_LIMIT: usize = 1024;

/// Describes one transfer job
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Target or source bucket
    pub bucket: String,

    /// Remote key prefix; the full key for single-file operations
    pub key_prefix: String,

    /// Local file or common parent directory
    pub local_path: PathBuf,

    /// Explicit file list for list operations, in submission order
    pub files: Option<Vec<PathBuf>>,

    /// Store connection settings
    pub client: ClientConfig,

    /// Maximum network calls in flight
    pub max_concurrency: usize,

    pub retry: RetryPolicy,

    /// Files larger than this use multipart upload and ranged download
    pub multipart_threshold: u64,

    /// Preferred part size, raised when the file would need too many parts
    pub part_size: u64,

    pub server_side_encryption: ServerSideEncryption,
}

impl TransferRequest {
    pub fn new(
        bucket: impl Into<String>,
        key_prefix: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key_prefix: key_prefix.into(),
            local_path: local_path.into(),
            files: None,
            client: ClientConfig::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryPolicy::default(),
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            server_side_encryption: ServerSideEncryption::None,
        }
    }

    pub fn with_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files = Some(files.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_multipart_threshold(mut self, threshold: u64) -> Self {
        self.multipart_threshold = threshold;
        self
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    pub fn with_server_side_encryption(mut self, sse: ServerSideEncryption) -> Self {
        self.server_side_encryption = sse;
        self
    }

    /// Check the request before any network call is made
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a bad bucket name or concurrency,
    /// `Configuration` for an unusable client configuration.
    pub fn validate(&self) -> Result<()> {
        validate_bucket_name(&self.bucket)?;
        if self.max_concurrency == 0 || self.max_concurrency > MAX_CONCURRENCY_LIMIT {
            return Err(TransferError::InvalidRequest(format!(
                "max_concurrency must be between 1 and {}, got {}",
                MAX_CONCURRENCY_LIMIT, self.max_concurrency
            )));
        }
        if self.part_size == 0 {
            return Err(TransferError::InvalidRequest(
                "part_size must be greater than zero".to_string(),
            ));
        }
        self.client.validate()
    }

    /// Write options for an object uploaded by this request
    pub fn write_options(&self, content_type: Option<String>) -> WriteOptions {
        WriteOptions {
            server_side_encryption: self.server_side_encryption.clone(),
            content_type,
        }
    }
}

/// Server-side copy of one object into another bucket under the same key
///
/// Sources too large for a single copy call are copied part by part;
/// `max_concurrency` and `part_size` apply to that path only.
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub source_bucket: String,
    pub source_key: String,
    pub target_bucket: String,
    pub server_side_encryption: ServerSideEncryption,
    pub client: ClientConfig,
    pub retry: RetryPolicy,
    pub max_concurrency: usize,
    pub part_size: u64,
}

impl CopyRequest {
    pub fn new(
        source_bucket: impl Into<String>,
        source_key: impl Into<String>,
        target_bucket: impl Into<String>,
    ) -> Self {
        Self {
            source_bucket: source_bucket.into(),
            source_key: source_key.into(),
            target_bucket: target_bucket.into(),
            server_side_encryption: ServerSideEncryption::None,
            client: ClientConfig::default(),
            retry: RetryPolicy::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            part_size: DEFAULT_COPY_PART_SIZE,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Encrypt the copy with a KMS key
    pub fn with_kms_key(mut self, key_id: impl Into<String>) -> Self {
        self.server_side_encryption = ServerSideEncryption::AwsKms {
            key_id: Some(key_id.into()),
        };
        self
    }

    pub fn with_server_side_encryption(mut self, sse: ServerSideEncryption) -> Self {
        self.server_side_encryption = sse;
        self
    }

    pub fn with_client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_bucket_name(&self.source_bucket)?;
        validate_bucket_name(&self.target_bucket)?;
        if self.source_key.is_empty() {
            return Err(TransferError::InvalidRequest(
                "copy source key must not be empty".to_string(),
            ));
        }
        if self.max_concurrency == 0 || self.max_concurrency > MAX_CONCURRENCY_LIMIT {
            return Err(TransferError::InvalidRequest(format!(
                "max_concurrency must be between 1 and {}, got {}",
                MAX_CONCURRENCY_LIMIT, self.max_concurrency
            )));
        }
        if self.part_size == 0 {
            return Err(TransferError::InvalidRequest(
                "part_size must be greater than zero".to_string(),
            ));
        }
        self.client.validate()
    }
}

/// Streaming read of one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub bucket: String,
    pub key: String,
    pub range: Option<ByteRange>,
}

impl GetRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            range: None,
        }
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_request_defaults() {
        let req = TransferRequest::new("bucket", "prefix/", "/tmp/data");
        assert_eq!(req.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(req.multipart_threshold, DEFAULT_MULTIPART_THRESHOLD);
        assert_eq!(req.part_size, DEFAULT_PART_SIZE);
        assert!(req.files.is_none());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_bucket = TransferRequest::new("No_Such", "p", "/tmp");
        assert_eq!(bad_bucket.validate().unwrap_err().kind(), ErrorKind::InvalidRequest);

        let zero = TransferRequest::new("bucket", "p", "/tmp").with_max_concurrency(0);
        assert_eq!(zero.validate().unwrap_err().kind(), ErrorKind::InvalidRequest);

        let huge = TransferRequest::new("bucket", "p", "/tmp").with_max_concurrency(5000);
        assert!(huge.validate().is_err());

        let mut client = ClientConfig::default();
        client.access_key = Some("AKIA".to_string());
        let half_creds = TransferRequest::new("bucket", "p", "/tmp").with_client(client);
        assert_eq!(half_creds.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_write_options_carry_encryption() {
        let req = TransferRequest::new("bucket", "p", "/tmp")
            .with_server_side_encryption(ServerSideEncryption::Aes256);
        let options = req.write_options(Some("text/csv".to_string()));
        assert_eq!(options.server_side_encryption, ServerSideEncryption::Aes256);
        assert_eq!(options.content_type.as_deref(), Some("text/csv"));
    }

    #[test]
    fn test_copy_request() {
        let copy = CopyRequest::new("src-bucket", "a/b.csv", "dst-bucket").with_kms_key("key-1");
        assert!(copy.validate().is_ok());
        assert_eq!(
            copy.server_side_encryption,
            ServerSideEncryption::AwsKms {
                key_id: Some("key-1".to_string())
            }
        );
        assert!(CopyRequest::new("src-bucket", "", "dst-bucket").validate().is_err());
        assert_eq!(copy.part_size, DEFAULT_COPY_PART_SIZE);

        let bad = CopyRequest::new("src-bucket", "k", "dst-bucket").with_max_concurrency(0);
        assert_eq!(bad.validate().unwrap_err().kind(), ErrorKind::InvalidRequest);
        let bad = CopyRequest::new("src-bucket", "k", "dst-bucket").with_part_size(0);
        assert_eq!(bad.validate().unwrap_err().kind(), ErrorKind::InvalidRequest);
    }
}
