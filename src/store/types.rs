//! Types shared by object store implementations

use crate::error::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Streamed object body
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Metadata of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Size in bytes
    pub size: u64,

    /// Content hash (ETag)
    pub etag: Option<String>,

    /// Last modified timestamp
    pub last_modified: Option<DateTime<Utc>>,

    /// Content type
    pub content_type: Option<String>,
}

/// One entry of a listing page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    /// Object key
    pub key: String,

    /// Size in bytes
    pub size: u64,

    /// ETag
    pub etag: Option<String>,

    /// Last modified timestamp
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a paginated listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Objects in store order
    pub objects: Vec<ObjectSummary>,

    /// Token for the next page, `None` when the listing is exhausted
    pub next_token: Option<String>,
}

/// Inclusive byte range of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Range covering `len` bytes starting at `start`. `len` must be non-zero.
    pub fn from_offset(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start + len.saturating_sub(1),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// HTTP `Range` header value
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Body of a put request
#[derive(Debug, Clone)]
pub enum PutPayload {
    /// In-memory bytes
    Bytes(Bytes),

    /// Whole local file of known length
    File { path: PathBuf, length: u64 },
}

impl PutPayload {
    pub fn len(&self) -> u64 {
        match self {
            PutPayload::Bytes(b) => b.len() as u64,
            PutPayload::File { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Server-side encryption applied to written objects
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerSideEncryption {
    /// No encryption
    #[default]
    None,

    /// AES256 encryption
    Aes256,

    /// KMS encryption, optionally with an explicit key
    AwsKms { key_id: Option<String> },
}

/// Per-write options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub server_side_encryption: ServerSideEncryption,
    pub content_type: Option<String>,
}

/// Remote multipart session identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MultipartHandle {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// Uploaded part as reported back by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// Part number (1-based)
    pub part_number: u32,

    /// ETag returned by the store
    pub etag: String,

    /// Size of the part in bytes
    pub size: u64,
}

/// An in-flight multipart upload as reported by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartUploadSummary {
    pub key: String,
    pub upload_id: String,
    pub initiated_at: DateTime<Utc>,
}

/// HTTP method a presigned URL grants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresignMethod {
    Get,
}

/// Input for presigned URL generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUrlSpec {
    pub bucket: String,
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

impl PresignedUrlSpec {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            expires_at,
        }
    }

    /// Presigned URLs are read-only
    pub fn method(&self) -> PresignMethod {
        PresignMethod::Get
    }
}

/// Minimum multipart part size (5 MiB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum multipart part size (5 GiB)
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum number of parts in a multipart upload
pub const MAX_PARTS: u32 = 10_000;

/// Multipart limits of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub max_parts: u32,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            min_part_size: MIN_PART_SIZE,
            max_part_size: MAX_PART_SIZE,
            max_parts: MAX_PARTS,
        }
    }
}
