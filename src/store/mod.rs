//! Object store abstraction
//!
//! The [`ObjectStore`] trait is the capability surface the transfer engine
//! needs from a remote key/object store: metadata, paginated listing, whole
//! object put/get, multipart sessions, deletes, server-side copy (whole or
//! part by part) and presigned URLs. Implementations never retry; retry lives in the transfer layer, which
//! knows which calls are safe to repeat.
//!
//! Two implementations ship with the crate:
//!
//! - [`S3Store`] (feature `s3-native`): AWS SDK backed, for S3 and
//!   S3-compatible services
//! - [`MemoryStore`]: in-process store with latency and fault injection, used
//!   by tests
//!
//! # Example
//!
//! ```no_run
//! use stowage::store::{MemoryStore, ObjectStore};
//!
//! #[tokio::main]
//! async fn main() -> stowage::Result<()> {
//!     let store = MemoryStore::new();
//!     store.create_bucket("data");
//!     store.put_bytes("data", "a/b.txt", b"hello".to_vec());
//!
//!     let meta = store.head_object("data", "a/b.txt").await?;
//!     assert_eq!(meta.map(|m| m.size), Some(5));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod memory;
pub mod throttle;
pub mod types;

#[cfg(feature = "s3-native")]
pub mod cache;
#[cfg(feature = "s3-native")]
pub mod s3;

pub use config::{validate_bucket_name, ClientConfig, ClientConfigBuilder, ProxyConfig, SignerKind};
pub use memory::{MemoryStore, StoreCall};
pub use throttle::ThrottledStore;
pub use types::{
    ByteRange, ByteStream, CompletedPart, ListPage, MultipartHandle, MultipartUploadSummary,
    ObjectMetadata, ObjectSummary, PresignMethod, PresignedUrlSpec, PutPayload,
    ServerSideEncryption, StoreLimits, WriteOptions,
};

#[cfg(feature = "s3-native")]
pub use cache::S3StoreProvider;
#[cfg(feature = "s3-native")]
pub use s3::S3Store;

use crate::error::{DeleteFailure, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Remote object store capabilities
///
/// All operations may fail with a transport-level error. Absence of an object
/// on `head_object` is `Ok(None)`, not an error.
///
/// Implementors must be `Send + Sync`; one store is shared by every unit of a
/// transfer.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Multipart limits of this store
    fn limits(&self) -> StoreLimits {
        StoreLimits::default()
    }

    /// Fetch object metadata, `None` if the object does not exist
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMetadata>>;

    /// Fetch one page of keys under `prefix`
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage>;

    /// Write a whole object in one request
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        payload: PutPayload,
        options: &WriteOptions,
    ) -> Result<()>;

    /// Stream an object body, optionally limited to a byte range
    ///
    /// # Errors
    ///
    /// Returns `TransferError::NotFound` if the object doesn't exist.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream>;

    /// Server-side copy of an object
    async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        target_bucket: &str,
        target_key: &str,
        options: &WriteOptions,
    ) -> Result<()>;

    /// Open a multipart session and return its upload id
    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        options: &WriteOptions,
    ) -> Result<String>;

    /// Upload one part and return its ETag
    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        data: Bytes,
    ) -> Result<String>;

    /// Fill one part with a byte range of an existing object and return
    /// the part's ETag
    async fn upload_part_copy(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        source_bucket: &str,
        source_key: &str,
        range: ByteRange,
    ) -> Result<String>;

    /// Complete a session; `parts` must be in ascending part-number order
    async fn complete_multipart(&self, handle: &MultipartHandle, parts: &[CompletedPart])
        -> Result<()>;

    /// Abort a session, discarding its uploaded parts
    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<()>;

    /// List every open multipart session in a bucket
    async fn list_multipart_uploads(&self, bucket: &str) -> Result<Vec<MultipartUploadSummary>>;

    /// Delete one object. Deleting a missing key succeeds.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Delete many objects, returning the keys that could not be removed
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteFailure>> {
        let mut failures = Vec::new();
        for key in keys {
            if let Err(e) = self.delete_object(bucket, key).await {
                failures.push(DeleteFailure::new(key.clone(), None, e.to_string()));
            }
        }
        Ok(failures)
    }

    /// Generate a presigned URL
    async fn presign(&self, spec: &PresignedUrlSpec) -> Result<String>;
}

/// Resolves a store for a client configuration
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn store_for(&self, config: &ClientConfig) -> Result<Arc<dyn ObjectStore>>;
}
