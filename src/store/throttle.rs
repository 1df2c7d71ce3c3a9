/*!
 * Permit-bounded store wrapper
 *
 * Every network call of one transfer invocation goes through a single
 * semaphore so the number of in-flight calls never exceeds the request's
 * concurrency limit, no matter how work is fanned out above it (files across
 * workers, parts within a file, ranges within a download).
 */

use super::types::{
    ByteRange, ByteStream, CompletedPart, ListPage, MultipartHandle, MultipartUploadSummary,
    ObjectMetadata, PresignedUrlSpec, PutPayload, StoreLimits, WriteOptions,
};
use super::ObjectStore;
use crate::error::{DeleteFailure, Result, TransferError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Wraps a store so that at most `permits` calls run at once
#[derive(Clone)]
pub struct ThrottledStore {
    inner: Arc<dyn ObjectStore>,
    permits: Arc<Semaphore>,
    max: usize,
}

impl ThrottledStore {
    /// Create a wrapper allowing `max_concurrent` simultaneous calls (minimum 1)
    pub fn new(inner: Arc<dyn ObjectStore>, max_concurrent: usize) -> Self {
        let max = max_concurrent.max(1);
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Get the maximum number of concurrent calls allowed
    pub fn max_concurrent(&self) -> usize {
        self.max
    }

    /// Get the number of currently available permits
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::Cancelled)
    }
}

#[async_trait]
impl ObjectStore for ThrottledStore {
    fn limits(&self) -> StoreLimits {
        self.inner.limits()
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMetadata>> {
        let _permit = self.acquire().await?;
        self.inner.head_object(bucket, key).await
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage> {
        let _permit = self.acquire().await?;
        self.inner.list_objects(bucket, prefix, continuation).await
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        payload: PutPayload,
        options: &WriteOptions,
    ) -> Result<()> {
        let _permit = self.acquire().await?;
        self.inner.put_object(bucket, key, payload, options).await
    }

    /// The permit is held until the returned stream is dropped
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        let permit = self.acquire().await?;
        let body = self.inner.get_object(bucket, key, range).await?;
        Ok(body
            .map(move |chunk| {
                let _held = &permit;
                chunk
            })
            .boxed())
    }

    async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        target_bucket: &str,
        target_key: &str,
        options: &WriteOptions,
    ) -> Result<()> {
        let _permit = self.acquire().await?;
        self.inner
            .copy_object(source_bucket, source_key, target_bucket, target_key, options)
            .await
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        options: &WriteOptions,
    ) -> Result<String> {
        let _permit = self.acquire().await?;
        self.inner.initiate_multipart(bucket, key, options).await
    }

    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let _permit = self.acquire().await?;
        self.inner.upload_part(handle, part_number, data).await
    }

    async fn upload_part_copy(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        source_bucket: &str,
        source_key: &str,
        range: ByteRange,
    ) -> Result<String> {
        let _permit = self.acquire().await?;
        self.inner
            .upload_part_copy(handle, part_number, source_bucket, source_key, range)
            .await
    }

    async fn complete_multipart(
        &self,
        handle: &MultipartHandle,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let _permit = self.acquire().await?;
        self.inner.complete_multipart(handle, parts).await
    }

    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<()> {
        let _permit = self.acquire().await?;
        self.inner.abort_multipart(handle).await
    }

    async fn list_multipart_uploads(&self, bucket: &str) -> Result<Vec<MultipartUploadSummary>> {
        let _permit = self.acquire().await?;
        self.inner.list_multipart_uploads(bucket).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let _permit = self.acquire().await?;
        self.inner.delete_object(bucket, key).await
    }

    /// One permit for the whole batch; the inner store issues its requests sequentially
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteFailure>> {
        let _permit = self.acquire().await?;
        self.inner.delete_objects(bucket, keys).await
    }

    async fn presign(&self, spec: &PresignedUrlSpec) -> Result<String> {
        // Local computation, no network call
        self.inner.presign(spec).await
    }
}
