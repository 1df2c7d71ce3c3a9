//! Object download to local files
//!
//! Small objects are fetched with one retried GET. Objects above the ranged
//! threshold are fetched as byte ranges, several in flight, and written in
//! order. Data lands in a sibling staging file that is renamed over the
//! destination only after the written size matches the object size, so a
//! failed download never leaves a truncated file behind.

use super::retry::{with_retry, Operation, RetryPolicy};
use crate::error::{Result, TransferError};
use crate::store::{ByteRange, ByteStream, ObjectStore};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const STAGING_SUFFIX: &str = ".stowage-part";

/// Downloads single objects to local paths
pub struct Downloader {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    concurrency: usize,
    ranged_threshold: u64,
    chunk_size: u64,
}

impl Downloader {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            store,
            policy,
            cancel,
            concurrency: 4,
            ranged_threshold: super::request::DEFAULT_MULTIPART_THRESHOLD,
            chunk_size: super::request::DEFAULT_PART_SIZE,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Objects larger than this are fetched as parallel byte ranges
    pub fn with_ranged_threshold(mut self, threshold: u64) -> Self {
        self.ranged_threshold = threshold;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Download `bucket/key` to `dest`, returning the bytes written
    ///
    /// # Errors
    ///
    /// Returns `TransferError::NotFound` if the object does not exist and
    /// `TransferError::IntegrityMismatch` if the written size differs from
    /// the object size.
    pub async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64> {
        let metadata = with_retry(
            &self.policy,
            &self.cancel,
            Operation::new("head_object", bucket, key),
            |_| self.store.head_object(bucket, key),
        )
        .await?
        .ok_or_else(|| TransferError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let staging = staging_path(dest)?;
        let result = match self.fetch_into(bucket, key, &staging, metadata.size).await {
            Ok(written) if written != metadata.size => Err(TransferError::IntegrityMismatch {
                bucket: bucket.to_string(),
                key: key.to_string(),
                expected: format!("{} bytes", metadata.size),
                actual: format!("{} bytes", written),
            }),
            other => other,
        };

        match result {
            Ok(written) => {
                tokio::fs::rename(&staging, dest).await?;
                debug!("Downloaded {}/{} to {} ({} bytes)", bucket, key, dest.display(), written);
                Ok(written)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                Err(e)
            }
        }
    }

    async fn fetch_into(&self, bucket: &str, key: &str, staging: &Path, size: u64) -> Result<u64> {
        if size <= self.ranged_threshold {
            return with_retry(
                &self.policy,
                &self.cancel,
                Operation::new("get_object", bucket, key),
                |_| async move {
                    let body = self.store.get_object(bucket, key, None).await?;
                    write_stream(staging, body).await
                },
            )
            .await;
        }

        let chunk_size = self.chunk_size;
        let ranges = (0..size.div_ceil(chunk_size)).map(move |index| {
            let start = index * chunk_size;
            ByteRange::from_offset(start, chunk_size.min(size - start))
        });
        debug!(
            "Fetching {}/{} ({} bytes) in {} range(s)",
            bucket,
            key,
            size,
            size.div_ceil(chunk_size)
        );

        let mut file = File::create(staging).await?;
        let mut fetches = stream::iter(ranges)
            .map(|range| self.fetch_range(bucket, key, range))
            .buffered(self.concurrency);

        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                next = fetches.next() => next,
            };
            match next {
                Some(Ok(data)) => {
                    file.write_all(&data).await?;
                    written += data.len() as u64;
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    async fn fetch_range(&self, bucket: &str, key: &str, range: ByteRange) -> Result<Bytes> {
        let data = with_retry(
            &self.policy,
            &self.cancel,
            Operation::new("get_object_range", bucket, key),
            |_| async move {
                let body = self.store.get_object(bucket, key, Some(range)).await?;
                collect_body(body).await
            },
        )
        .await?;

        if data.len() as u64 != range.len() {
            return Err(TransferError::IntegrityMismatch {
                bucket: bucket.to_string(),
                key: key.to_string(),
                expected: format!("{} bytes for {}", range.len(), range.header_value()),
                actual: format!("{} bytes", data.len()),
            });
        }
        Ok(data)
    }
}

fn staging_path(dest: &Path) -> Result<PathBuf> {
    let name = dest.file_name().ok_or_else(|| {
        TransferError::InvalidRequest(format!("{} does not name a file", dest.display()))
    })?;
    let mut staging = name.to_os_string();
    staging.push(STAGING_SUFFIX);
    Ok(dest.with_file_name(staging))
}

async fn write_stream(path: &Path, mut body: ByteStream) -> Result<u64> {
    let mut file = File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = body.try_next().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// Collect a whole body into memory
pub(crate) async fn collect_body(body: ByteStream) -> Result<Bytes> {
    let buffer = body
        .try_fold(BytesMut::new(), |mut buffer, chunk| async move {
            buffer.extend_from_slice(&chunk);
            Ok(buffer)
        })
        .await?;
    Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::memory::Fault;
    use crate::store::{MemoryStore, StoreCall};
    use std::time::Duration;
    use tempfile::TempDir;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_single_get_download() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let data = payload(1000);
        store.put_bytes("b", "k", data.clone());

        let dest = dir.path().join("nested/out.bin");
        let downloader = Downloader::new(Arc::new(store.clone()), policy(), CancellationToken::new());
        let written = downloader.download("b", "k", &dest).await.unwrap();

        assert_eq!(written, 1000);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(!staging_path(&dest).unwrap().exists());
        assert_eq!(store.call_count(StoreCall::Get), 1);
    }

    #[tokio::test]
    async fn test_ranged_download_in_order() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let data = payload(10_000);
        store.put_bytes("b", "k", data.clone());

        let dest = dir.path().join("out.bin");
        let downloader = Downloader::new(Arc::new(store.clone()), policy(), CancellationToken::new())
            .with_ranged_threshold(1000)
            .with_chunk_size(1024)
            .with_concurrency(3);
        downloader.download("b", "k", &dest).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(store.call_count(StoreCall::Get), 10);
    }

    #[tokio::test]
    async fn test_empty_object() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.put_bytes("b", "empty", Vec::new());

        let dest = dir.path().join("empty");
        let downloader = Downloader::new(Arc::new(store), policy(), CancellationToken::new());
        assert_eq!(downloader.download("b", "empty", &dest).await.unwrap(), 0);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.create_bucket("b");

        let downloader = Downloader::new(Arc::new(store), policy(), CancellationToken::new());
        let err = downloader
            .download("b", "missing", &dir.path().join("x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!dir.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.put_bytes("b", "k", payload(5000));
        store.inject_get_fault("k", Fault::Permanent);

        let dest = dir.path().join("out.bin");
        let downloader = Downloader::new(Arc::new(store), policy(), CancellationToken::new())
            .with_ranged_threshold(1000)
            .with_chunk_size(1000);
        assert!(downloader.download("b", "k", &dest).await.is_err());
        assert!(!dest.exists());
        assert!(!staging_path(&dest).unwrap().exists());
    }

    #[tokio::test]
    async fn test_transient_get_failure_is_retried() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let data = payload(300);
        store.put_bytes("b", "k", data.clone());
        store.inject_get_fault("k", Fault::Transient(1));

        let dest = dir.path().join("out.bin");
        let downloader = Downloader::new(Arc::new(store), policy(), CancellationToken::new());
        downloader.download("b", "k", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn test_staging_path() {
        assert_eq!(
            staging_path(Path::new("/tmp/a/file.csv")).unwrap(),
            PathBuf::from("/tmp/a/file.csv.stowage-part")
        );
        assert!(staging_path(Path::new("/")).is_err());
    }
}
