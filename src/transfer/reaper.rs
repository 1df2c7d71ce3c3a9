//! Cleanup of abandoned multipart uploads
//!
//! Sessions leaked by crashed processes keep their parts billed until they
//! are aborted. The reaper lists every open session in a bucket and aborts
//! those initiated before a cutoff.

use super::retry::{with_retry, Operation, RetryPolicy};
use crate::error::{ErrorKind, Result, TransferError};
use crate::store::{MultipartHandle, MultipartUploadSummary, ObjectStore};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Aborts multipart sessions older than a threshold
pub struct StaleUploadReaper<'a> {
    store: &'a dyn ObjectStore,
    policy: &'a RetryPolicy,
    cancel: &'a CancellationToken,
    concurrency: usize,
}

impl<'a> StaleUploadReaper<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        policy: &'a RetryPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            policy,
            cancel,
            concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Abort every session in `bucket` initiated strictly before `threshold`
    ///
    /// Returns the number of sessions this call aborted. Sessions already gone
    /// when the abort lands are not counted; other abort failures are logged
    /// and skipped.
    ///
    /// # Errors
    ///
    /// Fails if the open sessions cannot be listed, or on cancellation.
    pub async fn reap(&self, bucket: &str, threshold: DateTime<Utc>) -> Result<usize> {
        let uploads = with_retry(
            self.policy,
            self.cancel,
            Operation::new("list_multipart_uploads", bucket, ""),
            |_| self.store.list_multipart_uploads(bucket),
        )
        .await?;

        let stale: Vec<MultipartUploadSummary> = uploads
            .into_iter()
            .filter(|upload| upload.initiated_at < threshold)
            .collect();
        debug!(
            "Found {} multipart upload(s) in {} initiated before {}",
            stale.len(),
            bucket,
            threshold
        );

        let mut aborts = stream::iter(stale)
            .map(|upload| self.abort_one(bucket, upload))
            .buffer_unordered(self.concurrency);

        let mut aborted = 0usize;
        while let Some(result) = aborts.next().await {
            match result {
                Ok(true) => aborted += 1,
                Ok(false) => {}
                Err(e) => return Err(e),
            }
        }

        info!("Aborted {} stale multipart upload(s) in {}", aborted, bucket);
        Ok(aborted)
    }

    /// `Ok(true)` if this call aborted the session
    async fn abort_one(&self, bucket: &str, upload: MultipartUploadSummary) -> Result<bool> {
        let handle = MultipartHandle {
            bucket: bucket.to_string(),
            key: upload.key,
            upload_id: upload.upload_id,
        };
        let result = with_retry(
            self.policy,
            self.cancel,
            Operation::new("abort_multipart", bucket, &handle.key),
            |_| self.store.abort_multipart(&handle),
        )
        .await;

        match result {
            Ok(()) => {
                debug!(
                    "Aborted multipart upload {} for {}/{}",
                    handle.upload_id, bucket, handle.key
                );
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Multipart upload {} already gone", handle.upload_id);
                Ok(false)
            }
            Err(TransferError::Cancelled) => Err(TransferError::Cancelled),
            Err(e) => {
                warn!(
                    "Failed to abort multipart upload {} for {}/{}: {}",
                    handle.upload_id, bucket, handle.key, e
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreCall};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_aborts_only_sessions_before_threshold() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.open_upload("b", "old-1", now - ChronoDuration::days(3));
        store.open_upload("b", "old-2", now - ChronoDuration::hours(25));
        store.open_upload("b", "fresh", now - ChronoDuration::minutes(5));
        store.open_upload("b", "edge", now - ChronoDuration::days(1));

        let cancel = CancellationToken::new();
        let policy = policy();
        let reaper = StaleUploadReaper::new(&store, &policy, &cancel);
        let threshold = now - ChronoDuration::days(1);
        let count = reaper.reap("b", threshold).await.unwrap();

        assert_eq!(count, 2);
        let mut remaining: Vec<_> = store.open_uploads("b").into_iter().map(|u| u.key).collect();
        remaining.sort();
        assert_eq!(remaining, vec!["edge", "fresh"]);
    }

    #[tokio::test]
    async fn test_no_open_sessions() {
        let store = MemoryStore::new();
        store.create_bucket("b");
        let cancel = CancellationToken::new();
        let policy = policy();
        let reaper = StaleUploadReaper::new(&store, &policy, &cancel).with_concurrency(4);

        assert_eq!(reaper.reap("b", Utc::now()).await.unwrap(), 0);
        assert_eq!(store.call_count(StoreCall::Abort), 0);
    }

    #[tokio::test]
    async fn test_concurrent_sweep_counts_all() {
        let store = MemoryStore::new();
        let old = Utc::now() - ChronoDuration::days(10);
        for i in 0..12 {
            store.open_upload("b", &format!("k{}", i), old);
        }
        let cancel = CancellationToken::new();
        let policy = policy();
        let reaper = StaleUploadReaper::new(&store, &policy, &cancel).with_concurrency(4);

        assert_eq!(reaper.reap("b", Utc::now()).await.unwrap(), 12);
        assert!(store.open_uploads("b").is_empty());
    }

    #[tokio::test]
    async fn test_missing_bucket_fails() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let policy = policy();
        let reaper = StaleUploadReaper::new(&store, &policy, &cancel);

        let err = reaper.reap("absent", Utc::now()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_cancelled_sweep() {
        let store = MemoryStore::new();
        store.open_upload("b", "k", Utc::now() - ChronoDuration::days(2));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = policy();
        let reaper = StaleUploadReaper::new(&store, &policy, &cancel);

        let err = reaper.reap("b", Utc::now()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(store.open_uploads("b").len(), 1);
    }
}
