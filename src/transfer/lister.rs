//! Remote directory listing across paginated results

use super::path_mapper::is_directory_marker;
use super::retry::{with_retry, Operation, RetryPolicy};
use crate::error::{Result, TransferError};
use crate::store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A remote file as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFile {
    /// Full object key
    pub file_path: String,

    /// Size in bytes
    pub file_size_bytes: u64,

    /// Row count hint, when known
    pub row_count: Option<u64>,
}

impl StorageFile {
    pub fn new(file_path: impl Into<String>, file_size_bytes: u64) -> Self {
        Self {
            file_path: file_path.into(),
            file_size_bytes,
            row_count: None,
        }
    }
}

/// Enumerates every key under a prefix
pub struct DirectoryLister<'a> {
    store: &'a dyn ObjectStore,
    policy: &'a RetryPolicy,
    cancel: &'a CancellationToken,
}

impl<'a> DirectoryLister<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        policy: &'a RetryPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            policy,
            cancel,
        }
    }

    /// List all keys under `prefix` in store order
    ///
    /// Keys repeated on a later page are dropped. With
    /// `ignore_zero_byte_markers`, zero-byte keys ending in `/` are skipped.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::Listing` if a page cannot be fetched within
    /// the retry budget, `TransferError::Cancelled` on cancellation.
    pub async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        ignore_zero_byte_markers: bool,
    ) -> Result<Vec<StorageFile>> {
        let mut files = Vec::new();
        let mut seen = HashSet::new();
        let mut continuation: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let token = continuation.clone();
            let page = with_retry(
                self.policy,
                self.cancel,
                Operation::new("list_objects", bucket, prefix),
                |_| self.store.list_objects(bucket, prefix, token.clone()),
            )
            .await
            .map_err(|e| match e {
                TransferError::Cancelled => TransferError::Cancelled,
                other => TransferError::Listing {
                    bucket: bucket.to_string(),
                    prefix: prefix.to_string(),
                    message: other.to_string(),
                },
            })?;
            pages += 1;

            for object in page.objects {
                if !seen.insert(object.key.clone()) {
                    warn!("Dropping duplicate key {} from listing of {}/{}", object.key, bucket, prefix);
                    continue;
                }
                if ignore_zero_byte_markers && is_directory_marker(&object.key, object.size) {
                    continue;
                }
                files.push(StorageFile::new(object.key, object.size));
            }

            match page.next_token {
                Some(next) if continuation.as_deref() == Some(next.as_str()) => {
                    return Err(TransferError::Listing {
                        bucket: bucket.to_string(),
                        prefix: prefix.to_string(),
                        message: format!("store repeated continuation token {}", next),
                    });
                }
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        debug!(
            "Listed {} file(s) under {}/{} in {} page(s)",
            files.len(),
            bucket,
            prefix,
            pages
        );
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::memory::Fault;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn seeded(page_size: usize) -> MemoryStore {
        let store = MemoryStore::new().with_page_size(page_size);
        store.put_bytes("b", "data/", Vec::new());
        store.put_bytes("b", "data/a.csv", vec![1, 2, 3]);
        store.put_bytes("b", "data/sub/", Vec::new());
        store.put_bytes("b", "data/sub/b.csv", vec![4]);
        store.put_bytes("b", "data/sub/c.csv", Vec::new());
        store.put_bytes("b", "other/x", vec![9]);
        store
    }

    fn keys(files: &[StorageFile]) -> Vec<&str> {
        files.iter().map(|f| f.file_path.as_str()).collect()
    }

    #[tokio::test]
    async fn test_lists_across_pages_in_store_order() {
        let store = seeded(2);
        let cancel = CancellationToken::new();
        let policy = policy();
        let lister = DirectoryLister::new(&store, &policy, &cancel);

        let files = lister.list("b", "data/", false).await.unwrap();
        assert_eq!(
            keys(&files),
            vec!["data/", "data/a.csv", "data/sub/", "data/sub/b.csv", "data/sub/c.csv"]
        );
        assert_eq!(files[1].file_size_bytes, 3);
        assert!(files.iter().all(|f| f.row_count.is_none()));
    }

    #[tokio::test]
    async fn test_ignores_only_zero_byte_markers() {
        let store = seeded(2);
        let cancel = CancellationToken::new();
        let policy = policy();
        let lister = DirectoryLister::new(&store, &policy, &cancel);

        let files = lister.list("b", "data/", true).await.unwrap();
        // Zero-byte files without a trailing slash are kept
        assert_eq!(keys(&files), vec!["data/a.csv", "data/sub/b.csv", "data/sub/c.csv"]);
        assert!(!files
            .iter()
            .any(|f| f.file_size_bytes == 0 && f.file_path.ends_with('/')));
    }

    #[tokio::test]
    async fn test_drops_duplicates_across_pages() {
        let store = seeded(2);
        store.duplicate_page_boundaries();
        let cancel = CancellationToken::new();
        let policy = policy();
        let lister = DirectoryLister::new(&store, &policy, &cancel);

        let files = lister.list("b", "data/", false).await.unwrap();
        assert_eq!(files.len(), 5);
        let unique: HashSet<_> = files.iter().map(|f| &f.file_path).collect();
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn test_transient_page_failure_is_retried() {
        let store = seeded(2);
        store.inject_list_fault(1, Fault::Transient(2));
        let cancel = CancellationToken::new();
        let policy = policy();
        let lister = DirectoryLister::new(&store, &policy, &cancel);

        let files = lister.list("b", "data/", false).await.unwrap();
        assert_eq!(files.len(), 5);
    }

    #[tokio::test]
    async fn test_exhausted_page_failure_is_listing_error() {
        let store = seeded(2);
        store.inject_list_fault(1, Fault::Transient(10));
        let cancel = CancellationToken::new();
        let policy = policy();
        let lister = DirectoryLister::new(&store, &policy, &cancel);

        let err = lister.list("b", "data/", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Listing);
    }

    #[tokio::test]
    async fn test_empty_prefix_result() {
        let store = seeded(2);
        let cancel = CancellationToken::new();
        let policy = policy();
        let lister = DirectoryLister::new(&store, &policy, &cancel);

        assert!(lister.list("b", "missing/", false).await.unwrap().is_empty());
    }
}
