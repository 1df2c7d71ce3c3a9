//! In-memory object store for testing
//!
//! Behaves like a strongly consistent S3 bucket set: sorted keys, paginated
//! listings with opaque continuation tokens, multipart sessions that only
//! materialize an object on completion. Latency and faults can be injected
//! per key, per part number or per listing page, and every call is counted so
//! tests can assert on concurrency and retry behavior.

use super::types::{
    ByteRange, ByteStream, CompletedPart, ListPage, MultipartHandle, MultipartUploadSummary,
    ObjectMetadata, ObjectSummary, PresignedUrlSpec, PutPayload, StoreLimits, WriteOptions,
};
use super::{ClientConfig, ObjectStore, StoreProvider};
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default listing page size
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Store operations, for call accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreCall {
    Head,
    List,
    Put,
    Get,
    Copy,
    Initiate,
    UploadPart,
    UploadPartCopy,
    Complete,
    Abort,
    ListUploads,
    Delete,
    Presign,
}

/// How an injected fault behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail every call with a non-retryable error
    Permanent,

    /// Fail the next `n` calls with a transient error, then succeed
    Transient(u32),
}

impl Fault {
    /// Consume one trigger of this fault, returning the error to raise
    fn trip(&mut self, what: &str) -> Option<TransferError> {
        match self {
            Fault::Permanent => Some(TransferError::Service {
                code: "InjectedFailure".to_string(),
                message: format!("injected permanent failure on {}", what),
            }),
            Fault::Transient(0) => None,
            Fault::Transient(remaining) => {
                *remaining -= 1;
                Some(TransferError::TransientNetwork(format!(
                    "injected transient failure on {}",
                    what
                )))
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
    options: WriteOptions,
}

#[derive(Debug, Clone)]
struct PendingUpload {
    bucket: String,
    key: String,
    initiated_at: DateTime<Utc>,
    options: WriteOptions,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct Faults {
    put: HashMap<String, Fault>,
    get: HashMap<String, Fault>,
    part: HashMap<u32, Fault>,
    list_page: HashMap<usize, Fault>,
    delete_denied: HashSet<String>,
    duplicate_page_boundary: bool,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    uploads: BTreeMap<String, PendingUpload>,
    next_upload_id: u64,
    faults: Faults,
    calls: HashMap<StoreCall, u64>,
}

/// Decrements the in-flight counter when a call finishes
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory [`ObjectStore`]
///
/// Clones share the same buckets, faults and counters.
///
/// # Example
///
/// ```rust
/// use stowage::store::{MemoryStore, StoreCall};
///
/// let store = MemoryStore::new().with_page_size(2);
/// store.create_bucket("data");
/// store.put_bytes("data", "k", b"v".to_vec());
/// assert_eq!(store.object("data", "k"), Some(b"v".to_vec()));
/// assert_eq!(store.call_count(StoreCall::Put), 0);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    page_size: usize,
    latency: Duration,
    limits: StoreLimits,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            page_size: DEFAULT_PAGE_SIZE,
            latency: Duration::ZERO,
            limits: StoreLimits::default(),
        }
    }

    /// Set the maximum number of keys per listing page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Override the multipart limits
    pub fn with_limits(mut self, limits: StoreLimits) -> Self {
        self.limits = limits;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn begin(&self, call: StoreCall) -> InFlight {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        *self.lock().calls.entry(call).or_insert(0) += 1;
        let guard = InFlight(self.in_flight.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        guard
    }

    // === Seeding and inspection ===

    pub fn create_bucket(&self, bucket: &str) {
        self.lock().buckets.entry(bucket.to_string()).or_default();
    }

    /// Store an object directly, bypassing call accounting and faults
    pub fn put_bytes(&self, bucket: &str, key: &str, data: Vec<u8>) {
        let data = Bytes::from(data);
        let object = StoredObject {
            etag: etag_of(&data),
            data,
            last_modified: Utc::now(),
            options: WriteOptions::default(),
        };
        self.lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    /// Open a multipart session with an explicit initiation time
    pub fn open_upload(&self, bucket: &str, key: &str, initiated_at: DateTime<Utc>) -> String {
        let mut state = self.lock();
        state.buckets.entry(bucket.to_string()).or_default();
        state.next_upload_id += 1;
        let upload_id = format!("upload-{:06}", state.next_upload_id);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                initiated_at,
                options: WriteOptions::default(),
                parts: BTreeMap::new(),
            },
        );
        upload_id
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|o| o.data.to_vec())
    }

    /// Write options the object was stored with
    pub fn object_options(&self, bucket: &str, key: &str) -> Option<WriteOptions> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|o| o.options.clone())
    }

    /// All keys of a bucket in sorted order
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Sessions not yet completed or aborted
    pub fn open_uploads(&self, bucket: &str) -> Vec<MultipartUploadSummary> {
        self.lock()
            .uploads
            .iter()
            .filter(|(_, u)| u.bucket == bucket)
            .map(|(id, u)| MultipartUploadSummary {
                key: u.key.clone(),
                upload_id: id.clone(),
                initiated_at: u.initiated_at,
            })
            .collect()
    }

    pub fn call_count(&self, call: StoreCall) -> u64 {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// Highest number of calls observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    // === Fault injection ===

    pub fn inject_put_fault(&self, key: &str, fault: Fault) {
        self.lock().faults.put.insert(key.to_string(), fault);
    }

    pub fn inject_get_fault(&self, key: &str, fault: Fault) {
        self.lock().faults.get.insert(key.to_string(), fault);
    }

    /// Fault on a part number, for every session
    pub fn inject_part_fault(&self, part_number: u32, fault: Fault) {
        self.lock().faults.part.insert(part_number, fault);
    }

    /// Fault on a listing page (0-based)
    pub fn inject_list_fault(&self, page: usize, fault: Fault) {
        self.lock().faults.list_page.insert(page, fault);
    }

    /// Reject deletes of `key` with `AccessDenied`
    pub fn deny_delete(&self, key: &str) {
        self.lock().faults.delete_denied.insert(key.to_string());
    }

    /// Make every page after the first repeat the last key of the previous one
    pub fn duplicate_page_boundaries(&self) {
        self.lock().faults.duplicate_page_boundary = true;
    }

    fn no_such_bucket(bucket: &str) -> TransferError {
        TransferError::NotFound {
            bucket: bucket.to_string(),
            key: String::new(),
        }
    }

    fn no_such_upload(handle: &MultipartHandle) -> TransferError {
        TransferError::NotFound {
            bucket: handle.bucket.clone(),
            key: format!("{} (upload {})", handle.key, handle.upload_id),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn etag_of(data: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(data));
    format!("\"{}\"", &digest[..32])
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn limits(&self) -> StoreLimits {
        self.limits
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMetadata>> {
        let _call = self.begin(StoreCall::Head).await;
        let state = self.lock();
        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?;
        Ok(objects.get(key).map(|o| ObjectMetadata {
            size: o.data.len() as u64,
            etag: Some(o.etag.clone()),
            last_modified: Some(o.last_modified),
            content_type: o.options.content_type.clone(),
        }))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage> {
        let _call = self.begin(StoreCall::List).await;
        let mut state = self.lock();

        let start = match continuation.as_deref() {
            None => 0,
            Some(token) => token.parse::<usize>().map_err(|_| TransferError::Service {
                code: "InvalidArgument".to_string(),
                message: format!("invalid continuation token: {}", token),
            })?,
        };
        let page_index = start / self.page_size;
        if let Some(fault) = state.faults.list_page.get_mut(&page_index) {
            if let Some(err) = fault.trip(&format!("list page {}", page_index)) {
                return Err(err);
            }
        }

        let duplicate = state.faults.duplicate_page_boundary;
        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?;
        let matching: Vec<ObjectSummary> = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, o)| ObjectSummary {
                key: key.clone(),
                size: o.data.len() as u64,
                etag: Some(o.etag.clone()),
                last_modified: Some(o.last_modified),
            })
            .collect();

        let from = if duplicate && start > 0 { start - 1 } else { start };
        let end = (start + self.page_size).min(matching.len());
        let page = matching.get(from.min(end)..end).unwrap_or_default().to_vec();
        let next_token = (end < matching.len()).then(|| end.to_string());

        Ok(ListPage {
            objects: page,
            next_token,
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        payload: PutPayload,
        options: &WriteOptions,
    ) -> Result<()> {
        let _call = self.begin(StoreCall::Put).await;
        if let Some(fault) = self.lock().faults.put.get_mut(key) {
            if let Some(err) = fault.trip(key) {
                return Err(err);
            }
        }

        let data = match payload {
            PutPayload::Bytes(bytes) => bytes,
            PutPayload::File { path, length } => {
                let data = tokio::fs::read(&path).await?;
                if data.len() as u64 != length {
                    return Err(TransferError::Service {
                        code: "IncompleteBody".to_string(),
                        message: format!(
                            "declared {} bytes but read {} from {}",
                            length,
                            data.len(),
                            path.display()
                        ),
                    });
                }
                Bytes::from(data)
            }
        };

        let mut state = self.lock();
        let objects = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                etag: etag_of(&data),
                data,
                last_modified: Utc::now(),
                options: options.clone(),
            },
        );
        Ok(())
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        let _call = self.begin(StoreCall::Get).await;
        let mut state = self.lock();
        if let Some(fault) = state.faults.get.get_mut(key) {
            if let Some(err) = fault.trip(key) {
                return Err(err);
            }
        }

        let object = state
            .buckets
            .get(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?
            .get(key)
            .ok_or_else(|| TransferError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        let data = match range {
            None => object.data.clone(),
            Some(range) => {
                let len = object.data.len() as u64;
                if range.start >= len {
                    return Err(TransferError::Service {
                        code: "InvalidRange".to_string(),
                        message: format!("range {} beyond object size {}", range.header_value(), len),
                    });
                }
                let end = range.end.min(len - 1);
                object.data.slice(range.start as usize..=end as usize)
            }
        };

        // Deliver in small chunks so consumers exercise multi-chunk bodies
        let chunks: Vec<Result<Bytes>> = data
            .chunks(64 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        target_bucket: &str,
        target_key: &str,
        options: &WriteOptions,
    ) -> Result<()> {
        let _call = self.begin(StoreCall::Copy).await;
        let mut state = self.lock();
        let source = state
            .buckets
            .get(source_bucket)
            .ok_or_else(|| Self::no_such_bucket(source_bucket))?
            .get(source_key)
            .cloned()
            .ok_or_else(|| TransferError::NotFound {
                bucket: source_bucket.to_string(),
                key: source_key.to_string(),
            })?;
        if source.data.len() as u64 > self.limits.max_part_size {
            return Err(TransferError::Service {
                code: "InvalidRequest".to_string(),
                message: format!(
                    "source of {} bytes exceeds the single copy limit of {}",
                    source.data.len(),
                    self.limits.max_part_size
                ),
            });
        }
        let target = state
            .buckets
            .get_mut(target_bucket)
            .ok_or_else(|| Self::no_such_bucket(target_bucket))?;
        target.insert(
            target_key.to_string(),
            StoredObject {
                last_modified: Utc::now(),
                options: WriteOptions {
                    content_type: source.options.content_type.clone(),
                    server_side_encryption: options.server_side_encryption.clone(),
                },
                ..source
            },
        );
        Ok(())
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        options: &WriteOptions,
    ) -> Result<String> {
        let _call = self.begin(StoreCall::Initiate).await;
        if !self.lock().buckets.contains_key(bucket) {
            return Err(Self::no_such_bucket(bucket));
        }
        let upload_id = self.open_upload(bucket, key, Utc::now());
        if let Some(upload) = self.lock().uploads.get_mut(&upload_id) {
            upload.options = options.clone();
        }
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let _call = self.begin(StoreCall::UploadPart).await;
        let mut state = self.lock();
        if let Some(fault) = state.faults.part.get_mut(&part_number) {
            if let Some(err) = fault.trip(&format!("part {}", part_number)) {
                return Err(err);
            }
        }
        if part_number == 0 || part_number > self.limits.max_parts {
            return Err(TransferError::Service {
                code: "InvalidArgument".to_string(),
                message: format!("part number {} out of range", part_number),
            });
        }

        let upload = state
            .uploads
            .get_mut(&handle.upload_id)
            .ok_or_else(|| Self::no_such_upload(handle))?;
        let etag = etag_of(&data);
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn upload_part_copy(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        source_bucket: &str,
        source_key: &str,
        range: ByteRange,
    ) -> Result<String> {
        let _call = self.begin(StoreCall::UploadPartCopy).await;
        let mut state = self.lock();
        if let Some(fault) = state.faults.part.get_mut(&part_number) {
            if let Some(err) = fault.trip(&format!("part copy {}", part_number)) {
                return Err(err);
            }
        }
        if part_number == 0 || part_number > self.limits.max_parts {
            return Err(TransferError::Service {
                code: "InvalidArgument".to_string(),
                message: format!("part number {} out of range", part_number),
            });
        }

        let source = state
            .buckets
            .get(source_bucket)
            .ok_or_else(|| Self::no_such_bucket(source_bucket))?
            .get(source_key)
            .ok_or_else(|| TransferError::NotFound {
                bucket: source_bucket.to_string(),
                key: source_key.to_string(),
            })?;
        let len = source.data.len() as u64;
        if range.end >= len {
            return Err(TransferError::Service {
                code: "InvalidRange".to_string(),
                message: format!("range {} beyond object size {}", range.header_value(), len),
            });
        }
        let data = source.data.slice(range.start as usize..=range.end as usize);

        let upload = state
            .uploads
            .get_mut(&handle.upload_id)
            .ok_or_else(|| Self::no_such_upload(handle))?;
        let etag = etag_of(&data);
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        handle: &MultipartHandle,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let _call = self.begin(StoreCall::Complete).await;
        let mut state = self.lock();
        let upload = state
            .uploads
            .get(&handle.upload_id)
            .ok_or_else(|| Self::no_such_upload(handle))?;

        let invalid = |message: String| TransferError::Service {
            code: "InvalidPart".to_string(),
            message,
        };
        if parts.is_empty() {
            return Err(invalid("no parts given".to_string()));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(TransferError::Service {
                code: "InvalidPartOrder".to_string(),
                message: "parts must be in ascending order".to_string(),
            });
        }

        let mut body = BytesMut::new();
        let mut etags = String::new();
        for (index, part) in parts.iter().enumerate() {
            let (etag, data) = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| invalid(format!("part {} was never uploaded", part.part_number)))?;
            if *etag != part.etag {
                return Err(invalid(format!("etag mismatch on part {}", part.part_number)));
            }
            let is_last = index + 1 == parts.len();
            if !is_last && (data.len() as u64) < self.limits.min_part_size {
                return Err(TransferError::Service {
                    code: "EntityTooSmall".to_string(),
                    message: format!("part {} is {} bytes", part.part_number, data.len()),
                });
            }
            body.extend_from_slice(data);
            etags.push_str(etag);
        }

        let digest = hex::encode(Sha256::digest(etags.as_bytes()));
        let object = StoredObject {
            data: body.freeze(),
            etag: format!("\"{}-{}\"", &digest[..32], parts.len()),
            last_modified: Utc::now(),
            options: upload.options.clone(),
        };
        let key = upload.key.clone();
        state.uploads.remove(&handle.upload_id);
        state
            .buckets
            .get_mut(&handle.bucket)
            .ok_or_else(|| Self::no_such_bucket(&handle.bucket))?
            .insert(key, object);
        Ok(())
    }

    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<()> {
        let _call = self.begin(StoreCall::Abort).await;
        self.lock()
            .uploads
            .remove(&handle.upload_id)
            .map(|_| ())
            .ok_or_else(|| Self::no_such_upload(handle))
    }

    async fn list_multipart_uploads(&self, bucket: &str) -> Result<Vec<MultipartUploadSummary>> {
        let _call = self.begin(StoreCall::ListUploads).await;
        if !self.lock().buckets.contains_key(bucket) {
            return Err(Self::no_such_bucket(bucket));
        }
        Ok(self.open_uploads(bucket))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let _call = self.begin(StoreCall::Delete).await;
        let mut state = self.lock();
        if state.faults.delete_denied.contains(key) {
            return Err(TransferError::AccessDenied(format!(
                "delete of {}/{} denied",
                bucket, key
            )));
        }
        state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?
            .remove(key);
        Ok(())
    }

    async fn presign(&self, spec: &PresignedUrlSpec) -> Result<String> {
        let _call = self.begin(StoreCall::Presign).await;
        Ok(format!(
            "memory://{}/{}?method=GET&expires={}",
            spec.bucket,
            spec.key,
            spec.expires_at.timestamp()
        ))
    }
}

#[async_trait]
impl StoreProvider for MemoryStore {
    async fn store_for(&self, _config: &ClientConfig) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use futures::TryStreamExt;

    async fn collect(stream: ByteStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_put_head_get() {
        let store = MemoryStore::new();
        store.create_bucket("b");
        store
            .put_object(
                "b",
                "k",
                PutPayload::Bytes(Bytes::from_static(b"hello world")),
                &WriteOptions::default(),
            )
            .await
            .unwrap();

        let meta = store.head_object("b", "k").await.unwrap().unwrap();
        assert_eq!(meta.size, 11);
        assert!(store.head_object("b", "missing").await.unwrap().is_none());

        let body = collect(store.get_object("b", "k", None).await.unwrap()).await;
        assert_eq!(body, b"hello world");

        let body = collect(
            store
                .get_object("b", "k", Some(ByteRange::from_offset(6, 100)))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body, b"world");
    }

    #[tokio::test]
    async fn test_missing_bucket_is_not_found() {
        let store = MemoryStore::new();
        let err = store.head_object("nope", "k").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_pagination() {
        let store = MemoryStore::new().with_page_size(2);
        for key in ["p/a", "p/b", "p/c", "q/d"] {
            store.put_bytes("b", key, vec![1]);
        }

        let first = store.list_objects("b", "p/", None).await.unwrap();
        assert_eq!(first.objects.len(), 2);
        let second = store
            .list_objects("b", "p/", first.next_token.clone())
            .await
            .unwrap();
        assert_eq!(second.objects.len(), 1);
        assert_eq!(second.objects[0].key, "p/c");
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_page_boundary() {
        let store = MemoryStore::new().with_page_size(2);
        for key in ["a", "b", "c", "d"] {
            store.put_bytes("b", key, vec![1]);
        }
        store.duplicate_page_boundaries();

        let first = store.list_objects("b", "", None).await.unwrap();
        let second = store.list_objects("b", "", first.next_token).await.unwrap();
        let keys: Vec<_> = second.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_transient_fault_clears() {
        let store = MemoryStore::new();
        store.create_bucket("b");
        store.inject_put_fault("k", Fault::Transient(1));
        let payload = PutPayload::Bytes(Bytes::from_static(b"x"));

        let err = store
            .put_object("b", "k", payload.clone(), &WriteOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        store
            .put_object("b", "k", payload, &WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(store.call_count(StoreCall::Put), 2);
    }

    #[tokio::test]
    async fn test_multipart_lifecycle() {
        let limits = StoreLimits {
            min_part_size: 4,
            ..StoreLimits::default()
        };
        let store = MemoryStore::new().with_limits(limits);
        store.create_bucket("b");

        let upload_id = store
            .initiate_multipart("b", "big", &WriteOptions::default())
            .await
            .unwrap();
        let handle = MultipartHandle {
            bucket: "b".to_string(),
            key: "big".to_string(),
            upload_id,
        };
        let e1 = store
            .upload_part(&handle, 1, Bytes::from_static(b"abcd"))
            .await
            .unwrap();
        let e2 = store
            .upload_part(&handle, 2, Bytes::from_static(b"ef"))
            .await
            .unwrap();
        assert!(store.head_object("b", "big").await.unwrap().is_none());
        assert_eq!(store.open_uploads("b").len(), 1);

        let parts = vec![
            CompletedPart {
                part_number: 1,
                etag: e1,
                size: 4,
            },
            CompletedPart {
                part_number: 2,
                etag: e2,
                size: 2,
            },
        ];
        store.complete_multipart(&handle, &parts).await.unwrap();
        assert_eq!(store.object("b", "big"), Some(b"abcdef".to_vec()));
        assert!(store.open_uploads("b").is_empty());

        let err = store.abort_multipart(&handle).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_complete_rejects_small_parts_and_bad_order() {
        let store = MemoryStore::new().with_limits(StoreLimits {
            min_part_size: 4,
            ..StoreLimits::default()
        });
        store.create_bucket("b");
        let upload_id = store
            .initiate_multipart("b", "k", &WriteOptions::default())
            .await
            .unwrap();
        let handle = MultipartHandle {
            bucket: "b".to_string(),
            key: "k".to_string(),
            upload_id,
        };
        let e1 = store.upload_part(&handle, 1, Bytes::from_static(b"ab")).await.unwrap();
        let e2 = store.upload_part(&handle, 2, Bytes::from_static(b"cd")).await.unwrap();
        let p1 = CompletedPart {
            part_number: 1,
            etag: e1,
            size: 2,
        };
        let p2 = CompletedPart {
            part_number: 2,
            etag: e2,
            size: 2,
        };

        let err = store
            .complete_multipart(&handle, &[p2.clone(), p1.clone()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("InvalidPartOrder"));

        let err = store.complete_multipart(&handle, &[p1, p2]).await.unwrap_err();
        assert!(err.to_string().contains("EntityTooSmall"));
    }

    #[tokio::test]
    async fn test_part_copy_and_single_copy_limit() {
        let store = MemoryStore::new().with_limits(StoreLimits {
            min_part_size: 4,
            max_part_size: 8,
            max_parts: 10,
        });
        store.create_bucket("b");
        store.put_bytes("b", "src", b"0123456789".to_vec());

        let options = WriteOptions::default();
        let err = store.copy_object("b", "src", "b", "dst", &options).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Service);

        let upload_id = store.initiate_multipart("b", "dst", &options).await.unwrap();
        let handle = MultipartHandle {
            bucket: "b".to_string(),
            key: "dst".to_string(),
            upload_id,
        };
        let mut parts = Vec::new();
        for (number, range) in [(1, ByteRange::from_offset(0, 6)), (2, ByteRange::from_offset(6, 4))] {
            let etag = store.upload_part_copy(&handle, number, "b", "src", range).await.unwrap();
            parts.push(CompletedPart {
                part_number: number,
                etag,
                size: range.len(),
            });
        }
        store.complete_multipart(&handle, &parts).await.unwrap();
        assert_eq!(store.object("b", "dst"), Some(b"0123456789".to_vec()));

        let beyond = store
            .upload_part_copy(&handle, 3, "b", "src", ByteRange::from_offset(8, 4))
            .await
            .unwrap_err();
        assert_eq!(beyond.kind(), ErrorKind::Service);
        assert_eq!(store.call_count(StoreCall::UploadPartCopy), 3);
    }

    #[tokio::test]
    async fn test_delete_objects_reports_denied_keys() {
        let store = MemoryStore::new();
        store.put_bytes("b", "a", vec![1]);
        store.put_bytes("b", "c", vec![1]);
        store.deny_delete("c");

        let failures = store
            .delete_objects("b", &["a".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, "c");
        assert_eq!(store.keys("b"), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_max_in_flight_tracking() {
        let store = MemoryStore::new().with_latency(Duration::from_millis(20));
        store.create_bucket("b");
        let calls = (0..4).map(|_| store.head_object("b", "k"));
        futures::future::join_all(calls).await;
        assert_eq!(store.max_in_flight(), 4);
        assert_eq!(store.call_count(StoreCall::Head), 4);
    }
}
