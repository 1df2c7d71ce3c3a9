//! Transfer job orchestration
//!
//! [`TransferCoordinator`] is the public operation surface of the engine.
//! Every invocation resolves a store for the request's client configuration,
//! wraps it in a [`ThrottledStore`] sized to the request's concurrency limit
//! and runs under a child of the coordinator's cancellation token.
//!
//! Multi-file operations build their work set first (explicit list, local
//! walk or remote listing), then hand every item to the worker pool. A failed
//! item is recorded and the job continues; only errors that invalidate the
//! whole job (cancellation, configuration, listing) stop it.

use super::download::{collect_body, Downloader};
use super::lister::{DirectoryLister, StorageFile};
use super::multipart::{MultipartUploader, PartBuffers};
use super::path_mapper::{
    directory_marker_key, is_root_prefix, key_from_path, local_path_for_key, relative_key,
    remote_key,
};
use super::pool;
use super::properties::parse_properties;
use super::reaper::StaleUploadReaper;
use super::request::{CopyRequest, GetRequest, TransferRequest};
use super::results::{ResultAggregator, TransferResult};
use super::retry::{with_retry, Operation};
use crate::error::{Result, TransferError};
use crate::store::{
    validate_bucket_name, ByteStream, ClientConfig, ObjectMetadata, ObjectStore,
    PresignedUrlSpec, PutPayload, StoreProvider, ThrottledStore, WriteOptions,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Store, cancellation scope and part memory of one coordinator invocation
#[derive(Clone)]
struct Invocation {
    store: Arc<dyn ObjectStore>,
    cancel: CancellationToken,
    part_buffers: Arc<PartBuffers>,
}

/// Runs transfer jobs against stores resolved from a [`StoreProvider`]
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use stowage::store::MemoryStore;
/// use stowage::{TransferCoordinator, TransferRequest};
///
/// #[tokio::main]
/// async fn main() -> stowage::Result<()> {
///     let store = MemoryStore::new();
///     store.create_bucket("reports");
///
///     let coordinator = TransferCoordinator::new(Arc::new(store));
///     let request = TransferRequest::new("reports", "daily/", "/var/reports").with_max_concurrency(8);
///     let result = coordinator.upload_directory(&request).await?;
///     println!("{} file(s), {} byte(s)", result.total_files, result.total_bytes);
///     Ok(())
/// }
/// ```
pub struct TransferCoordinator {
    provider: Arc<dyn StoreProvider>,
    cancel: CancellationToken,
}

impl TransferCoordinator {
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        Self {
            provider,
            cancel: CancellationToken::new(),
        }
    }

    /// Root token; cancelling it stops every running invocation
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn open(&self, client: &ClientConfig, max_concurrency: usize) -> Result<Invocation> {
        let store = self.provider.store_for(client).await?;
        Ok(Invocation {
            store: Arc::new(ThrottledStore::new(store, max_concurrency)),
            cancel: self.cancel.child_token(),
            part_buffers: Arc::new(PartBuffers::new(max_concurrency)),
        })
    }

    async fn prepare(&self, req: &TransferRequest) -> Result<Invocation> {
        req.validate()?;
        self.open(&req.client, req.max_concurrency).await
    }

    // === Metadata ===

    /// Metadata of the object at `key_prefix`, `None` if it does not exist
    pub async fn get_object_metadata(&self, req: &TransferRequest) -> Result<Option<ObjectMetadata>> {
        let inv = self.prepare(req).await?;
        head(&inv, req, &req.bucket, &req.key_prefix).await
    }

    /// Check that the object at `key_prefix` exists with the expected size
    ///
    /// # Errors
    ///
    /// `IntegrityMismatch` if the object is absent or its size differs.
    pub async fn validate_file(&self, req: &TransferRequest, expected_size: u64) -> Result<ObjectMetadata> {
        let inv = self.prepare(req).await?;
        let mismatch = |actual: String| TransferError::IntegrityMismatch {
            bucket: req.bucket.clone(),
            key: req.key_prefix.clone(),
            expected: format!("{} bytes", expected_size),
            actual,
        };
        match head(&inv, req, &req.bucket, &req.key_prefix).await? {
            None => Err(mismatch("no object".to_string())),
            Some(meta) if meta.size != expected_size => Err(mismatch(format!("{} bytes", meta.size))),
            Some(meta) => Ok(meta),
        }
    }

    /// Put a zero-byte directory marker at `key_prefix/`
    pub async fn create_directory(&self, req: &TransferRequest) -> Result<()> {
        if is_root_prefix(&req.key_prefix) {
            return Err(TransferError::InvalidRequest(
                "cannot create a directory marker at the bucket root".to_string(),
            ));
        }
        let inv = self.prepare(req).await?;
        let key = directory_marker_key(&req.key_prefix);
        let options = WriteOptions::default();
        with_retry(
            &req.retry,
            &inv.cancel,
            Operation::new("put_object", &req.bucket, &key),
            |_| inv.store.put_object(&req.bucket, &key, PutPayload::Bytes(Bytes::new()), &options),
        )
        .await?;
        info!("Created directory marker {}/{}", req.bucket, key);
        Ok(())
    }

    /// Every key under `key_prefix`, in store order
    pub async fn list_directory(
        &self,
        req: &TransferRequest,
        ignore_zero_byte_markers: bool,
    ) -> Result<Vec<StorageFile>> {
        let inv = self.prepare(req).await?;
        DirectoryLister::new(inv.store.as_ref(), &req.retry, &inv.cancel)
            .list(&req.bucket, &req.key_prefix, ignore_zero_byte_markers)
            .await
    }

    // === Uploads ===

    /// Upload `local_path` to the key `key_prefix`
    pub async fn upload_file(&self, req: &TransferRequest) -> Result<TransferResult> {
        let key = req.key_prefix.clone();
        if key.is_empty() {
            return Err(TransferError::InvalidRequest(
                "single-file upload needs a key".to_string(),
            ));
        }
        let inv = self.prepare(req).await?;
        let path = req.local_path.clone();
        let aggregator = ResultAggregator::new(vec![path.display().to_string()]);
        let result = upload_unit(&inv, req, &path, &key).await;
        aggregator.record(0, &result);
        result?;
        Ok(aggregator.finish())
    }

    /// Upload the request's explicit file list under `key_prefix`
    ///
    /// Relative entries are resolved against `local_path`; keys are computed
    /// relative to `local_path`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` without a file list. Per-file failures, including
    /// entries outside `local_path`, are reported in the result.
    pub async fn upload_file_list(&self, req: &TransferRequest) -> Result<TransferResult> {
        let files = req.files.as_ref().ok_or_else(|| {
            TransferError::InvalidRequest("upload_file_list requires a file list".to_string())
        })?;
        let inv = self.prepare(req).await?;

        let mut work = Vec::with_capacity(files.len());
        for file in files {
            let full = if file.is_absolute() {
                file.clone()
            } else {
                req.local_path.join(file)
            };
            let item = relative_key(&req.local_path, &full)
                .map(|rel| (full.clone(), remote_key(&req.key_prefix, &rel)));
            work.push((full.display().to_string(), item));
        }

        info!(
            "Uploading {} listed file(s) to {}/{}",
            work.len(),
            req.bucket,
            req.key_prefix
        );
        self.run_uploads(inv, req, work).await
    }

    /// Upload every file below `local_path`, keys relative to it
    pub async fn upload_directory(&self, req: &TransferRequest) -> Result<TransferResult> {
        let inv = self.prepare(req).await?;
        let root = req.local_path.clone();
        let meta = tokio::fs::metadata(&root).await?;
        if !meta.is_dir() {
            return Err(TransferError::InvalidRequest(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let prefix = req.key_prefix.clone();
        let work = tokio::task::spawn_blocking(move || walk_upload_set(&root, &prefix))
            .await
            .map_err(|e| TransferError::Io(format!("directory walk failed: {}", e)))?;

        info!(
            "Uploading {} file(s) from {} to {}/{}",
            work.len(),
            req.local_path.display(),
            req.bucket,
            req.key_prefix
        );
        self.run_uploads(inv, req, work).await
    }

    async fn run_uploads(
        &self,
        inv: Invocation,
        req: &TransferRequest,
        work: Vec<(String, Result<(PathBuf, String)>)>,
    ) -> Result<TransferResult> {
        let shared = Arc::new(req.clone());
        let unit_inv = inv.clone();
        run_job(&inv, req.max_concurrency, work, move |item| {
            let inv = unit_inv.clone();
            let req = shared.clone();
            async move {
                let (path, key) = item?;
                upload_unit(&inv, &req, &path, &key).await
            }
        })
        .await
    }

    // === Copy ===

    /// Server-side copy of the source object to the same key in the target bucket
    ///
    /// Sources larger than the store's single-copy limit are copied part by
    /// part in a multipart session, aborted if any part fails.
    pub async fn copy_file(&self, req: &CopyRequest) -> Result<TransferResult> {
        req.validate()?;
        let inv = self.open(&req.client, req.max_concurrency).await?;
        let source = format!("{}/{}", req.source_bucket, req.source_key);
        let aggregator = ResultAggregator::new(vec![source]);
        let result = copy_unit(&inv, req).await;
        aggregator.record(0, &result);
        result?;
        Ok(aggregator.finish())
    }

    // === Deletes ===

    /// Delete the object at `key_prefix`
    pub async fn delete_file(&self, req: &TransferRequest) -> Result<()> {
        let inv = self.prepare(req).await?;
        with_retry(
            &req.retry,
            &inv.cancel,
            Operation::new("delete_object", &req.bucket, &req.key_prefix),
            |_| inv.store.delete_object(&req.bucket, &req.key_prefix),
        )
        .await?;
        debug!("Deleted {}/{}", req.bucket, req.key_prefix);
        Ok(())
    }

    /// Delete every key named by the request's file list, returning the count
    pub async fn delete_file_list(&self, req: &TransferRequest) -> Result<usize> {
        let files = req.files.as_ref().ok_or_else(|| {
            TransferError::InvalidRequest("delete_file_list requires a file list".to_string())
        })?;
        let inv = self.prepare(req).await?;
        let keys: Vec<String> = files
            .iter()
            .map(|f| key_from_path(f))
            .filter(|k| !k.is_empty())
            .collect();
        delete_batch(&inv, req, keys).await
    }

    /// Delete every key under `key_prefix/`, markers included
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for an empty or root prefix, `DeleteFailed` listing the
    /// keys that could not be removed.
    pub async fn delete_directory(&self, req: &TransferRequest) -> Result<usize> {
        if is_root_prefix(&req.key_prefix) {
            return Err(TransferError::InvalidRequest(
                "refusing to delete the whole bucket".to_string(),
            ));
        }
        let inv = self.prepare(req).await?;
        let prefix = directory_marker_key(&req.key_prefix);
        let keys: Vec<String> = DirectoryLister::new(inv.store.as_ref(), &req.retry, &inv.cancel)
            .list(&req.bucket, &prefix, false)
            .await?
            .into_iter()
            .map(|f| f.file_path)
            .collect();
        info!("Deleting {} key(s) under {}/{}", keys.len(), req.bucket, prefix);
        delete_batch(&inv, req, keys).await
    }

    // === Downloads ===

    /// Download the object at `key_prefix` to `local_path`
    pub async fn download_file(&self, req: &TransferRequest) -> Result<TransferResult> {
        let inv = self.prepare(req).await?;
        let aggregator = ResultAggregator::new(vec![req.key_prefix.clone()]);
        let result = downloader(&inv, req)
            .download(&req.bucket, &req.key_prefix, &req.local_path)
            .await;
        aggregator.record(0, &result);
        result?;
        Ok(aggregator.finish())
    }

    /// Download every file under `key_prefix/` into `local_path`
    ///
    /// Directory markers are skipped. Keys that would land outside
    /// `local_path` are recorded as `PathScope` failures.
    pub async fn download_directory(&self, req: &TransferRequest) -> Result<TransferResult> {
        let inv = self.prepare(req).await?;
        let prefix = if is_root_prefix(&req.key_prefix) {
            String::new()
        } else {
            directory_marker_key(&req.key_prefix)
        };
        let files = DirectoryLister::new(inv.store.as_ref(), &req.retry, &inv.cancel)
            .list(&req.bucket, &prefix, true)
            .await?;

        let work = download_set(&req.local_path, &prefix, files);

        info!(
            "Downloading {} file(s) from {}/{} to {}",
            work.len(),
            req.bucket,
            prefix,
            req.local_path.display()
        );
        let shared = Arc::new(req.clone());
        let unit_inv = inv.clone();
        run_job(&inv, req.max_concurrency, work, move |item| {
            let inv = unit_inv.clone();
            let req = shared.clone();
            async move {
                let (key, dest) = item?;
                downloader(&inv, &req).download(&req.bucket, &key, &dest).await
            }
        })
        .await
    }

    /// Stream one object, optionally a byte range of it
    pub async fn get_object(&self, get: &GetRequest, req: &TransferRequest) -> Result<ByteStream> {
        validate_bucket_name(&get.bucket)?;
        let inv = self.prepare(req).await?;
        with_retry(
            &req.retry,
            &inv.cancel,
            Operation::new("get_object", &get.bucket, &get.key),
            |_| inv.store.get_object(&get.bucket, &get.key, get.range),
        )
        .await
    }

    /// Fetch an object and parse it as `key=value` properties text
    pub async fn get_properties(
        &self,
        bucket: &str,
        key: &str,
        req: &TransferRequest,
    ) -> Result<HashMap<String, String>> {
        validate_bucket_name(bucket)?;
        let inv = self.prepare(req).await?;
        let store = &inv.store;
        let body = with_retry(
            &req.retry,
            &inv.cancel,
            Operation::new("get_object", bucket, key),
            |_| async move {
                let stream = store.get_object(bucket, key, None).await?;
                collect_body(stream).await
            },
        )
        .await?;
        Ok(parse_properties(&String::from_utf8_lossy(&body)))
    }

    // === Maintenance ===

    /// Abort multipart sessions in the request's bucket initiated before `threshold`
    pub async fn abort_stale_multipart_uploads(
        &self,
        req: &TransferRequest,
        threshold: DateTime<Utc>,
    ) -> Result<usize> {
        let inv = self.prepare(req).await?;
        StaleUploadReaper::new(inv.store.as_ref(), &req.retry, &inv.cancel)
            .with_concurrency(req.max_concurrency)
            .reap(&req.bucket, threshold)
            .await
    }

    /// Presigned read URL for `bucket/key`, valid until `expiration`
    pub async fn generate_presigned_get_url(
        &self,
        bucket: &str,
        key: &str,
        expiration: DateTime<Utc>,
        req: &TransferRequest,
    ) -> Result<String> {
        validate_bucket_name(bucket)?;
        if expiration <= Utc::now() {
            return Err(TransferError::InvalidRequest(format!(
                "presigned URL expiration {} is in the past",
                expiration
            )));
        }
        let inv = self.prepare(req).await?;
        inv.store
            .presign(&PresignedUrlSpec::new(bucket, key, expiration))
            .await
    }
}

async fn head(
    inv: &Invocation,
    req: &TransferRequest,
    bucket: &str,
    key: &str,
) -> Result<Option<ObjectMetadata>> {
    with_retry(
        &req.retry,
        &inv.cancel,
        Operation::new("head_object", bucket, key),
        |_| inv.store.head_object(bucket, key),
    )
    .await
}

fn downloader(inv: &Invocation, req: &TransferRequest) -> Downloader {
    Downloader::new(inv.store.clone(), req.retry.clone(), inv.cancel.clone())
        .with_concurrency(req.max_concurrency)
        .with_ranged_threshold(req.multipart_threshold)
        .with_chunk_size(req.part_size)
}

/// Upload one local file, multipart above the request's threshold
async fn upload_unit(inv: &Invocation, req: &TransferRequest, path: &Path, key: &str) -> Result<u64> {
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(TransferError::InvalidRequest(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let size = metadata.len();
    let content_type = mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_string());
    let options = req.write_options(content_type);

    if size > req.multipart_threshold {
        let report = MultipartUploader::new(inv.store.clone(), req.retry.clone(), inv.cancel.clone())
            .with_concurrency(req.max_concurrency)
            .with_part_size(req.part_size)
            .with_options(options)
            .with_part_buffers(inv.part_buffers.clone())
            .upload(&req.bucket, key, path)
            .await?;
        return Ok(report.bytes);
    }

    with_retry(
        &req.retry,
        &inv.cancel,
        Operation::new("put_object", &req.bucket, key),
        |_| {
            let payload = PutPayload::File {
                path: path.to_path_buf(),
                length: size,
            };
            inv.store.put_object(&req.bucket, key, payload, &options)
        },
    )
    .await?;
    debug!("Uploaded {} to {}/{} ({} bytes)", path.display(), req.bucket, key, size);
    Ok(size)
}

/// Copy one object, multipart above the store's part size limit
async fn copy_unit(inv: &Invocation, req: &CopyRequest) -> Result<u64> {
    let source = with_retry(
        &req.retry,
        &inv.cancel,
        Operation::new("head_object", &req.source_bucket, &req.source_key),
        |_| inv.store.head_object(&req.source_bucket, &req.source_key),
    )
    .await?
    .ok_or_else(|| TransferError::NotFound {
        bucket: req.source_bucket.clone(),
        key: req.source_key.clone(),
    })?;

    let options = WriteOptions {
        server_side_encryption: req.server_side_encryption.clone(),
        content_type: source.content_type.clone(),
    };

    if source.size > inv.store.limits().max_part_size {
        MultipartUploader::new(inv.store.clone(), req.retry.clone(), inv.cancel.clone())
            .with_concurrency(req.max_concurrency)
            .with_part_size(req.part_size)
            .with_options(options)
            .copy(
                &req.source_bucket,
                &req.source_key,
                source.size,
                &req.target_bucket,
                &req.source_key,
            )
            .await?;
    } else {
        with_retry(
            &req.retry,
            &inv.cancel,
            Operation::new("copy_object", &req.target_bucket, &req.source_key),
            |_| {
                inv.store.copy_object(
                    &req.source_bucket,
                    &req.source_key,
                    &req.target_bucket,
                    &req.source_key,
                    &options,
                )
            },
        )
        .await?;
    }
    info!(
        "Copied {}/{} to {}/{} ({} bytes)",
        req.source_bucket, req.source_key, req.target_bucket, req.source_key, source.size
    );
    Ok(source.size)
}

/// Files below `root` in name order, paired with their keys
///
/// Symlinks are followed and keyed by their path under `root`. Walk errors,
/// including dangling links and link cycles, become failed items so one
/// unreadable entry does not hide the rest of the tree.
fn walk_upload_set(root: &Path, prefix: &str) -> Vec<(String, Result<(PathBuf, String)>)> {
    let mut work = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                let path = entry.into_path();
                let item = relative_key(root, &path).map(|rel| (path.clone(), remote_key(prefix, &rel)));
                work.push((path.display().to_string(), item));
            }
            Ok(entry) if entry.file_type().is_dir() => {}
            Ok(entry) => debug!("Skipping special file {}", entry.path().display()),
            Err(e) => {
                let label = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| root.display().to_string());
                let error = match e.into_io_error() {
                    Some(io) => TransferError::from(io),
                    None => TransferError::Io("filesystem loop detected".to_string()),
                };
                work.push((label, Err(error)));
            }
        }
    }
    work
}

/// Listed keys paired with their local destinations
///
/// Keys that differ only in repeated separators (`p/a`, `p//a`) land on the
/// same file; every key after the first to claim a destination fails.
fn download_set(
    local_root: &Path,
    prefix: &str,
    files: Vec<StorageFile>,
) -> Vec<(String, Result<(String, PathBuf)>)> {
    let mut claimed: HashMap<PathBuf, String> = HashMap::new();
    files
        .into_iter()
        .map(|file| {
            let key = file.file_path;
            let item = local_path_for_key(local_root, prefix, &key).and_then(|dest| {
                if let Some(first) = claimed.get(&dest) {
                    return Err(TransferError::InvalidRequest(format!(
                        "{} maps to {}, already the destination of {}",
                        key,
                        dest.display(),
                        first
                    )));
                }
                claimed.insert(dest.clone(), key.clone());
                Ok((key.clone(), dest))
            });
            (key, item)
        })
        .collect()
}

/// Dispatch `work` to the worker pool and collect a [`TransferResult`]
///
/// The first job-aborting error cancels the invocation and is returned in
/// place of the partial result.
async fn run_job<T, F, Fut>(
    inv: &Invocation,
    workers: usize,
    work: Vec<(String, T)>,
    unit: F,
) -> Result<TransferResult>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<u64>> + Send + 'static,
{
    let (labels, items): (Vec<String>, Vec<T>) = work.into_iter().unzip();
    let aggregator = ResultAggregator::new(labels);
    let fatal: Mutex<Option<TransferError>> = Mutex::new(None);

    pool::run(
        items,
        workers,
        &inv.cancel,
        move |_, item| unit(item),
        |index, result: Result<u64>| {
            if let Err(e) = &result {
                if e.aborts_job() {
                    let mut slot = fatal.lock().unwrap_or_else(|p| p.into_inner());
                    if slot.is_none() {
                        warn!("Stopping job: {}", e);
                        *slot = Some(e.clone());
                    }
                    inv.cancel.cancel();
                }
            }
            aggregator.record(index, &result);
        },
    )
    .await;

    if let Some(e) = fatal.into_inner().unwrap_or_else(|p| p.into_inner()) {
        return Err(e);
    }
    if inv.cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    let result = aggregator.finish();
    info!(
        "Job finished: {} succeeded, {} failed, {} bytes in {:?}",
        result.succeeded(),
        result.failed(),
        result.total_bytes,
        result.elapsed
    );
    Ok(result)
}

async fn delete_batch(inv: &Invocation, req: &TransferRequest, keys: Vec<String>) -> Result<usize> {
    if keys.is_empty() {
        return Ok(0);
    }
    let failures = with_retry(
        &req.retry,
        &inv.cancel,
        Operation::new("delete_objects", &req.bucket, &req.key_prefix),
        |_| inv.store.delete_objects(&req.bucket, &keys),
    )
    .await?;

    if failures.is_empty() {
        debug!("Deleted {} key(s) from {}", keys.len(), req.bucket);
        return Ok(keys.len());
    }
    for failure in &failures {
        warn!("Failed to delete {}/{}: {}", req.bucket, failure.key, failure.message);
    }
    Err(TransferError::DeleteFailed {
        bucket: req.bucket.clone(),
        failures,
    })
}
