//! Multipart upload of large local files and large server-side copies
//!
//! A [`MultipartSession`] moves strictly `INITIATED -> UPLOADING ->
//! {COMPLETED | ABORTED}`. The uploader owns its session exclusively and
//! never leaves it open: part exhaustion, completion failure and
//! cancellation all abort it, and a drop guard schedules a best-effort abort
//! if the upload future itself is dropped.

use super::retry::{retry_with_attempts, with_retry, Exhausted, Operation, RetryPolicy};
use crate::error::{ErrorKind, Result, TransferError};
use crate::store::{ByteRange, CompletedPart, MultipartHandle, ObjectStore, StoreLimits, WriteOptions};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a multipart session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Initiated,
    Uploading,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Initiated, SessionState::Uploading)
                | (SessionState::Uploading, SessionState::Completed)
                | (SessionState::Uploading, SessionState::Aborted)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Initiated => "INITIATED",
            SessionState::Uploading => "UPLOADING",
            SessionState::Completed => "COMPLETED",
            SessionState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Local record of one remote multipart upload
#[derive(Debug, Clone)]
pub struct MultipartSession {
    handle: MultipartHandle,
    initiated_at: DateTime<Utc>,
    parts: Vec<CompletedPart>,
    state: SessionState,
}

impl MultipartSession {
    pub fn new(handle: MultipartHandle, initiated_at: DateTime<Utc>) -> Self {
        Self {
            handle,
            initiated_at,
            parts: Vec::new(),
            state: SessionState::Initiated,
        }
    }

    pub fn handle(&self) -> &MultipartHandle {
        &self.handle
    }

    pub fn key(&self) -> &str {
        &self.handle.key
    }

    pub fn upload_id(&self) -> &str {
        &self.handle.upload_id
    }

    pub fn initiated_at(&self) -> DateTime<Utc> {
        self.initiated_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Completed parts in ascending part-number order
    pub fn parts(&self) -> &[CompletedPart] {
        &self.parts
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(TransferError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn begin_upload(&mut self) -> Result<()> {
        self.transition(SessionState::Uploading)
    }

    /// Record an uploaded part; a repeated part number replaces the earlier one
    pub fn record_part(&mut self, part: CompletedPart) -> Result<()> {
        if self.state != SessionState::Uploading {
            return Err(TransferError::IllegalTransition {
                from: self.state,
                to: SessionState::Uploading,
            });
        }
        match self
            .parts
            .binary_search_by_key(&part.part_number, |p| p.part_number)
        {
            Ok(index) => self.parts[index] = part,
            Err(index) => self.parts.insert(index, part),
        }
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        self.transition(SessionState::Completed)
    }

    pub fn mark_aborted(&mut self) -> Result<()> {
        self.transition(SessionState::Aborted)
    }

    /// Total bytes of the recorded parts
    pub fn uploaded_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }
}

/// Partitioning of a file into multipart parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub file_size: u64,
    pub part_size: u64,
    pub part_count: u32,
}

impl PartPlan {
    /// Choose a part size of at least `preferred_part_size` and the store
    /// minimum, grown as needed to keep the part count within the store
    /// maximum.
    pub fn compute(file_size: u64, preferred_part_size: u64, limits: &StoreLimits) -> Result<Self> {
        if file_size == 0 {
            return Err(TransferError::InvalidRequest(
                "Empty files are uploaded with a single put".to_string(),
            ));
        }

        let min_for_count = file_size.div_ceil(u64::from(limits.max_parts.max(1)));
        let part_size = preferred_part_size
            .max(limits.min_part_size)
            .max(min_for_count)
            .max(1);
        if part_size > limits.max_part_size {
            return Err(TransferError::InvalidRequest(format!(
                "File of {} bytes needs parts of {} bytes, above the store maximum of {}",
                file_size, part_size, limits.max_part_size
            )));
        }

        Ok(Self {
            file_size,
            part_size,
            part_count: file_size.div_ceil(part_size) as u32,
        })
    }

    /// Part numbers (1-based) with their byte ranges, in order
    pub fn parts(&self) -> impl Iterator<Item = (u32, ByteRange)> {
        let plan = *self;
        (1..=plan.part_count).map(move |part_number| {
            let start = u64::from(part_number - 1) * plan.part_size;
            let len = plan.part_size.min(plan.file_size - start);
            (part_number, ByteRange::from_offset(start, len))
        })
    }
}

/// Aborts a still-open session when dropped
struct SessionGuard {
    store: Arc<dyn ObjectStore>,
    session: MultipartSession,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.session.state().is_terminal() {
            return;
        }
        let handle = self.session.handle().clone();
        warn!(
            "Multipart upload {} for {}/{} dropped while {}, scheduling abort",
            handle.upload_id,
            handle.bucket,
            handle.key,
            self.session.state()
        );
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let store = self.store.clone();
                runtime.spawn(async move {
                    if let Err(e) = store.abort_multipart(&handle).await {
                        warn!("Failed to abort multipart upload {}: {}", handle.upload_id, e);
                    }
                });
            }
            Err(_) => warn!(
                "No runtime to abort multipart upload {}; it is left for the stale upload reaper",
                handle.upload_id
            ),
        }
    }
}

/// Caps the part data read into memory across every upload sharing it
///
/// One slot holds one part. File-backed parts reserve a slot before reading
/// and release it once the store call returns, so at most `slots` parts sit
/// in memory whether they are waiting for a store permit or in flight.
#[derive(Debug)]
pub struct PartBuffers {
    slots: Arc<Semaphore>,
    held: AtomicU64,
    peak: AtomicU64,
}

impl PartBuffers {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(slots.max(1))),
            held: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        }
    }

    /// Wait for a free slot and account `bytes` against it
    pub async fn reserve(self: &Arc<Self>, bytes: u64) -> Result<PartBuffer> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::Cancelled)?;
        let held = self.held.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak.fetch_max(held, Ordering::SeqCst);
        Ok(PartBuffer {
            buffers: self.clone(),
            bytes,
            _permit: permit,
        })
    }

    /// Bytes currently reserved
    pub fn held_bytes(&self) -> u64 {
        self.held.load(Ordering::SeqCst)
    }

    /// Highest number of bytes reserved at once
    pub fn peak_bytes(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }
}

/// One reserved part slot, released on drop
#[derive(Debug)]
pub struct PartBuffer {
    buffers: Arc<PartBuffers>,
    bytes: u64,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PartBuffer {
    fn drop(&mut self) {
        self.buffers.held.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

/// Where the bytes of each part come from
#[derive(Debug, Clone, Copy)]
enum PartSource<'a> {
    /// Ranges of a local file, read into memory per part
    File(&'a Path),

    /// Ranges of an existing object, copied by the store
    Object { bucket: &'a str, key: &'a str },
}

impl fmt::Display for PartSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartSource::File(path) => write!(f, "{}", path.display()),
            PartSource::Object { bucket, key } => write!(f, "{}/{}", bucket, key),
        }
    }
}

/// Outcome of a completed multipart upload
#[derive(Debug, Clone)]
pub struct MultipartReport {
    pub upload_id: String,
    pub parts: Vec<CompletedPart>,
    pub bytes: u64,
    pub state: SessionState,
}

/// Builds one object as a multipart upload, from a local file or by
/// server-side copy of an existing object
pub struct MultipartUploader {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    concurrency: usize,
    preferred_part_size: u64,
    options: WriteOptions,
    buffers: Option<Arc<PartBuffers>>,
}

impl MultipartUploader {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        let preferred_part_size = store.limits().min_part_size;
        Self {
            store,
            policy,
            cancel,
            concurrency: 4,
            preferred_part_size,
            options: WriteOptions::default(),
            buffers: None,
        }
    }

    /// Maximum parts in flight for this object
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.preferred_part_size = part_size;
        self
    }

    pub fn with_options(mut self, options: WriteOptions) -> Self {
        self.options = options;
        self
    }

    /// Share part buffers with other uploads; without this each upload
    /// gets its own, one slot per part in flight
    pub fn with_part_buffers(mut self, buffers: Arc<PartBuffers>) -> Self {
        self.buffers = Some(buffers);
        self
    }

    /// Upload `path` to `bucket/key`
    ///
    /// # Errors
    ///
    /// Returns `TransferError::PartUpload` when a part exhausts its retries,
    /// `TransferError::Cancelled` on cancellation. In both cases the remote
    /// session has been aborted (best effort) before returning.
    pub async fn upload(&self, bucket: &str, key: &str, path: &Path) -> Result<MultipartReport> {
        let file_size = tokio::fs::metadata(path).await?.len();
        self.run(bucket, key, file_size, PartSource::File(path)).await
    }

    /// Copy `source_size` bytes of `source_bucket/source_key` to `bucket/key`
    /// part by part on the store side
    ///
    /// # Errors
    ///
    /// Same as [`upload`](Self::upload): a failed or cancelled copy aborts
    /// the target session.
    pub async fn copy(
        &self,
        source_bucket: &str,
        source_key: &str,
        source_size: u64,
        bucket: &str,
        key: &str,
    ) -> Result<MultipartReport> {
        let source = PartSource::Object {
            bucket: source_bucket,
            key: source_key,
        };
        self.run(bucket, key, source_size, source).await
    }

    async fn run(
        &self,
        bucket: &str,
        key: &str,
        size: u64,
        source: PartSource<'_>,
    ) -> Result<MultipartReport> {
        let plan = PartPlan::compute(size, self.preferred_part_size, &self.store.limits())?;

        let upload_id = with_retry(
            &self.policy,
            &self.cancel,
            Operation::new("initiate_multipart", bucket, key),
            |_| self.store.initiate_multipart(bucket, key, &self.options),
        )
        .await?;

        let handle = MultipartHandle {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
        };
        let mut guard = SessionGuard {
            store: self.store.clone(),
            session: MultipartSession::new(handle, Utc::now()),
        };
        guard.session.begin_upload()?;

        debug!(
            "Uploading {} ({} bytes) to {}/{} in {} part(s) of {} bytes, upload {}",
            source,
            size,
            bucket,
            key,
            plan.part_count,
            plan.part_size,
            guard.session.upload_id()
        );

        let buffers = self
            .buffers
            .clone()
            .unwrap_or_else(|| Arc::new(PartBuffers::new(self.concurrency)));
        let outcome = match self.upload_parts(&mut guard.session, &plan, source, &buffers).await {
            Ok(()) => self.complete(&mut guard.session).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                info!(
                    "Completed multipart upload of {}/{} ({} parts, {} bytes)",
                    bucket,
                    key,
                    guard.session.parts().len(),
                    size
                );
                Ok(MultipartReport {
                    upload_id: guard.session.upload_id().to_string(),
                    parts: guard.session.parts().to_vec(),
                    bytes: guard.session.uploaded_bytes(),
                    state: guard.session.state(),
                })
            }
            Err(e) => {
                self.abort(&mut guard.session).await;
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        session: &mut MultipartSession,
        plan: &PartPlan,
        source: PartSource<'_>,
        buffers: &Arc<PartBuffers>,
    ) -> Result<()> {
        let handle = session.handle().clone();
        let mut uploads = stream::iter(plan.parts())
            .map(|(part_number, range)| self.upload_part(&handle, source, buffers, part_number, range))
            .buffer_unordered(self.concurrency);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                next = uploads.next() => next,
            };
            match next {
                Some(Ok(part)) => session.record_part(part)?,
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }

    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        source: PartSource<'_>,
        buffers: &Arc<PartBuffers>,
        part_number: u32,
        range: ByteRange,
    ) -> Result<CompletedPart> {
        let op = Operation::new("upload_part", &handle.bucket, &handle.key);
        let result = retry_with_attempts(&self.policy, &self.cancel, op, |_| async move {
            match source {
                PartSource::File(path) => {
                    let _slot = buffers.reserve(range.len()).await?;
                    let data = read_range(path, range).await?;
                    self.store.upload_part(handle, part_number, data).await
                }
                PartSource::Object { bucket, key } => {
                    self.store
                        .upload_part_copy(handle, part_number, bucket, key, range)
                        .await
                }
            }
        })
        .await;

        match result {
            Ok(etag) => {
                debug!(
                    "Uploaded part {} ({} bytes) of {}",
                    part_number,
                    range.len(),
                    handle.key
                );
                Ok(CompletedPart {
                    part_number,
                    etag,
                    size: range.len(),
                })
            }
            Err(Exhausted {
                error: TransferError::Cancelled,
                ..
            }) => Err(TransferError::Cancelled),
            Err(Exhausted { error, attempts }) => Err(TransferError::PartUpload {
                bucket: handle.bucket.clone(),
                key: handle.key.clone(),
                upload_id: handle.upload_id.clone(),
                part_number,
                attempts,
                message: error.to_string(),
            }),
        }
    }

    async fn complete(&self, session: &mut MultipartSession) -> Result<()> {
        let handle = session.handle().clone();
        let parts = session.parts().to_vec();
        with_retry(
            &self.policy,
            &self.cancel,
            Operation::new("complete_multipart", &handle.bucket, &handle.key),
            |_| self.store.complete_multipart(&handle, &parts),
        )
        .await?;
        session.mark_completed()
    }

    /// Best-effort abort; runs even after cancellation
    async fn abort(&self, session: &mut MultipartSession) {
        let handle = session.handle().clone();
        let uncancellable = CancellationToken::new();
        let result = with_retry(
            &self.policy,
            &uncancellable,
            Operation::new("abort_multipart", &handle.bucket, &handle.key),
            |_| self.store.abort_multipart(&handle),
        )
        .await;

        match result {
            Ok(()) => info!(
                "Aborted multipart upload {} for {}/{}",
                handle.upload_id, handle.bucket, handle.key
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Multipart upload {} already gone", handle.upload_id)
            }
            Err(e) => warn!(
                "Failed to abort multipart upload {} for {}/{}, left for the stale upload reaper: {}",
                handle.upload_id, handle.bucket, handle.key, e
            ),
        }

        if let Err(e) = session.mark_aborted() {
            warn!("{}", e);
        }
    }
}

async fn read_range(path: &Path, range: ByteRange) -> Result<Bytes> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    let mut buffer = vec![0u8; range.len() as usize];
    file.read_exact(&mut buffer).await?;
    Ok(Bytes::from(buffer))
}
