//! Transfer engine
//!
//! Moves files between a local filesystem and an [`ObjectStore`]:
//!
//! - [`TransferCoordinator`]: public operations, work-set construction and
//!   fan-out to the worker pool
//! - [`MultipartUploader`]: large-file uploads and large copies with
//!   per-part retry and a session that always ends completed or aborted
//! - [`Downloader`]: single or ranged-parallel downloads through a staging file
//! - [`DirectoryLister`]: paginated, de-duplicated remote listings
//! - [`StaleUploadReaper`]: cleanup of abandoned multipart sessions
//! - [`ResultAggregator`]: per-invocation counters and per-item outcomes
//!
//! [`ObjectStore`]: crate::store::ObjectStore

pub mod coordinator;
pub mod download;
pub mod lister;
pub mod multipart;
pub mod path_mapper;
pub mod pool;
pub mod properties;
pub mod reaper;
pub mod request;
pub mod results;
pub mod retry;

pub use coordinator::TransferCoordinator;
pub use download::Downloader;
pub use lister::{DirectoryLister, StorageFile};
pub use multipart::{
    MultipartReport, MultipartSession, MultipartUploader, PartBuffers, PartPlan, SessionState,
};
pub use properties::parse_properties;
pub use reaper::StaleUploadReaper;
pub use request::{CopyRequest, GetRequest, TransferRequest};
pub use results::{ItemOutcome, ItemStatus, ResultAggregator, TransferResult};
pub use retry::{BackoffStrategy, RetryPolicy};
