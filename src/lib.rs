/*!
 * Stowage - object store file transfer engine
 *
 * Moves data between a local filesystem and S3-compatible object stores:
 * - Single files, explicit file lists and whole directory trees
 * - Multipart uploads and ranged downloads for large objects
 * - Bounded concurrency shared by every network call of a job
 * - Local retry with exponential backoff and per-call timeouts
 * - Per-item outcomes for multi-file jobs, continue-on-error
 * - Cleanup of abandoned multipart uploads
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod store;
pub mod transfer;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{ErrorKind, Result, TransferError};
pub use store::{ClientConfig, ObjectStore, StoreProvider};
pub use transfer::{
    CopyRequest, GetRequest, RetryPolicy, StorageFile, TransferCoordinator, TransferRequest,
    TransferResult,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
