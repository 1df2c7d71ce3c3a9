//! Aggregated outcome of a coordinator invocation
//!
//! Workers report into a [`ResultAggregator`] concurrently. Counters are
//! atomics; per-item outcomes go into a mutex-guarded table indexed by
//! submission order, so the final [`TransferResult`] lists items in the order
//! they were submitted regardless of completion order.

use crate::error::{ErrorKind, TransferError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Status of one work item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Succeeded { bytes: u64 },
    Failed { kind: ErrorKind, message: String },
}

/// Outcome of one work item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Local path or remote key the item refers to
    pub item: String,

    #[serde(flatten)]
    pub status: ItemStatus,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ItemStatus::Succeeded { .. })
    }
}

/// Final report of a coordinator invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    /// Files transferred successfully
    pub total_files: u64,

    /// Bytes transferred successfully
    pub total_bytes: u64,

    #[serde(with = "duration_millis")]
    pub elapsed: Duration,

    /// Per-item outcomes in submission order
    pub outcomes: Vec<ItemOutcome>,
}

impl TransferResult {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(ItemOutcome::is_success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Throughput in bytes per second
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_bytes as f64 / secs
        } else {
            0.0
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Collects per-item outcomes from concurrent workers
pub struct ResultAggregator {
    files: AtomicU64,
    bytes: AtomicU64,
    labels: Vec<String>,
    outcomes: Mutex<Vec<Option<ItemOutcome>>>,
    started: Instant,
}

impl ResultAggregator {
    /// One slot per submitted item, labelled for the report
    pub fn new(labels: Vec<String>) -> Self {
        let slots = vec![None; labels.len()];
        Self {
            files: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            labels,
            outcomes: Mutex::new(slots),
            started: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn record_success(&self, index: usize, bytes: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.store(index, ItemStatus::Succeeded { bytes });
    }

    pub fn record_failure(&self, index: usize, error: &TransferError) {
        self.store(
            index,
            ItemStatus::Failed {
                kind: error.kind(),
                message: error.to_string(),
            },
        );
    }

    /// Record an item result as returned by a unit of work
    pub fn record(&self, index: usize, result: &crate::error::Result<u64>) {
        match result {
            Ok(bytes) => self.record_success(index, *bytes),
            Err(e) => self.record_failure(index, e),
        }
    }

    fn store(&self, index: usize, status: ItemStatus) {
        let mut outcomes = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        if let (Some(slot), Some(label)) = (outcomes.get_mut(index), self.labels.get(index)) {
            *slot = Some(ItemOutcome {
                item: label.clone(),
                status,
            });
        }
    }

    /// Counters so far: (files, bytes)
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.files.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }

    /// Produce the final report
    ///
    /// Items that never ran (the invocation was stopped first) are reported
    /// as cancelled.
    pub fn finish(self) -> TransferResult {
        let elapsed = self.started.elapsed();
        let (total_files, total_bytes) = self.snapshot();
        let outcomes = self.outcomes.into_inner().unwrap_or_else(|e| e.into_inner());
        let outcomes = outcomes
            .into_iter()
            .zip(self.labels)
            .map(|(outcome, label)| {
                outcome.unwrap_or(ItemOutcome {
                    item: label,
                    status: ItemStatus::Failed {
                        kind: ErrorKind::Cancelled,
                        message: "not attempted".to_string(),
                    },
                })
            })
            .collect();

        TransferResult {
            total_files,
            total_bytes,
            elapsed,
            outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("file-{}", i)).collect()
    }

    #[test]
    fn test_outcomes_follow_submission_order() {
        let agg = ResultAggregator::new(labels(3));
        agg.record_success(2, 30);
        agg.record_failure(1, &TransferError::AccessDenied("nope".to_string()));
        agg.record_success(0, 10);

        let result = agg.finish();
        assert_eq!(result.total_files, 2);
        assert_eq!(result.total_bytes, 40);
        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.failed(), 1);
        let items: Vec<_> = result.outcomes.iter().map(|o| o.item.as_str()).collect();
        assert_eq!(items, vec!["file-0", "file-1", "file-2"]);
        assert!(matches!(
            result.outcomes[1].status,
            ItemStatus::Failed {
                kind: ErrorKind::AccessDenied,
                ..
            }
        ));
    }

    #[test]
    fn test_unrun_items_are_cancelled() {
        let agg = ResultAggregator::new(labels(2));
        agg.record_success(0, 1);
        let result = agg.finish();
        assert!(!result.all_succeeded());
        assert_eq!(
            result.outcomes[1].status,
            ItemStatus::Failed {
                kind: ErrorKind::Cancelled,
                message: "not attempted".to_string()
            }
        );
    }

    #[test]
    fn test_failure_kind_ignores_context() {
        let agg = ResultAggregator::new(labels(1));
        let err = TransferError::TransientNetwork("reset".to_string()).context("put_object failed");
        agg.record(0, &Err(err));
        let result = agg.finish();
        assert_eq!(result.failures().count(), 1);
        match &result.outcomes[0].status {
            ItemStatus::Failed { kind, message } => {
                assert_eq!(*kind, ErrorKind::TransientNetwork);
                assert!(message.contains("put_object failed"));
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_result_serializes_flat() {
        let agg = ResultAggregator::new(labels(1));
        agg.record_success(0, 5);
        let json = serde_json::to_value(agg.finish()).unwrap();
        assert_eq!(json["outcomes"][0]["status"], "succeeded");
        assert_eq!(json["outcomes"][0]["bytes"], 5);
        assert_eq!(json["total_files"], 1);
    }

    #[test]
    fn test_concurrent_recording() {
        let agg = std::sync::Arc::new(ResultAggregator::new(labels(64)));
        let handles: Vec<_> = (0..64)
            .map(|i| {
                let agg = agg.clone();
                std::thread::spawn(move || agg.record_success(i, 2))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(agg.snapshot(), (64, 128));
    }
}
