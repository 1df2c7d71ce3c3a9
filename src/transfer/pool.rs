/*!
 * Bounded worker pool
 *
 * A fixed number of workers pull `(index, item)` pairs from a shared task
 * queue and push `(index, result)` pairs onto a result channel. The caller's
 * callback sees results as they complete; the index identifies the
 * submission slot so outcomes can be reported in submission order.
 *
 * Cancellation stops the feeder and idle workers. Items never handed to a
 * worker produce no result.
 */

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Run `work` over `items` with at most `workers` in parallel
///
/// `on_result` is called on the caller's task for every finished item.
/// Returns the number of items that produced a result.
pub async fn run<T, R, F, Fut, C>(
    items: Vec<T>,
    workers: usize,
    cancel: &CancellationToken,
    work: F,
    mut on_result: C,
) -> usize
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(usize, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    C: FnMut(usize, R),
{
    if items.is_empty() {
        return 0;
    }
    let workers = workers.clamp(1, items.len());

    let (task_tx, task_rx) = mpsc::channel::<(usize, T)>(workers);
    let task_rx = Arc::new(Mutex::new(task_rx));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, R)>();
    let work = Arc::new(work);

    let mut set = JoinSet::new();
    for _ in 0..workers {
        let task_rx = task_rx.clone();
        let result_tx = result_tx.clone();
        let work = work.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            loop {
                let next = {
                    let mut queue = task_rx.lock().await;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        next = queue.recv() => next,
                    }
                };
                let Some((index, item)) = next else { break };
                let result = work(index, item).await;
                if result_tx.send((index, result)).is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let feeder_cancel = cancel.clone();
    let feeder = async move {
        for (index, item) in items.into_iter().enumerate() {
            tokio::select! {
                biased;
                _ = feeder_cancel.cancelled() => break,
                sent = task_tx.send((index, item)) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    };

    let collector = async {
        let mut received = 0usize;
        while let Some((index, result)) = result_rx.recv().await {
            on_result(index, result);
            received += 1;
        }
        received
    };

    let ((), received) = tokio::join!(feeder, collector);

    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            warn!("Transfer worker failed: {}", e);
        }
    }
    received
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_all_items_processed() {
        let cancel = CancellationToken::new();
        let mut results = vec![None; 20];

        let received = run(
            (0..20u64).collect(),
            4,
            &cancel,
            |_, item| async move { item * 2 },
            |index, value| results[index] = Some(value),
        )
        .await;

        assert_eq!(received, 20);
        for (i, value) in results.iter().enumerate() {
            assert_eq!(*value, Some(i as u64 * 2));
        }
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (active.clone(), peak.clone());
        run(
            (0..30).collect::<Vec<u32>>(),
            3,
            &cancel,
            move |_, _| {
                let (a, p) = (a.clone(), p.clone());
                async move {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch() {
        let cancel = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));

        let trigger = cancel.clone();
        let counter = started.clone();
        let received = run(
            (0..100).collect::<Vec<u32>>(),
            2,
            &cancel,
            move |index, _| {
                let counter = counter.clone();
                let trigger = trigger.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if index == 3 {
                        trigger.cancel();
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            },
            |_, _| {},
        )
        .await;

        assert!(received < 100);
        assert_eq!(received, started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let cancel = CancellationToken::new();
        let received = run(Vec::<u8>::new(), 4, &cancel, |_, _| async {}, |_, _: ()| {}).await;
        assert_eq!(received, 0);
    }
}
