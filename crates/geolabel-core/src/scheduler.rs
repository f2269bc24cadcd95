//! Bounded worker pool.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

/// Runs deferred tasks with at most `max_concurrency` in flight.
///
/// A task is spawned as soon as a permit frees up, so short tasks (cache
/// hits) never wait behind a slow batch-mate.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    max_concurrency: usize,
}

impl WorkerPool {
    /// `0` is treated as `1`.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run every task and wait for all of them to settle.
    ///
    /// Results come back in submission order. A task that panics yields
    /// `None`; its siblings are unaffected.
    pub async fn run<F, Fut, T>(&self, tasks: Vec<F>) -> Vec<Option<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut results: Vec<Option<T>> =
            std::iter::repeat_with(|| None).take(tasks.len()).collect();
        let sem = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set = JoinSet::new();

        for (index, task) in tasks.into_iter().enumerate() {
            // Never closed, so acquisition only fails if the pool is torn down.
            let Ok(permit) = sem.clone().acquire_owned().await else {
                break;
            };
            join_set.spawn(async move {
                let _permit = permit;
                (index, task().await)
            });

            // Reap whatever already finished so results don't pile up.
            while let Some(res) = join_set.try_join_next() {
                settle(res, &mut results);
            }
        }

        while let Some(res) = join_set.join_next().await {
            settle(res, &mut results);
        }

        results
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(10)
    }
}

fn settle<T>(res: Result<(usize, T), tokio::task::JoinError>, results: &mut [Option<T>]) {
    match res {
        Ok((index, value)) => results[index] = Some(value),
        Err(e) if e.is_panic() => error!(error = %e, "task panicked"),
        Err(e) => error!(error = %e, "task cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_in_submission_order() {
        let pool = WorkerPool::new(3);
        let tasks: Vec<_> = (0..8u64)
            .map(|i| {
                move || async move {
                    tokio::time::sleep(Duration::from_millis(40 - i * 5)).await;
                    i
                }
            })
            .collect();

        let results = pool.run(tasks).await;
        assert_eq!(results, (0..8).map(Some).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..25)
            .map(|i| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                move || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5 + (i % 4) * 3)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .collect();

        WorkerPool::new(4).run(tasks).await;
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let tasks: Vec<_> = [1u32, 2, 3]
            .into_iter()
            .map(|i| {
                move || async move {
                    if i == 2 {
                        panic!("boom");
                    }
                    i
                }
            })
            .collect();

        let results = WorkerPool::new(2).run(tasks).await;
        assert_eq!(results, vec![Some(1), None, Some(3)]);
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_runs() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.max_concurrency(), 1);
        let results = pool.run(vec![|| async { "ok" }]).await;
        assert_eq!(results, vec![Some("ok")]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let tasks: Vec<fn() -> std::future::Ready<()>> = Vec::new();
        assert!(WorkerPool::default().run(tasks).await.is_empty());
    }
}
