//! Bounded worker pool.
//!
//! Runs one async task per input with at most `concurrency` in flight and
//! a per-task timeout. Results come back in input order regardless of
//! completion order. Dropping the returned future aborts every task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    concurrency: usize,
    task_timeout: Duration,
}

impl WorkerPool {
    pub fn new(concurrency: usize, task_timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            task_timeout,
        }
    }

    /// Apply `f` to every input. `on_done` is called with the number of
    /// finished tasks each time one completes.
    pub async fn run<I, T, F, Fut>(
        &self,
        inputs: Vec<I>,
        f: F,
        mut on_done: impl FnMut(usize),
    ) -> Vec<Result<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let total = inputs.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let f = Arc::new(f);
        let timeout = self.task_timeout;
        let mut set = JoinSet::new();

        for (idx, input) in inputs.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let f = f.clone();
            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (idx, Err(anyhow!("worker pool closed"))),
                };
                let result = match tokio::time::timeout(timeout, f(input)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("task timed out after {}s", timeout.as_secs_f64())),
                };
                (idx, result)
            });
        }

        let mut slots: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();
        let mut done = 0usize;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => tracing::error!(error = %e, "worker task aborted"),
            }
            done += 1;
            on_done(done);
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(anyhow!("worker task aborted"))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_results_in_input_order() {
        let pool = WorkerPool::new(4, Duration::from_secs(5));
        let inputs: Vec<u64> = vec![50, 10, 30, 0, 20];
        let results = pool
            .run(
                inputs.clone(),
                |ms| async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(ms * 2)
                },
                |_| {},
            )
            .await;
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![100, 20, 60, 0, 40]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2, Duration::from_secs(5));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let results = pool
            .run(
                (0..10).collect::<Vec<u32>>(),
                move |_| {
                    let (a, p) = (a.clone(), p.clone());
                    async move {
                        let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                        p.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        a.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                |_| {},
            )
            .await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_timeout_and_errors_are_per_task() {
        let pool = WorkerPool::new(3, Duration::from_millis(50));
        let results = pool
            .run(
                vec![0u32, 1, 2],
                |i| async move {
                    match i {
                        0 => Ok(i),
                        1 => {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            Ok(i)
                        }
                        _ => Err(anyhow!("boom")),
                    }
                },
                |_| {},
            )
            .await;
        assert_eq!(*results[0].as_ref().unwrap(), 0);
        assert!(results[1].as_ref().unwrap_err().to_string().contains("timed out"));
        assert_eq!(results[2].as_ref().unwrap_err().to_string(), "boom");
    }

    #[tokio::test]
    async fn test_progress_callback_counts_up() {
        let pool = WorkerPool::new(2, Duration::from_secs(5));
        let mut seen = Vec::new();
        pool.run((0..4).collect::<Vec<u32>>(), |i| async move { Ok(i) }, |n| seen.push(n))
            .await;
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }
}
