//! Bounded parallel execution with order-preserving results
//!
//! Both the agent pool's tournament fan-out and the knowledge router's batch
//! queries run many independent futures at once but must hand results back
//! in input order. This helper runs them through a semaphore so that a
//! single fan-out cannot exceed its concurrency budget.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use conductor_sdk::{OrchestratorError, Result};

/// Execute `items` concurrently, at most `limit` at a time, returning one
/// result per item in input order. Per-item failures are recorded in place;
/// the call itself only fails if the semaphore is closed, which cannot
/// happen while it is owned here.
pub async fn execute_bounded<T, F, Fut, R>(items: Vec<T>, limit: usize, op: F) -> Vec<Result<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(usize, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let sem = Arc::new(Semaphore::new(limit.max(1)));
    let op = Arc::new(op);
    let mut tasks = FuturesUnordered::new();

    let total = items.len();
    for (idx, item) in items.into_iter().enumerate() {
        let sem = sem.clone();
        let op = op.clone();
        tasks.push(async move {
            let permit = sem.acquire().await;
            let result = match permit {
                Ok(_permit) => op(idx, item).await,
                Err(_) => Err(OrchestratorError::Operation("semaphore closed".into())),
            };
            (idx, result)
        });
    }

    let mut slots: Vec<Option<Result<R>>> = (0..total).map(|_| None).collect();
    while let Some((idx, result)) = tasks.next().await {
        slots[idx] = Some(result);
    }

    slots
        .into_iter()
        .map(|slot| slot.expect("every index resolves exactly once"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_preserve_input_order() {
        // Later items finish first; output order must still match input.
        let items = vec![30u64, 20, 10];
        let results = execute_bounded(items, 3, |_, delay| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(delay)
        })
        .await;

        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![30, 20, 10]);
    }

    #[tokio::test]
    async fn test_per_item_failures_do_not_poison_the_batch() {
        let results = execute_bounded(vec![1, 2, 3], 2, |_, n| async move {
            if n == 2 {
                Err(OrchestratorError::Operation("boom".into()))
            } else {
                Ok(n * 10)
            }
        })
        .await;

        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), 10);
        assert!(results[1].is_err());
        assert_eq!(*results[2].as_ref().unwrap(), 30);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let running_c = running.clone();
        let peak_c = peak.clone();
        let results = execute_bounded(vec![(); 8], 2, move |_, _| {
            let running = running_c.clone();
            let peak = peak_c.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(results.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
