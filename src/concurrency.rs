//! Runs a batch of requests with bounded parallelism. Task starts are
//! staggered so that a cold start or a retry wave does not hit the stream
//! service as one synchronized burst.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::sync::Semaphore;
use tokio::time;

/// Apply `f` to every item with at most `limit` invocations in flight.
/// Task `i` first sleeps `i × stagger`, then waits for one of the permits.
/// Results come back in input order. A task that dies is logged and its
/// result omitted.
pub async fn map_concurrently<T, R, F, Fut>(
    limit: usize,
    stagger: Duration,
    f: F,
    items: Vec<T>,
) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let f = Arc::new(f);
    let tasks: Vec<_> = items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let task_semaphore = semaphore.clone();
            let task_f = f.clone();
            tokio::spawn(async move {
                time::sleep(stagger * i as u32).await;
                let _permit = task_semaphore.acquire().await.ok();
                task_f(item).await
            })
        })
        .collect();

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok(result) => results.push(result),
            Err(e) => warn!("A concurrent task died before completing: {e}"),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use test_log::test;

    use super::*;

    #[test(tokio::test(start_paused = true))]
    async fn test_results_in_input_order() {
        let results = map_concurrently(
            2,
            Duration::from_millis(1),
            |i: u32| async move { i * 10 },
            vec![1, 2, 3, 4, 5],
        )
        .await;
        assert_eq!(results, [10, 20, 30, 40, 50]);
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_parallelism_is_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));
        let task_in_flight = in_flight.clone();
        let task_high_water = high_water.clone();
        let results = map_concurrently(
            2,
            Duration::from_millis(1),
            move |i: u32| {
                let in_flight = task_in_flight.clone();
                let high_water = task_high_water.clone();
                async move {
                    let running = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(running, Ordering::SeqCst);
                    time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    i
                }
            },
            vec![0, 1, 2, 3, 4, 5],
        )
        .await;
        assert_eq!(results.len(), 6);
        assert!(high_water.load(Ordering::SeqCst) <= 2);
    }

    #[test(tokio::test)]
    async fn test_empty_input() {
        let results =
            map_concurrently(3, Duration::from_millis(1), |i: u32| async move { i }, vec![]).await;
        assert!(results.is_empty());
    }
}
