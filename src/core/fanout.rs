//! Concurrent broadcast-and-join.
//!
//! The lock coordinator fans a phase out to every participant and blocks on
//! the aggregate outcome. This primitive spawns N futures, collects N results
//! and enforces an optional deadline; slots whose future did not resolve in
//! time come back as `None`. In-flight work is not forcibly cancelled.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::warn;

/// Run all `futs` concurrently and return their results in submission order.
///
/// With a `deadline`, any future still pending once it elapses yields `None`
/// in its slot; without one the call waits for every future.
pub async fn fan_out<T, Fut>(futs: Vec<Fut>, deadline: Option<Duration>) -> Vec<Option<T>>
where
    Fut: Future<Output = T>,
{
    let total = futs.len();
    let mut slots: Vec<Option<T>> = Vec::with_capacity(total);
    slots.resize_with(total, || None);

    let mut pending: FuturesUnordered<_> = futs
        .into_iter()
        .enumerate()
        .map(|(idx, fut)| async move { (idx, fut.await) })
        .collect();

    let cutoff = deadline.map(|d| Instant::now() + d);
    let mut resolved = 0usize;

    while resolved < total {
        let next = match cutoff {
            Some(at) => tokio::select! {
                item = pending.next() => item,
                _ = sleep_until(at) => {
                    warn!(
                        resolved,
                        total,
                        "fan-out deadline elapsed with participants outstanding"
                    );
                    break;
                }
            },
            None => pending.next().await,
        };

        match next {
            Some((idx, value)) => {
                slots[idx] = Some(value);
                resolved += 1;
            }
            None => break,
        }
    }

    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_fan_out_collects_in_order() {
        let futs = vec![
            Box::pin(async {
                sleep(Duration::from_millis(30)).await;
                1
            }) as std::pin::Pin<Box<dyn Future<Output = i32> + Send>>,
            Box::pin(async { 2 }),
            Box::pin(async {
                sleep(Duration::from_millis(10)).await;
                3
            }),
        ];
        let out = fan_out(futs, None).await;
        assert_eq!(out, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn test_fan_out_deadline_marks_stragglers() {
        let futs = vec![
            Box::pin(async { "fast" }) as std::pin::Pin<Box<dyn Future<Output = &str> + Send>>,
            Box::pin(async {
                sleep(Duration::from_secs(5)).await;
                "slow"
            }),
        ];
        let out = fan_out(futs, Some(Duration::from_millis(50))).await;
        assert_eq!(out[0], Some("fast"));
        assert_eq!(out[1], None);
    }
}
