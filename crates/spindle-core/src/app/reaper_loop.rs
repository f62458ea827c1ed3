//! ReaperLoop - Lease 期限切れの回収
//!
//! Backends reap lazily whenever they are touched; this loop covers idle
//! periods by calling `reap_expired_leases` on a fixed interval until
//! cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::ports::Queue;

pub struct ReaperLoop<T>
where
    T: Send + Sync + 'static,
{
    queue: Arc<dyn Queue<T>>,
    interval: Duration,
}

impl<T> ReaperLoop<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(queue: Arc<dyn Queue<T>>, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// Reap until `cancel` fires. Returns the number of leases reaped.
    ///
    /// Backend errors are logged and retried on the next tick.
    pub async fn run(&self, cancel: &CancellationToken) -> usize {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut total = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.queue.reap_expired_leases().await {
                Ok(0) => {}
                Ok(reaped) => {
                    tracing::info!(queue = %self.queue.name(), reaped, "reaped expired leases");
                    total += reaped;
                }
                Err(err) => {
                    tracing::warn!(queue = %self.queue.name(), error = %err, "lease reaping failed");
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOptions;
    use crate::impls::InMemoryQueue;

    #[tokio::test(start_paused = true)]
    async fn reaps_leases_left_by_a_dead_worker() {
        let queue = Arc::new(InMemoryQueue::<u32>::new(QueueOptions {
            work_item_timeout_ms: 100,
            ..QueueOptions::named("reaped")
        }));
        queue.enqueue(1).await.unwrap();
        let entry = queue
            .dequeue(Duration::ZERO, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        let cancel = CancellationToken::new();
        let reaper = ReaperLoop::new(queue.clone() as Arc<dyn Queue<u32>>, Duration::from_millis(50));
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { reaper.run(&cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.queued, stats.working, stats.timeouts), (1, 0, 1));
        assert!(entry.complete().await.unwrap_err().is_lease_violation());
    }

    #[tokio::test]
    async fn stops_immediately_when_cancelled() {
        let queue = Arc::new(InMemoryQueue::<u32>::new(QueueOptions::default()));
        let reaper = ReaperLoop::new(queue as Arc<dyn Queue<u32>>, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(reaper.run(&cancel).await, 0);
    }
}
