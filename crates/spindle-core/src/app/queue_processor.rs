//! QueueProcessorJob - Queue と handler をつなぐ接着剤
//!
//! One `run_once` is one dequeue/handle/settle cycle:
//! 1. dequeue with a bounded wait (cancellable)
//! 2. nothing arrived -> `NoOp` (or `Cancelled` if that is why)
//! 3. handler ok -> complete, handler error or panic -> abandon
//!
//! Continuous runs fan out `concurrency` of these cycles through the
//! [`JobExecutor`](super::JobExecutor). The queue's own counters stay the only
//! in-flight bookkeeping.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::job::{Job, panic_message};
use crate::domain::{AbandonDisposition, HandlerError, JobError, JobResult, LeaseState};
use crate::ports::{MetricsSink, NoopMetrics, Queue, QueueEntry, events, metric_name};

/// Per-item handler.
///
/// The handler may settle the entry itself (e.g. `complete` early, or
/// `renew_lease` while working); the processor only settles entries still
/// `Active` when the handler returns. The run result and the per-job
/// `completed` / `abandoned` counters follow the final lease state.
#[async_trait]
pub trait QueueHandler<T>: Send + Sync {
    async fn handle(
        &self,
        entry: &QueueEntry<T>,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

pub struct QueueProcessorJob<T, H>
where
    T: Send + Sync + 'static,
{
    name: String,
    queue: Arc<dyn Queue<T>>,
    handler: H,
    dequeue_timeout: Duration,
    concurrency: usize,
    metrics: Arc<dyn MetricsSink>,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> QueueProcessorJob<T, H>
where
    T: Send + Sync + 'static,
    H: QueueHandler<T>,
{
    pub fn new(name: impl Into<String>, queue: Arc<dyn Queue<T>>, handler: H) -> Self {
        Self {
            name: name.into(),
            queue,
            handler,
            dequeue_timeout: Duration::from_secs(1),
            concurrency: 1,
            metrics: Arc::new(NoopMetrics),
            _payload: PhantomData,
        }
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn queue(&self) -> &Arc<dyn Queue<T>> {
        &self.queue
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    async fn process(
        &self,
        entry: &QueueEntry<T>,
        cancel: &CancellationToken,
    ) -> Result<JobResult, JobError> {
        let started = Instant::now();

        // panic も abandon に変換する（lease を宙に浮かせない）
        let outcome = match AssertUnwindSafe(self.handler.handle(entry, cancel))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        };

        if let Err(err) = &outcome {
            tracing::warn!(attempts = entry.attempts(), error = %err, "handler failed");
        }
        if entry.state().await == LeaseState::Active {
            match &outcome {
                Ok(()) => entry.complete().await?,
                Err(err) => {
                    let disposition = entry.fail(err.to_string()).await?;
                    if disposition == AbandonDisposition::DeadLetter {
                        tracing::warn!("item dead-lettered after {} attempts", entry.attempts());
                    }
                }
            }
        }

        // The lease, not the handler's return value, decides what happened.
        let result = match (entry.state().await, outcome) {
            (LeaseState::Completed, outcome) => {
                if let Err(err) = outcome {
                    tracing::warn!(error = %err, "handler failed after completing the item");
                }
                tracing::debug!(attempts = entry.attempts(), "item completed");
                self.record(events::COMPLETED);
                JobResult::success()
            }
            (LeaseState::Abandoned, outcome) => {
                self.record(events::ABANDONED);
                match outcome {
                    Err(err) => JobResult::failed(err.to_string()),
                    Ok(()) => JobResult::failed("item abandoned by handler"),
                }
            }
            (LeaseState::Active, _) => JobResult::failed("lease left active"),
        };

        self.metrics.timing(
            &metric_name(&self.name, events::PROCESS_DURATION),
            started.elapsed(),
        );
        Ok(result)
    }

    fn record(&self, event: &str) {
        self.metrics.counter(&metric_name(&self.name, event), 1);
    }
}

#[async_trait]
impl<T, H> Job for QueueProcessorJob<T, H>
where
    T: Send + Sync + 'static,
    H: QueueHandler<T>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<JobResult, JobError> {
        let Some(entry) = self.queue.dequeue(self.dequeue_timeout, cancel).await? else {
            return Ok(if cancel.is_cancelled() {
                JobResult::cancelled()
            } else {
                JobResult::no_op()
            });
        };

        let span = tracing::debug_span!("item", queue = %self.queue.name(), item = %entry.id());
        self.process(&entry, cancel).instrument(span).await
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }
}

/// Adapts an async closure into a [`QueueHandler`].
///
/// ```ignore
/// let handler = FnHandler::new(|entry: &QueueEntry<String>| {
///     let payload = entry.payload().clone();
///     async move {
///         tracing::info!(%payload, "processing");
///         Ok(())
///     }
/// });
/// ```
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<T, F, Fut> QueueHandler<T> for FnHandler<F>
where
    T: Send + Sync + 'static,
    F: Fn(&QueueEntry<T>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(
        &self,
        entry: &QueueEntry<T>,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        (self.f)(entry).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::config::QueueOptions;
    use crate::domain::JobResultKind;
    use crate::impls::{InMemoryMetrics, InMemoryQueue, InMemoryQueueBuilder};

    struct OkHandler;

    #[async_trait]
    impl QueueHandler<u32> for OkHandler {
        async fn handle(
            &self,
            _entry: &QueueEntry<u32>,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl QueueHandler<u32> for FailingHandler {
        async fn handle(
            &self,
            entry: &QueueEntry<u32>,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            Err(HandlerError::new(format!("cannot handle {}", entry.payload())))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl QueueHandler<u32> for PanickingHandler {
        async fn handle(
            &self,
            _entry: &QueueEntry<u32>,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            panic!("handler blew up");
        }
    }

    /// Settles the entry itself, then reports success.
    struct SelfCompletingHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl QueueHandler<u32> for SelfCompletingHandler {
        async fn handle(
            &self,
            entry: &QueueEntry<u32>,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            entry.renew_lease().await.map_err(|e| HandlerError::new(e.to_string()))?;
            entry.complete().await.map_err(|e| HandlerError::new(e.to_string()))
        }
    }

    /// Completes the item, then reports an error anyway.
    struct CompleteThenFail;

    #[async_trait]
    impl QueueHandler<u32> for CompleteThenFail {
        async fn handle(
            &self,
            entry: &QueueEntry<u32>,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            entry.complete().await.map_err(|e| HandlerError::new(e.to_string()))?;
            Err(HandlerError::new("post-processing failed"))
        }
    }

    /// Gives the item back, then reports success.
    struct AbandonThenOk;

    #[async_trait]
    impl QueueHandler<u32> for AbandonThenOk {
        async fn handle(
            &self,
            entry: &QueueEntry<u32>,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            entry.abandon().await.map_err(|e| HandlerError::new(e.to_string()))?;
            Ok(())
        }
    }

    fn queue(max_attempts: u32) -> Arc<InMemoryQueue<u32>> {
        Arc::new(InMemoryQueue::new(QueueOptions {
            max_attempts,
            ..QueueOptions::named("numbers")
        }))
    }

    fn job<H: QueueHandler<u32>>(
        queue: &Arc<InMemoryQueue<u32>>,
        handler: H,
    ) -> QueueProcessorJob<u32, H> {
        QueueProcessorJob::new("numbers-job", queue.clone() as Arc<dyn Queue<u32>>, handler)
            .with_dequeue_timeout(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let queue = queue(3);
        let job = job(&queue, OkHandler);

        let result = job.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.kind, JobResultKind::NoOp);
    }

    #[tokio::test]
    async fn cancelled_wait_reports_cancelled_and_leaves_items() {
        let queue = queue(3);
        queue.enqueue(1).await.unwrap();
        let job = job(&queue, OkHandler);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = job.run_once(&cancel).await.unwrap();

        assert_eq!(result.kind, JobResultKind::Cancelled);
        let count = queue.queue_count().await.unwrap();
        assert_eq!((count.pending, count.working), (1, 0));
    }

    #[tokio::test]
    async fn successful_handler_completes_the_item() {
        let queue = queue(3);
        queue.enqueue(7).await.unwrap();
        let metrics = Arc::new(InMemoryMetrics::new());
        let job = job(&queue, OkHandler).with_metrics(metrics.clone());

        let result = job.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(result.kind, JobResultKind::Success);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.working, 0);
        assert_eq!(metrics.counter_value("numbers-job.completed"), 1);
        assert!(metrics.timing_summary("numbers-job.process-duration").is_some());
    }

    #[tokio::test]
    async fn failing_handler_abandons_and_requeues() {
        let queue = queue(3);
        queue.enqueue(7).await.unwrap();
        let job = job(&queue, FailingHandler);

        let result = job.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(result.kind, JobResultKind::Failed);
        assert!(result.reason.unwrap().contains("cannot handle 7"));
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!((stats.queued, stats.working), (1, 0));
    }

    #[tokio::test]
    async fn single_attempt_policy_dead_letters() {
        let queue = queue(1);
        queue.enqueue(7).await.unwrap();
        let job = job(&queue, FailingHandler);

        job.run_once(&CancellationToken::new()).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.queued, stats.working, stats.dead_letter), (0, 0, 1));
        let dead = queue.dead_letter_items().await.unwrap();
        assert_eq!(*dead[0].payload(), 7);
    }

    #[tokio::test]
    async fn handler_panic_is_caught_and_abandoned() {
        let queue = queue(3);
        queue.enqueue(7).await.unwrap();
        let job = job(&queue, PanickingHandler);

        let result = job.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(result.kind, JobResultKind::Failed);
        assert!(result.reason.unwrap().contains("handler blew up"));
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.abandoned, stats.working), (1, 0));
    }

    #[tokio::test]
    async fn entries_settled_by_the_handler_are_left_alone() {
        let queue = queue(3);
        queue.enqueue(7).await.unwrap();
        let handler = SelfCompletingHandler {
            calls: AtomicU32::new(0),
        };
        let job = job(&queue, handler);

        let result = job.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(result.kind, JobResultKind::Success);
        assert_eq!(job.handler().calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn outcome_follows_the_lease_when_handler_completed_then_failed() {
        let queue = queue(3);
        queue.enqueue(7).await.unwrap();
        let metrics = Arc::new(InMemoryMetrics::new());
        let job = job(&queue, CompleteThenFail).with_metrics(metrics.clone());

        let result = job.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(result.kind, JobResultKind::Success);
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.completed, stats.abandoned), (1, 0));
        assert_eq!(metrics.counter_value("numbers-job.completed"), 1);
        assert_eq!(metrics.counter_value("numbers-job.abandoned"), 0);
    }

    #[tokio::test]
    async fn outcome_follows_the_lease_when_handler_abandoned_then_succeeded() {
        let queue = queue(3);
        queue.enqueue(7).await.unwrap();
        let metrics = Arc::new(InMemoryMetrics::new());
        let job = job(&queue, AbandonThenOk).with_metrics(metrics.clone());

        let result = job.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(result.kind, JobResultKind::Failed);
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.completed, stats.abandoned, stats.queued), (0, 1, 1));
        assert_eq!(metrics.counter_value("numbers-job.completed"), 0);
        assert_eq!(metrics.counter_value("numbers-job.abandoned"), 1);
    }

    #[tokio::test]
    async fn closure_handlers_work() {
        let queue = queue(3);
        queue.enqueue(7).await.unwrap();
        let handler = FnHandler::new(|entry: &QueueEntry<u32>| {
            let even = entry.payload() % 2 == 0;
            async move {
                if even {
                    Ok(())
                } else {
                    Err(HandlerError::new("odd"))
                }
            }
        });
        let job = job(&queue, handler);

        let result = job.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.kind, JobResultKind::Failed);
    }

    #[tokio::test]
    async fn concurrency_is_reported_to_the_executor() {
        let queue: Arc<InMemoryQueue<u32>> = Arc::new(
            InMemoryQueueBuilder::new(QueueOptions::named("numbers")).build(),
        );
        let job = job(&queue, OkHandler).with_concurrency(4);
        assert_eq!(job.concurrency(), 4);
        assert_eq!(job.with_concurrency(0).concurrency(), 1);
    }
}
