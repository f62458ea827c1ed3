//! Job engine - 単発実行と継続実行
//!
//! A [`Job`] only knows how to do one unit of work. [`JobExecutor`] owns the
//! bookkeeping around it (run counter, last result, metrics) and the
//! continuous loop: iteration limit, interruptible delay between runs,
//! cooperative cancellation, and fan-out to several worker loops.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::RunnerOptions;
use crate::domain::{JobError, JobResult, JobResultKind, RunId};
use crate::ports::{
    IdGenerator, MetricsSink, NoopMetrics, SystemClock, UlidGenerator, events, metric_name,
};

/// A runnable unit of work.
///
/// # 使用例
/// ```ignore
/// struct HelloWorldJob;
///
/// #[async_trait]
/// impl Job for HelloWorldJob {
///     fn name(&self) -> &str {
///         "hello"
///     }
///
///     async fn run_once(&self, _cancel: &CancellationToken) -> Result<JobResult, JobError> {
///         tracing::info!("hello, world");
///         Ok(JobResult::success())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// Do one unit of work. Long waits inside should watch `cancel`.
    async fn run_once(&self, cancel: &CancellationToken) -> Result<JobResult, JobError>;

    /// Worker loops a continuous run fans out to, unless the caller overrides it.
    fn concurrency(&self) -> usize {
        1
    }
}

/// Lifecycle of a continuous run. A bare `run` does not change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Stopped,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => JobState::Running,
            2 => JobState::Stopped,
            _ => JobState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            JobState::Idle => 0,
            JobState::Running => 1,
            JobState::Stopped => 2,
        }
    }
}

/// Stop policy for [`JobExecutor::run_continuous`].
///
/// With neither a limit nor a cancellation the loop runs until the process
/// ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContinuousOptions {
    pub iteration_limit: Option<u64>,
    pub delay: Option<Duration>,
    /// Overrides [`Job::concurrency`].
    pub concurrency: Option<usize>,
}

impl ContinuousOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iterations(mut self, limit: u64) -> Self {
        self.iteration_limit = Some(limit);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = Some(workers);
        self
    }
}

impl From<&RunnerOptions> for ContinuousOptions {
    fn from(options: &RunnerOptions) -> Self {
        Self {
            iteration_limit: options.iteration_limit,
            delay: options.interval(),
            concurrency: options.concurrency,
        }
    }
}

/// Tally of a continuous run, summed across worker loops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub successes: u64,
    pub no_ops: u64,
    pub failures: u64,
    pub cancelled: u64,
}

impl RunSummary {
    fn record(&mut self, result: &JobResult) {
        self.iterations += 1;
        match result.kind {
            JobResultKind::Success => self.successes += 1,
            JobResultKind::NoOp => self.no_ops += 1,
            JobResultKind::Failed => self.failures += 1,
            JobResultKind::Cancelled => self.cancelled += 1,
        }
    }

    fn merge(mut self, other: RunSummary) -> Self {
        self.iterations += other.iterations;
        self.successes += other.successes;
        self.no_ops += other.no_ops;
        self.failures += other.failures;
        self.cancelled += other.cancelled;
        self
    }
}

// Pause after a `NoOp` when no delay is configured, so an empty queue polled
// with a zero dequeue timeout does not spin.
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// Drives a [`Job`]: single runs, continuous runs, background runs.
pub struct JobExecutor {
    core: RunCore,
    state: AtomicU8,
    ids: Arc<dyn IdGenerator>,
    current_run: Mutex<Option<RunId>>,
}

/// What every worker of a continuous run shares. Cheap to clone into tasks.
#[derive(Clone)]
struct RunCore {
    job: Arc<dyn Job>,
    run_count: Arc<AtomicU64>,
    last_result: Arc<Mutex<Option<JobResult>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl JobExecutor {
    pub fn new(job: Arc<dyn Job>) -> Self {
        Self {
            core: RunCore {
                job,
                run_count: Arc::new(AtomicU64::new(0)),
                last_result: Arc::new(Mutex::new(None)),
                metrics: Arc::new(NoopMetrics),
            },
            state: AtomicU8::new(JobState::Idle.as_u8()),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            current_run: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.core.metrics = metrics;
        self
    }

    /// Source of the run ids tagged onto continuous runs.
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn job(&self) -> &Arc<dyn Job> {
        &self.core.job
    }

    pub fn name(&self) -> &str {
        self.core.job.name()
    }

    pub fn run_count(&self) -> u64 {
        self.core.run_count.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn last_result(&self) -> Option<JobResult> {
        self.core
            .last_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Id of the latest continuous run, if one was started.
    pub fn current_run_id(&self) -> Option<RunId> {
        *self
            .current_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the job once. Errors and panics become a `Failed` result.
    pub async fn run(&self, cancel: &CancellationToken) -> JobResult {
        self.core.run(cancel).await
    }

    /// Run repeatedly until the iteration limit is reached or `cancel` fires.
    ///
    /// Failed iterations are counted and logged but never stop the loop. With
    /// more than one worker each loop is its own tokio task.
    pub async fn run_continuous(
        &self,
        options: &ContinuousOptions,
        cancel: &CancellationToken,
    ) -> RunSummary {
        let run_id = self.ids.generate_run_id();
        *self
            .current_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(run_id);
        let workers = options
            .concurrency
            .unwrap_or_else(|| self.core.job.concurrency())
            .max(1);
        let span = tracing::info_span!("job", job = %self.name(), run = %run_id);

        async {
            self.state.store(JobState::Running.as_u8(), Ordering::SeqCst);
            tracing::info!(
                workers,
                iteration_limit = ?options.iteration_limit,
                delay = ?options.delay,
                "continuous run started"
            );

            let claimed = Arc::new(AtomicU64::new(0));
            let summary = if workers == 1 {
                self.core.worker_loop(0, options, &claimed, cancel).await
            } else {
                let mut loops = JoinSet::new();
                for worker in 0..workers {
                    let core = self.core.clone();
                    let options = options.clone();
                    let claimed = Arc::clone(&claimed);
                    let cancel = cancel.clone();
                    loops.spawn(
                        async move { core.worker_loop(worker, &options, &claimed, &cancel).await }
                            .in_current_span(),
                    );
                }

                let mut summary = RunSummary::default();
                while let Some(joined) = loops.join_next().await {
                    match joined {
                        Ok(worker_summary) => summary = summary.merge(worker_summary),
                        Err(err) => tracing::error!(error = %err, "worker task failed"),
                    }
                }
                summary
            };

            self.state.store(JobState::Stopped.as_u8(), Ordering::SeqCst);
            tracing::info!(
                iterations = summary.iterations,
                successes = summary.successes,
                failures = summary.failures,
                cancelled = cancel.is_cancelled(),
                "continuous run stopped"
            );
            summary
        }
        .instrument(span)
        .await
    }

    /// Run continuously on a tokio task. Cancelling `parent` (or the returned
    /// handle) stops it.
    pub fn spawn(
        self: Arc<Self>,
        options: ContinuousOptions,
        parent: &CancellationToken,
    ) -> JobHandle {
        let cancel = parent.child_token();
        let join = tokio::spawn({
            let cancel = cancel.clone();
            async move { self.run_continuous(&options, &cancel).await }
        });
        JobHandle { cancel, join }
    }
}

impl RunCore {
    async fn run(&self, cancel: &CancellationToken) -> JobResult {
        self.run_count.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let result = match AssertUnwindSafe(self.job.run_once(cancel))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                if matches!(&err, JobError::Queue(queue_err) if queue_err.is_lease_violation()) {
                    tracing::error!(error = %err, "lease contract violated");
                } else {
                    tracing::warn!(error = %err, "run failed");
                }
                JobResult::failed(err.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(panic = %message, "run panicked");
                JobResult::failed(format!("panicked: {message}"))
            }
        };

        self.report(&result, started.elapsed());
        *self
            .last_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
        result
    }

    async fn worker_loop(
        &self,
        worker: usize,
        options: &ContinuousOptions,
        claimed: &AtomicU64,
        cancel: &CancellationToken,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        let limit_reached = || {
            options
                .iteration_limit
                .is_some_and(|limit| claimed.load(Ordering::SeqCst) >= limit)
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(limit) = options.iteration_limit
                && claimed.fetch_add(1, Ordering::SeqCst) >= limit
            {
                break;
            }

            let result = self.run(cancel).await;
            tracing::trace!(worker, kind = ?result.kind, "iteration finished");
            summary.record(&result);

            if limit_reached() {
                break;
            }

            let pause = match options.delay {
                Some(delay) if !delay.is_zero() => Some(delay),
                _ if result.kind == JobResultKind::NoOp => Some(IDLE_BACKOFF),
                _ => None,
            };
            match pause {
                Some(pause) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                // Let other tasks (including whoever cancels us) make progress.
                None => tokio::task::yield_now().await,
            }
        }
        summary
    }

    fn report(&self, result: &JobResult, elapsed: Duration) {
        let name = self.job.name();
        self.metrics.counter(&metric_name(name, events::RUN), 1);
        match result.kind {
            JobResultKind::Success | JobResultKind::NoOp => {
                self.metrics.counter(&metric_name(name, events::RUN_SUCCESS), 1)
            }
            JobResultKind::Failed => {
                self.metrics.counter(&metric_name(name, events::RUN_FAILURE), 1)
            }
            JobResultKind::Cancelled => {}
        }
        self.metrics
            .timing(&metric_name(name, events::RUN_DURATION), elapsed);
    }
}

/// Handle to a job running in the background.
pub struct JobHandle {
    cancel: CancellationToken,
    join: JoinHandle<RunSummary>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to end on its own (iteration limit or cancellation).
    pub async fn join(self) -> Result<RunSummary, JobError> {
        self.join
            .await
            .map_err(|err| JobError::Join(err.to_string()))
    }

    /// Cancel and wait for in-flight iterations to finish.
    pub async fn stop(self) -> Result<RunSummary, JobError> {
        self.cancel();
        self.join().await
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
