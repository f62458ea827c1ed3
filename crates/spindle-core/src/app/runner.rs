//! JobRunner - プロセス境界
//!
//! Resolves a job by name, runs it once or continuously, and maps the outcome
//! to a process exit code. Resolution failures are fatal here and nowhere
//! else.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::RunnerOptions;
use crate::domain::JobResultKind;
use crate::ports::{MetricsSink, NoopMetrics};

use super::job::{ContinuousOptions, Job, JobExecutor};
use super::registry::JobRegistry;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const JOB_FAILED: i32 = 1;
    pub const RESOLUTION_FAILED: i32 = 2;
}

pub struct JobRunner {
    options: RunnerOptions,
    metrics: Arc<dyn MetricsSink>,
}

impl JobRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self {
            options,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Resolve `job_name` (through `bootstrapper` or the registry default)
    /// and run it.
    pub async fn run(
        &self,
        registry: &JobRegistry,
        job_name: &str,
        bootstrapper: Option<&str>,
        cancel: &CancellationToken,
    ) -> i32 {
        match registry.resolve(job_name, bootstrapper) {
            Ok(job) => self.run_job(job, cancel).await,
            Err(err) => {
                tracing::error!(job = job_name, ?bootstrapper, error = %err, "failed to resolve job");
                exit_code::RESOLUTION_FAILED
            }
        }
    }

    /// Run an already constructed job.
    ///
    /// A single run fails the process only when the run itself failed. A
    /// continuous run fails it only when its final iteration failed.
    pub async fn run_job(&self, job: Arc<dyn Job>, cancel: &CancellationToken) -> i32 {
        let executor = JobExecutor::new(job).with_metrics(self.metrics.clone());

        if self.options.continuous {
            let options = ContinuousOptions::from(&self.options);
            let summary = executor.run_continuous(&options, cancel).await;
            tracing::info!(
                job = executor.name(),
                iterations = summary.iterations,
                successes = summary.successes,
                no_ops = summary.no_ops,
                failures = summary.failures,
                "job finished"
            );
        } else {
            let result = executor.run(cancel).await;
            tracing::info!(job = executor.name(), kind = ?result.kind, reason = ?result.reason, "job finished");
        }

        match executor.last_result() {
            Some(result) if result.kind == JobResultKind::Failed => exit_code::JOB_FAILED,
            _ => exit_code::SUCCESS,
        }
    }
}
