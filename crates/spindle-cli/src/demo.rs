//! Built-in demo jobs and the registry that exposes them by name.
//!
//! - `hello`: logs a greeting (the `demo` bootstrapper supplies it)
//! - `sample-queue`: drains the sample queue, failing items marked `poison`

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use spindle_core::app::{Bootstrapper, Job, JobRegistry, QueueHandler, QueueProcessorJob, Services};
use spindle_core::config::Config;
use spindle_core::domain::{HandlerError, JobError, JobResult, ResolveError};
use spindle_core::impls::InMemoryMetrics;
use spindle_core::ports::{MetricsSink, Queue, QueueEntry};

pub const HELLO: &str = "hello";
pub const SAMPLE_QUEUE: &str = "sample-queue";
pub const DEMO_BOOTSTRAPPER: &str = "demo";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleWorkItem {
    pub seq: usize,
    pub path: String,
}

impl SampleWorkItem {
    pub fn new(seq: usize) -> Self {
        Self {
            seq,
            path: format!("somepath{seq}"),
        }
    }
}

pub type SampleQueue = dyn Queue<SampleWorkItem>;

pub struct Greeting(pub String);

struct HelloWorldJob {
    greeting: String,
}

#[async_trait]
impl Job for HelloWorldJob {
    fn name(&self) -> &str {
        HELLO
    }

    async fn run_once(&self, _cancel: &CancellationToken) -> Result<JobResult, JobError> {
        tracing::info!("hello, {}", self.greeting);
        Ok(JobResult::success())
    }
}

struct SampleHandler;

#[async_trait]
impl QueueHandler<SampleWorkItem> for SampleHandler {
    async fn handle(
        &self,
        entry: &QueueEntry<SampleWorkItem>,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let item = entry.payload();
        if item.path.contains("poison") {
            return Err(HandlerError::new(format!("refusing {}", item.path)));
        }
        tracing::debug!(seq = item.seq, path = %item.path, attempts = entry.attempts(), "processed");
        Ok(())
    }
}

struct DemoBootstrapper;

impl Bootstrapper for DemoBootstrapper {
    fn name(&self) -> &str {
        DEMO_BOOTSTRAPPER
    }

    fn configure(&self, services: &mut Services) -> Result<(), String> {
        services.insert(Greeting("spindle".to_string()));
        Ok(())
    }
}

/// Registry with the demo jobs. `config`, `metrics` and `queue` become base
/// services shared by every resolution.
pub fn registry(
    config: Config,
    metrics: Arc<InMemoryMetrics>,
    queue: Arc<SampleQueue>,
) -> Result<JobRegistry, ResolveError> {
    let mut registry = JobRegistry::new();
    registry
        .services_mut()
        .insert(config)
        .insert_arc(metrics)
        .insert(queue);

    registry.register_job(HELLO, |services: &Services| {
        let greeting = services
            .get::<Greeting>()
            .map_or_else(|| "world".to_string(), |greeting| greeting.0.clone());
        Ok(Arc::new(HelloWorldJob { greeting }) as Arc<dyn Job>)
    })?;

    registry.register_job(SAMPLE_QUEUE, |services: &Services| {
        let config = services.require::<Config>(SAMPLE_QUEUE)?;
        let queue: Arc<SampleQueue> = services
            .require::<Arc<SampleQueue>>(SAMPLE_QUEUE)?
            .as_ref()
            .clone();
        let metrics: Arc<dyn MetricsSink> = services.require::<InMemoryMetrics>(SAMPLE_QUEUE)?;

        let job = QueueProcessorJob::new(SAMPLE_QUEUE, queue, SampleHandler)
            .with_dequeue_timeout(config.runner.dequeue_timeout())
            .with_concurrency(config.runner.concurrency.unwrap_or(1))
            .with_metrics(metrics);
        Ok(Arc::new(job) as Arc<dyn Job>)
    })?;

    registry.register_bootstrapper(Arc::new(DemoBootstrapper))?;
    registry.set_default_bootstrapper(DEMO_BOOTSTRAPPER)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use spindle_core::impls::InMemoryQueue;

    use super::*;

    fn demo_registry() -> (JobRegistry, Arc<InMemoryQueue<SampleWorkItem>>) {
        let config = Config::default();
        let queue = Arc::new(InMemoryQueue::new(config.queue.clone()));
        let registry = registry(
            config,
            Arc::new(InMemoryMetrics::new()),
            queue.clone() as Arc<SampleQueue>,
        )
        .unwrap();
        (registry, queue)
    }

    #[test]
    fn exposes_demo_jobs() {
        let (registry, _) = demo_registry();
        assert_eq!(
            registry.job_names(),
            vec![HELLO.to_string(), SAMPLE_QUEUE.to_string()]
        );
    }

    #[tokio::test]
    async fn sample_queue_job_drains_the_shared_queue() {
        let (registry, queue) = demo_registry();
        queue.enqueue(SampleWorkItem::new(1)).await.unwrap();
        let job = registry.resolve(SAMPLE_QUEUE, None).unwrap();

        let result = job.run_once(&CancellationToken::new()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(queue.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn poison_items_are_abandoned() {
        let (registry, queue) = demo_registry();
        queue
            .enqueue(SampleWorkItem {
                seq: 0,
                path: "poison".to_string(),
            })
            .await
            .unwrap();
        let job = registry.resolve(SAMPLE_QUEUE, None).unwrap();

        let result = job.run_once(&CancellationToken::new()).await.unwrap();

        assert!(result.is_failure());
        assert_eq!(queue.stats().await.unwrap().abandoned, 1);
    }
}
