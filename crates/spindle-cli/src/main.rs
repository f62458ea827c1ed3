//! spindle - run a registered job by name.
//!
//! ```text
//! spindle sample-queue --seed 1000 --continuous --concurrency 4
//! spindle hello --iterations 3 --interval-ms 500
//! ```

mod demo;
mod observability;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use spindle_core::app::{JobRunner, ReaperLoop, exit_code};
use spindle_core::config::Config;
use spindle_core::impls::{InMemoryMetrics, InMemoryQueueBuilder};

use crate::demo::{SampleQueue, SampleWorkItem};

#[derive(Parser, Debug)]
#[command(name = "spindle")]
#[command(about = "Run a registered job once or continuously")]
struct Args {
    /// Name of the job to run
    job: Option<String>,

    /// Bootstrapper that prepares the job's services (default: demo)
    #[arg(long)]
    bootstrapper: Option<String>,

    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run repeatedly until cancelled (Ctrl-C)
    #[arg(long)]
    continuous: bool,

    /// Stop a continuous run after this many iterations (implies --continuous)
    #[arg(long)]
    iterations: Option<u64>,

    /// Delay between iterations
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Parallel dequeue loops for queue jobs
    #[arg(long)]
    concurrency: Option<usize>,

    /// Items to enqueue on the sample queue before running
    #[arg(long, default_value_t = 0)]
    seed: usize,

    /// Seconds between lease reaper passes
    #[arg(long, default_value_t = 5)]
    reap_interval_secs: u64,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,

    /// List registered jobs and exit
    #[arg(long)]
    list: bool,

    /// Print the effective config as JSON and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn load_config(&self) -> Result<Config, String> {
        let mut config = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .map_err(|e| format!("reading {}: {e}", path.display()))?;
                Config::from_json(&json).map_err(|e| format!("parsing {}: {e}", path.display()))?
            }
            None => Config::default(),
        };

        let runner = &mut config.runner;
        if self.continuous {
            runner.continuous = true;
        }
        if let Some(iterations) = self.iterations {
            runner.continuous = true;
            runner.iteration_limit = Some(iterations);
        }
        if let Some(interval_ms) = self.interval_ms {
            runner.interval_ms = interval_ms;
        }
        if let Some(concurrency) = self.concurrency {
            runner.concurrency = Some(concurrency);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    observability::init(args.json_logs);

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return exit(exit_code::RESOLUTION_FAILED);
        }
    };
    if args.print_config {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                tracing::error!(error = %e, "cannot render config");
                return exit(exit_code::RESOLUTION_FAILED);
            }
        }
        return exit(exit_code::SUCCESS);
    }

    let metrics = Arc::new(InMemoryMetrics::new());
    let queue: Arc<SampleQueue> = Arc::new(
        InMemoryQueueBuilder::new(config.queue.clone())
            .metrics(metrics.clone())
            .build::<SampleWorkItem>(),
    );

    let registry = match demo::registry(config.clone(), metrics.clone(), queue.clone()) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!(error = %e, "failed to build job registry");
            return exit(exit_code::RESOLUTION_FAILED);
        }
    };
    if args.list {
        for name in registry.job_names() {
            println!("{name}");
        }
        return exit(exit_code::SUCCESS);
    }
    let Some(job_name) = args.job.as_deref() else {
        tracing::error!(available = ?registry.job_names(), "no job name given");
        return exit(exit_code::RESOLUTION_FAILED);
    };

    for seq in 0..args.seed {
        if let Err(e) = queue.enqueue(SampleWorkItem::new(seq)).await {
            tracing::error!(error = %e, "seeding the sample queue failed");
            return exit(exit_code::JOB_FAILED);
        }
    }

    // Ctrl-C -> cooperative cancellation
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                cancel.cancel();
            }
        }
    });

    let reaper_cancel = cancel.child_token();
    let reaper = tokio::spawn({
        let reaper = ReaperLoop::new(
            queue.clone(),
            Duration::from_secs(args.reap_interval_secs.max(1)),
        );
        let cancel = reaper_cancel.clone();
        async move { reaper.run(&cancel).await }
    });

    let code = JobRunner::new(config.runner.clone())
        .with_metrics(metrics.clone())
        .run(&registry, job_name, args.bootstrapper.as_deref(), &cancel)
        .await;

    reaper_cancel.cancel();
    let _ = reaper.await;

    if let Ok(stats) = queue.stats().await
        && stats.enqueued > 0
    {
        tracing::info!(?stats, drained = stats.count().is_drained(), "sample queue");
    }
    metrics.display_stats();
    exit(code)
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
