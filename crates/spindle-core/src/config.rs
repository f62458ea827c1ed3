//! Serde-loadable options for queues and job runs.
//!
//! Every field has a default, so a config file only needs the keys it changes:
//!
//! ```json
//! { "queue": { "name": "orders", "max_attempts": 5 }, "runner": { "concurrency": 4 } }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub name: String,

    /// Leases granted before an abandoned item is dead-lettered.
    pub max_attempts: u32,

    /// 0 = an abandoned item is pending again immediately.
    pub retry_delay_ms: u64,

    /// Values below 1.0, NaN and infinity are treated as 1.0.
    pub retry_multiplier: f64,

    /// Lease length; `renew_lease` pushes it forward by the same amount.
    pub work_item_timeout_ms: u64,

    /// Bounded backends reject enqueue with `Overflow` beyond this.
    pub capacity: Option<usize>,
}

impl QueueOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::immediate(self.max_attempts.max(1))
            .with_backoff(Duration::from_millis(self.retry_delay_ms), self.retry_multiplier)
    }

    pub fn work_item_timeout(&self) -> Duration {
        Duration::from_millis(self.work_item_timeout_ms)
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_attempts: 3,
            retry_delay_ms: 0,
            retry_multiplier: 2.0,
            work_item_timeout_ms: 5 * 60 * 1000,
            capacity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerOptions {
    /// Run repeatedly instead of once.
    pub continuous: bool,

    pub iteration_limit: Option<u64>,

    /// Delay between iterations of a continuous run.
    pub interval_ms: u64,

    /// Overrides the job's own worker count (parallel dequeue loops for
    /// queue processor jobs).
    pub concurrency: Option<usize>,

    pub dequeue_timeout_ms: u64,
}

impl RunnerOptions {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms))
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            continuous: false,
            iteration_limit: None,
            interval_ms: 0,
            concurrency: None,
            dequeue_timeout_ms: 1000,
        }
    }
}

/// Top-level config file shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueOptions,
    pub runner: RunnerOptions,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
