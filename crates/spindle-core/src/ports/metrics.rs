//! Metrics port - ライフサイクルイベントの計測
//!
//! The core reports counters, gauges and timings by name and never reads them
//! back. `NoopMetrics` is the default, so running without a sink is safe.

use std::time::Duration;

/// Event names reported by queues and jobs.
///
/// Full metric names are `<owner>.<event>`, e.g. `orders.enqueued` or
/// `hello.run-duration`; see [`metric_name`].
pub mod events {
    pub const ENQUEUED: &str = "enqueued";
    pub const DEQUEUED: &str = "dequeued";
    pub const COMPLETED: &str = "completed";
    pub const ABANDONED: &str = "abandoned";
    pub const DEAD_LETTER: &str = "deadletter";
    pub const TIMEOUT: &str = "timeout";
    pub const COUNT: &str = "count";
    pub const WORKING: &str = "working";

    pub const RUN: &str = "run";
    pub const RUN_SUCCESS: &str = "run.success";
    pub const RUN_FAILURE: &str = "run.failure";
    pub const RUN_DURATION: &str = "run-duration";
    pub const PROCESS_DURATION: &str = "process-duration";
}

pub fn metric_name(owner: &str, event: &str) -> String {
    format!("{owner}.{event}")
}

pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &str, delta: u64);

    fn gauge(&self, name: &str, value: f64);

    fn timing(&self, name: &str, elapsed: Duration);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &str, _delta: u64) {}

    fn gauge(&self, _name: &str, _value: f64) {}

    fn timing(&self, _name: &str, _elapsed: Duration) {}
}
