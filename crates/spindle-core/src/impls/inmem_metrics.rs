//! InMemoryMetrics - 開発・テスト用のメトリクス集計
//!
//! Counters are summed, gauges keep the last value, timings keep a running
//! summary. `display_stats` dumps everything through `tracing`.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::ports::MetricsSink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingSummary {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl TimingSummary {
    fn record(&mut self, elapsed: Duration) {
        if self.count == 0 || elapsed < self.min {
            self.min = elapsed;
        }
        if elapsed > self.max {
            self.max = elapsed;
        }
        self.count += 1;
        self.total += elapsed;
    }

    pub fn average(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total / count,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }
}

#[derive(Default)]
struct Store {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    timings: BTreeMap<String, TimingSummary>,
}

#[derive(Default)]
pub struct InMemoryMetrics {
    store: Mutex<Store>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the maps half-updated.
    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.store().counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.store().gauges.get(name).copied()
    }

    pub fn timing_summary(&self, name: &str) -> Option<TimingSummary> {
        self.store().timings.get(name).copied()
    }

    pub fn display_stats(&self) {
        let store = self.store();
        for (name, value) in &store.counters {
            tracing::info!(metric = %name, value, "counter");
        }
        for (name, value) in &store.gauges {
            tracing::info!(metric = %name, value, "gauge");
        }
        for (name, summary) in &store.timings {
            tracing::info!(
                metric = %name,
                count = summary.count,
                avg = ?summary.average(),
                min = ?summary.min,
                max = ?summary.max,
                "timing"
            );
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn counter(&self, name: &str, delta: u64) {
        *self.store().counters.entry(name.to_string()).or_default() += delta;
    }

    fn gauge(&self, name: &str, value: f64) {
        self.store().gauges.insert(name.to_string(), value);
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        self.store()
            .timings
            .entry(name.to_string())
            .or_default()
            .record(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = InMemoryMetrics::new();
        metrics.counter("q.enqueued", 1);
        metrics.counter("q.enqueued", 2);

        assert_eq!(metrics.counter_value("q.enqueued"), 3);
        assert_eq!(metrics.counter_value("q.missing"), 0);
    }

    #[test]
    fn gauges_keep_last_value() {
        let metrics = InMemoryMetrics::new();
        metrics.gauge("q.count", 5.0);
        metrics.gauge("q.count", 2.0);

        assert_eq!(metrics.gauge_value("q.count"), Some(2.0));
    }

    #[test]
    fn timings_are_summarised() {
        let metrics = InMemoryMetrics::new();
        metrics.timing("job.run-duration", Duration::from_millis(30));
        metrics.timing("job.run-duration", Duration::from_millis(10));

        let summary = metrics.timing_summary("job.run-duration").unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.min, Duration::from_millis(10));
        assert_eq!(summary.max, Duration::from_millis(30));
        assert_eq!(summary.average(), Duration::from_millis(20));
    }
}
