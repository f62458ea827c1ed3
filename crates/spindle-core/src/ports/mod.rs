//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部の仕組み（キューのバックエンド、メトリクス、時刻、ID 生成）
//! へのインターフェース。core はここにある trait にのみ依存する。

pub mod clock;
pub mod id_generator;
pub mod metrics;
pub mod queue;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::metrics::{MetricsSink, NoopMetrics, events, metric_name};
pub use self::queue::{LeaseBackend, Queue, QueueEntry};
