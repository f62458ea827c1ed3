//! spindle-core
//!
//! Reliable work queues and the job engine that drains them.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, work item, lease state, job result, stats, retry, errors）
//! - **ports**: 抽象化レイヤー（Queue, QueueEntry, MetricsSink, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryQueue, InMemoryMetrics）
//! - **app**: Job engine, QueueProcessorJob, JobRegistry, JobRunner, ReaperLoop
//! - **barrier**: CompletionBarrier
//! - **config**: serde で読める設定

pub mod app;
pub mod barrier;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use tokio_util::sync::CancellationToken;
