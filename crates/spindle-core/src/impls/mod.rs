//! Impls - 実装（開発用・テスト用）
//!
//! - **InMemoryQueue**: Queue contract のリファレンス実装
//! - **InMemoryMetrics**: カウンタ・タイマーをメモリ上で集計
//!
//! Broker- or database-backed queues live in their own crates and only need
//! to implement `ports::Queue` and `ports::LeaseBackend`.

pub mod inmem_metrics;
pub mod inmem_queue;

pub use self::inmem_metrics::{InMemoryMetrics, TimingSummary};
pub use self::inmem_queue::{InMemoryQueue, InMemoryQueueBuilder};
