//! App - アプリケーションロジック
//!
//! - **job**: Job trait と JobExecutor（単発・継続実行、キャンセル）
//! - **queue_processor**: Queue + handler を Job として動かす
//! - **registry**: 名前 -> Job の解決と Bootstrapper
//! - **runner**: プロセス境界（exit code）
//! - **reaper_loop**: lease 期限切れの定期回収

pub mod job;
pub mod queue_processor;
pub mod reaper_loop;
pub mod registry;
pub mod runner;

pub use self::job::{ContinuousOptions, Job, JobExecutor, JobHandle, JobState, RunSummary};
pub use self::queue_processor::{FnHandler, QueueHandler, QueueProcessorJob};
pub use self::reaper_loop::ReaperLoop;
pub use self::registry::{Bootstrapper, JobRegistry, Services};
pub use self::runner::{JobRunner, exit_code};
