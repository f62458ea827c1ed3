//! Domain model: ids, work items, lease states, job results, stats, errors.

pub mod errors;
pub mod ids;
pub mod job_result;
pub mod lease;
pub mod retry;
pub mod stats;
pub mod work_item;

pub use self::errors::{BarrierError, HandlerError, JobError, QueueError, ResolveError};
pub use self::ids::{Id, IdMarker, ItemId, RunId};
pub use self::job_result::{JobResult, JobResultKind};
pub use self::lease::LeaseState;
pub use self::retry::{AbandonDisposition, RetryPolicy};
pub use self::stats::{QueueCount, QueueStats};
pub use self::work_item::WorkItem;
