//! Error taxonomy.
//!
//! - Transient backend failure: `QueueError::Unavailable` (retry later)
//! - No item available: not an error, `dequeue` returns `Ok(None)`
//! - Lease misuse: `QueueError::LeaseViolation` / `LeaseLost` (caller bug)
//! - Handler failure: `HandlerError`, converted into an abandon
//! - Resolution failure: `ResolveError`, fatal at the process boundary

use thiserror::Error;

use super::ids::ItemId;
use super::lease::LeaseState;

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("queue is full (capacity={capacity})")]
    Overflow { capacity: usize },

    #[error("lease violation on {item}: entry is already {state}")]
    LeaseViolation { item: ItemId, state: LeaseState },

    #[error("lease lost on {0}: the queue no longer holds it in flight")]
    LeaseLost(ItemId),
}

impl QueueError {
    /// Worth retrying; the caller did nothing wrong.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_) | QueueError::Overflow { .. })
    }

    pub fn is_lease_violation(&self) -> bool {
        matches!(
            self,
            QueueError::LeaseViolation { .. } | QueueError::LeaseLost(_)
        )
    }
}

/// Failure reported by a per-item handler.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Error escaping a single job run.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("job task failed: {0}")]
    Join(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Error)]
pub enum BarrierError {
    #[error("completion barrier signalled more times than it was armed for")]
    Overrun,
}

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("no job registered under name '{0}'")]
    UnknownJob(String),

    #[error("no bootstrapper registered under name '{0}'")]
    UnknownBootstrapper(String),

    #[error("job '{0}' is already registered")]
    DuplicateJob(String),

    #[error("bootstrapper '{0}' is already registered")]
    DuplicateBootstrapper(String),

    #[error("missing dependency {dependency} while constructing job '{job}'")]
    MissingDependency { job: String, dependency: &'static str },

    #[error("bootstrapper '{name}' failed: {reason}")]
    Bootstrap { name: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_queue_errors() {
        let item = ItemId::from_ulid(ulid::Ulid::new());

        assert!(QueueError::Unavailable("down".into()).is_transient());
        assert!(QueueError::Overflow { capacity: 1 }.is_transient());

        let violation = QueueError::LeaseViolation {
            item,
            state: LeaseState::Completed,
        };
        assert!(violation.is_lease_violation());
        assert!(!violation.is_transient());
        assert!(violation.to_string().contains("already completed"));
        assert!(QueueError::LeaseLost(item).is_lease_violation());
    }
}
