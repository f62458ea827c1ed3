//! Queue statistics snapshots.

use serde::{Deserialize, Serialize};

/// Point-in-time snapshot of a queue.
///
/// `queued` and `working` fluctuate; every other field is a monotonic counter
/// since the queue was created (or last deleted).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending items, including those waiting out a retry delay.
    pub queued: usize,
    /// Items currently leased.
    pub working: usize,
    pub dead_letter: usize,

    pub enqueued: u64,
    pub dequeued: u64,
    pub completed: u64,
    pub abandoned: u64,
    /// Handler failures reported by processors.
    pub errors: u64,
    /// Leases that expired and were reaped.
    pub timeouts: u64,
}

impl QueueStats {
    pub fn count(&self) -> QueueCount {
        QueueCount {
            pending: self.queued,
            working: self.working,
            total: self.queued + self.working,
        }
    }
}

/// The `(pending, working, total)` view of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCount {
    pub pending: usize,
    pub working: usize,
    pub total: usize,
}

impl QueueCount {
    pub fn is_drained(&self) -> bool {
        self.total == 0
    }
}
