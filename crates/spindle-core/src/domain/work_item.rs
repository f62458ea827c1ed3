//! WorkItem: caller payload plus the identity the queue assigns to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ItemId;

/// An immutable unit of work stored by a queue.
///
/// `id` and `enqueued_at` are assigned once by the queue at enqueue time.
/// `attempts` counts how many times the item has been leased; it is the only
/// field that changes, and only the queue changes it (on dequeue).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem<T> {
    id: ItemId,
    payload: T,
    enqueued_at: DateTime<Utc>,
    attempts: u32,
}

impl<T> WorkItem<T> {
    pub fn new(id: ItemId, payload: T, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            enqueued_at,
            attempts: 0,
        }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Number of leases granted so far (including the current one while in flight).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn start_attempt(&mut self) {
        self.attempts += 1;
    }
}
