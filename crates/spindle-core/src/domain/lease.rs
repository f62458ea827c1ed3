//! Lease state machine for a dequeued entry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a lease held on a dequeued item.
///
/// State transitions (one-way, never reused):
/// - Active -> Completed
/// - Active -> Abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseState {
    /// A worker holds the item.
    Active,

    /// Processed successfully; the item was removed from the queue.
    Completed,

    /// Released after a failed attempt; retried or dead-lettered by the queue.
    Abandoned,
}

impl LeaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LeaseState::Completed | LeaseState::Abandoned)
    }

    /// Returns the target state if the transition is legal.
    pub fn transition(self, to: LeaseState) -> Option<LeaseState> {
        match (self, to) {
            (LeaseState::Active, LeaseState::Completed | LeaseState::Abandoned) => Some(to),
            _ => None,
        }
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeaseState::Active => "active",
            LeaseState::Completed => "completed",
            LeaseState::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}
