//! Queue port - the reliability contract every backend satisfies.
//!
//! A backend stores pending and in-flight items. `dequeue` grants a lease by
//! returning a [`QueueEntry`]; the holder must then `complete` or `abandon`
//! it exactly once. Counters in [`QueueStats`] are the single source of truth
//! for in-flight accounting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    AbandonDisposition, ItemId, LeaseState, QueueCount, QueueError, QueueStats, WorkItem,
};

/// Backend side of a lease: what an entry calls when it is settled.
///
/// Implementations must reject calls for items they do not currently hold in
/// flight with `QueueError::LeaseLost`.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Remove the item permanently.
    async fn complete(&self, item: ItemId) -> Result<(), QueueError>;

    /// Release the item; the backend decides between retry and dead-letter.
    async fn abandon(
        &self,
        item: ItemId,
        error: Option<String>,
    ) -> Result<AbandonDisposition, QueueError>;

    /// Push the lease deadline forward.
    async fn renew(&self, item: ItemId) -> Result<(), QueueError>;
}

/// A leased handle over one dequeued item.
///
/// The lease state lives behind an async mutex held across the backend call,
/// so a second settle observes the terminal state and fails with
/// `LeaseViolation`.
pub struct QueueEntry<T> {
    item: WorkItem<T>,
    dequeued_at: DateTime<Utc>,
    state: Mutex<LeaseState>,
    backend: Arc<dyn LeaseBackend>,
}

impl<T> QueueEntry<T> {
    pub fn new(item: WorkItem<T>, dequeued_at: DateTime<Utc>, backend: Arc<dyn LeaseBackend>) -> Self {
        Self {
            item,
            dequeued_at,
            state: Mutex::new(LeaseState::Active),
            backend,
        }
    }

    pub fn id(&self) -> ItemId {
        self.item.id()
    }

    pub fn item(&self) -> &WorkItem<T> {
        &self.item
    }

    pub fn payload(&self) -> &T {
        self.item.payload()
    }

    /// Leases granted for this item so far, this one included.
    pub fn attempts(&self) -> u32 {
        self.item.attempts()
    }

    pub fn dequeued_at(&self) -> DateTime<Utc> {
        self.dequeued_at
    }

    pub async fn state(&self) -> LeaseState {
        *self.state.lock().await
    }

    /// Active -> Completed.
    pub async fn complete(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        self.check_transition(*state, LeaseState::Completed)?;

        match self.backend.complete(self.id()).await {
            Ok(()) => {
                *state = LeaseState::Completed;
                Ok(())
            }
            Err(err) => Err(self.settle_failed(&mut state, err)),
        }
    }

    /// Active -> Abandoned.
    pub async fn abandon(&self) -> Result<AbandonDisposition, QueueError> {
        self.abandon_inner(None).await
    }

    /// Active -> Abandoned, recording the handler error with the queue.
    pub async fn fail(&self, error: impl Into<String>) -> Result<AbandonDisposition, QueueError> {
        self.abandon_inner(Some(error.into())).await
    }

    pub async fn renew_lease(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if *state != LeaseState::Active {
            return Err(QueueError::LeaseViolation {
                item: self.id(),
                state: *state,
            });
        }
        self.backend
            .renew(self.id())
            .await
            .map_err(|err| self.settle_failed(&mut state, err))
    }

    async fn abandon_inner(&self, error: Option<String>) -> Result<AbandonDisposition, QueueError> {
        let mut state = self.state.lock().await;
        self.check_transition(*state, LeaseState::Abandoned)?;

        match self.backend.abandon(self.id(), error).await {
            Ok(disposition) => {
                *state = LeaseState::Abandoned;
                Ok(disposition)
            }
            Err(err) => Err(self.settle_failed(&mut state, err)),
        }
    }

    fn check_transition(&self, from: LeaseState, to: LeaseState) -> Result<(), QueueError> {
        match from.transition(to) {
            Some(_) => Ok(()),
            None => Err(QueueError::LeaseViolation {
                item: self.id(),
                state: from,
            }),
        }
    }

    // A lost lease was already abandoned by the queue (e.g. reaped after a
    // timeout); transient errors leave the entry active so the caller can retry.
    fn settle_failed(&self, state: &mut LeaseState, err: QueueError) -> QueueError {
        if matches!(err, QueueError::LeaseLost(_)) {
            *state = LeaseState::Abandoned;
        }
        err
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for QueueEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("item", &self.item)
            .field("dequeued_at", &self.dequeued_at)
            .finish_non_exhaustive()
    }
}

/// Queue port (interface).
///
/// `dequeue` distinguishes three outcomes: `Ok(Some(entry))` (lease granted),
/// `Ok(None)` (nothing arrived before the timeout, or the wait was cancelled),
/// and `Err` (backend failure).
#[async_trait]
pub trait Queue<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    fn name(&self) -> &str;

    async fn enqueue(&self, payload: T) -> Result<ItemId, QueueError>;

    /// Wait up to `timeout` for a pending item. A cancelled `cancel` token
    /// aborts the wait immediately and leaves the queue untouched.
    async fn dequeue(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<QueueEntry<T>>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    async fn queue_count(&self) -> Result<QueueCount, QueueError> {
        Ok(self.stats().await?.count())
    }

    async fn dead_letter_items(&self) -> Result<Vec<WorkItem<T>>, QueueError>;

    /// Abandon leases whose deadline passed. Returns how many were reaped.
    ///
    /// Backends whose storage expires leases on its own can keep the default.
    async fn reap_expired_leases(&self) -> Result<usize, QueueError> {
        Ok(0)
    }

    /// Drop every item and reset the counters.
    async fn delete_queue(&self) -> Result<(), QueueError>;
}
