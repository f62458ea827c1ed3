//! InMemoryQueue - reference backend for the Queue contract.
//!
//! # 実装詳細
//! - `ready`: すぐに lease できる item（FIFO）
//! - `delayed`: retry backoff 待ちの item（min-heap）
//! - `working`: lease 中の item と lease の期限
//! - `dead_letter`: max_attempts を使い切った item
//!
//! All transitions happen under one async mutex; waiters park on a `Notify`
//! and are woken on enqueue, on abandon, and when a delayed item comes due.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::QueueOptions;
use crate::domain::{
    AbandonDisposition, ItemId, QueueError, QueueStats, RetryPolicy, WorkItem,
};
use crate::ports::{
    Clock, IdGenerator, LeaseBackend, MetricsSink, NoopMetrics, Queue, QueueEntry, SystemClock,
    UlidGenerator, events, metric_name,
};

// Stand-in deadline for effectively unbounded waits.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

struct Leased<T> {
    item: WorkItem<T>,
    deadline: Instant,
}

/// Item waiting out its retry delay.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first);
/// `seq` keeps equal deadlines in abandon order.
struct Delayed<T> {
    ready_at: Instant,
    seq: u64,
    item: WorkItem<T>,
}

impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for Delayed<T> {}

impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Delayed<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct InMemoryQueueState<T> {
    ready: VecDeque<WorkItem<T>>,
    delayed: BinaryHeap<Delayed<T>>,
    working: HashMap<ItemId, Leased<T>>,
    dead_letter: Vec<WorkItem<T>>,

    /// Monotonic counters only; gauges are derived in `snapshot`.
    counters: QueueStats,
    next_seq: u64,
}

impl<T: Clone> InMemoryQueueState<T> {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            delayed: BinaryHeap::new(),
            working: HashMap::new(),
            dead_letter: Vec::new(),
            counters: QueueStats::default(),
            next_seq: 0,
        }
    }

    fn pending(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            queued: self.pending(),
            working: self.working.len(),
            dead_letter: self.dead_letter.len(),
            ..self.counters
        }
    }

    fn promote_delayed(&mut self, now: Instant) {
        while let Some(next) = self.delayed.peek() {
            if next.ready_at > now {
                break;
            }
            if let Some(delayed) = self.delayed.pop() {
                self.ready.push_back(delayed.item);
            }
        }
    }

    /// Pending -> working. The only place a lease is granted.
    fn lease_next(&mut self, deadline: Instant) -> Option<WorkItem<T>> {
        let mut item = self.ready.pop_front()?;
        item.start_attempt();
        self.counters.dequeued += 1;
        self.working.insert(
            item.id(),
            Leased {
                item: item.clone(),
                deadline,
            },
        );
        Some(item)
    }

    fn complete(&mut self, id: ItemId) -> Result<(), QueueError> {
        self.working.remove(&id).ok_or(QueueError::LeaseLost(id))?;
        self.counters.completed += 1;
        Ok(())
    }

    fn abandon(
        &mut self,
        id: ItemId,
        failed: bool,
        policy: &RetryPolicy,
        now: Instant,
    ) -> Result<AbandonDisposition, QueueError> {
        let leased = self.working.remove(&id).ok_or(QueueError::LeaseLost(id))?;
        self.counters.abandoned += 1;
        if failed {
            self.counters.errors += 1;
        }

        let disposition = policy.disposition(leased.item.attempts());
        match disposition {
            AbandonDisposition::Retry { delay } if delay.is_zero() => {
                self.ready.push_back(leased.item);
            }
            AbandonDisposition::Retry { delay } => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let ready_at = now
                    .checked_add(delay)
                    .unwrap_or_else(|| now + FAR_FUTURE);
                self.delayed.push(Delayed {
                    ready_at,
                    seq,
                    item: leased.item,
                });
            }
            AbandonDisposition::DeadLetter => {
                self.dead_letter.push(leased.item);
            }
        }
        Ok(disposition)
    }

    fn reap_expired(
        &mut self,
        now: Instant,
        policy: &RetryPolicy,
    ) -> Vec<(ItemId, AbandonDisposition)> {
        let expired: Vec<ItemId> = self
            .working
            .iter()
            .filter(|(_, leased)| leased.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for id in expired {
            if let Ok(disposition) = self.abandon(id, false, policy, now) {
                self.counters.timeouts += 1;
                reaped.push((id, disposition));
            }
        }
        reaped
    }
}

/// State shared between the queue and the entries it hands out.
struct Shared<T> {
    name: String,
    retry_policy: RetryPolicy,
    work_item_timeout: Duration,
    capacity: Option<usize>,
    state: Mutex<InMemoryQueueState<T>>,
    notify: Notify,
    metrics: Arc<dyn MetricsSink>,
}

impl<T> Shared<T> {
    fn lease_deadline(&self, now: Instant) -> Instant {
        now.checked_add(self.work_item_timeout)
            .unwrap_or_else(|| now + FAR_FUTURE)
    }

    fn record(&self, event: &str) {
        self.metrics.counter(&metric_name(&self.name, event), 1);
    }

    fn record_gauges(&self, stats: &QueueStats) {
        self.metrics
            .gauge(&metric_name(&self.name, events::COUNT), stats.queued as f64);
        self.metrics
            .gauge(&metric_name(&self.name, events::WORKING), stats.working as f64);
    }

    fn record_abandon(&self, disposition: AbandonDisposition) {
        self.record(events::ABANDONED);
        if disposition == AbandonDisposition::DeadLetter {
            self.record(events::DEAD_LETTER);
        }
    }

    fn record_reaped(&self, reaped: &[(ItemId, AbandonDisposition)]) {
        for (id, disposition) in reaped {
            tracing::warn!(queue = %self.name, item = %id, ?disposition, "lease expired");
            self.record(events::TIMEOUT);
            self.record_abandon(*disposition);
        }
        if !reaped.is_empty() {
            self.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl<T> LeaseBackend for Shared<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn complete(&self, item: ItemId) -> Result<(), QueueError> {
        let (result, reaped, stats) = {
            let mut state = self.state.lock().await;
            let reaped = state.reap_expired(Instant::now(), &self.retry_policy);
            let result = state.complete(item);
            (result, reaped, state.snapshot())
        };
        self.record_reaped(&reaped);
        result?;

        tracing::trace!(queue = %self.name, item = %item, "completed");
        self.record(events::COMPLETED);
        self.record_gauges(&stats);
        Ok(())
    }

    async fn abandon(
        &self,
        item: ItemId,
        error: Option<String>,
    ) -> Result<AbandonDisposition, QueueError> {
        let (result, reaped, stats) = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let reaped = state.reap_expired(now, &self.retry_policy);
            let result = state.abandon(item, error.is_some(), &self.retry_policy, now);
            (result, reaped, state.snapshot())
        };
        self.record_reaped(&reaped);
        let disposition = result?;

        match disposition {
            AbandonDisposition::DeadLetter => {
                tracing::warn!(queue = %self.name, item = %item, error = ?error, "dead-lettered");
            }
            AbandonDisposition::Retry { delay } => {
                tracing::debug!(queue = %self.name, item = %item, ?delay, error = ?error, "abandoned, will retry");
            }
        }
        self.record_abandon(disposition);
        self.record_gauges(&stats);
        self.notify.notify_waiters();
        Ok(disposition)
    }

    async fn renew(&self, item: ItemId) -> Result<(), QueueError> {
        let (result, reaped) = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let reaped = state.reap_expired(now, &self.retry_policy);
            let deadline = self.lease_deadline(now);
            let result = match state.working.get_mut(&item) {
                Some(leased) => {
                    leased.deadline = deadline;
                    Ok(())
                }
                None => Err(QueueError::LeaseLost(item)),
            };
            (result, reaped)
        };
        self.record_reaped(&reaped);
        result
    }
}

/// In-memory queue.
///
/// # 使用例
/// ```ignore
/// let queue: InMemoryQueue<String> = InMemoryQueueBuilder::new(QueueOptions::named("orders"))
///     .metrics(metrics.clone())
///     .build();
/// queue.enqueue("hello".to_string()).await?;
/// ```
pub struct InMemoryQueue<T> {
    shared: Arc<Shared<T>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl<T> InMemoryQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(options: QueueOptions) -> Self {
        InMemoryQueueBuilder::new(options).build()
    }
}

pub struct InMemoryQueueBuilder {
    options: QueueOptions,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueueBuilder {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build<T>(self) -> InMemoryQueue<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(ClockRef(self.clock.clone())));
        InMemoryQueue {
            shared: Arc::new(Shared {
                name: self.options.name.clone(),
                retry_policy: self.options.retry_policy(),
                work_item_timeout: self.options.work_item_timeout(),
                capacity: self.options.capacity,
                state: Mutex::new(InMemoryQueueState::new()),
                notify: Notify::new(),
                metrics: self.metrics,
            }),
            clock: self.clock,
            ids,
        }
    }
}

/// Lets the id generator share the queue's clock.
struct ClockRef(Arc<dyn Clock>);

impl Clock for ClockRef {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.0.now()
    }
}

#[async_trait]
impl<T> Queue<T> for InMemoryQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn enqueue(&self, payload: T) -> Result<ItemId, QueueError> {
        let id = self.ids.generate_item_id();
        let item = WorkItem::new(id, payload, self.clock.now());

        let stats = {
            let mut state = self.shared.state.lock().await;
            if let Some(capacity) = self.shared.capacity
                && state.pending() + state.working.len() >= capacity
            {
                return Err(QueueError::Overflow { capacity });
            }
            state.ready.push_back(item);
            state.counters.enqueued += 1;
            state.snapshot()
        };

        self.shared.notify.notify_waiters();
        tracing::trace!(queue = %self.shared.name, item = %id, "enqueued");
        self.shared.record(events::ENQUEUED);
        self.shared.record_gauges(&stats);
        Ok(id)
    }

    async fn dequeue(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<QueueEntry<T>>, QueueError> {
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            // Register interest before looking at the state so a concurrent
            // enqueue between the check and the wait is not missed.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (leased, reaped, stats, next_due) = {
                let mut state = self.shared.state.lock().await;
                let reaped = state.reap_expired(now, &self.shared.retry_policy);
                state.promote_delayed(now);
                let leased = state.lease_next(self.shared.lease_deadline(now));
                let next_due = state.delayed.peek().map(|delayed| delayed.ready_at);
                (leased, reaped, state.snapshot(), next_due)
            };
            self.shared.record_reaped(&reaped);

            if let Some(item) = leased {
                tracing::trace!(
                    queue = %self.shared.name,
                    item = %item.id(),
                    attempts = item.attempts(),
                    "dequeued"
                );
                self.shared.record(events::DEQUEUED);
                self.shared.record_gauges(&stats);
                let backend: Arc<dyn LeaseBackend> = self.shared.clone();
                return Ok(Some(QueueEntry::new(item, self.clock.now(), backend)));
            }

            if now >= deadline {
                return Ok(None);
            }

            let wake = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (reaped, stats) = {
            let mut state = self.shared.state.lock().await;
            let reaped = state.reap_expired(Instant::now(), &self.shared.retry_policy);
            (reaped, state.snapshot())
        };
        self.shared.record_reaped(&reaped);
        Ok(stats)
    }

    async fn dead_letter_items(&self) -> Result<Vec<WorkItem<T>>, QueueError> {
        let state = self.shared.state.lock().await;
        Ok(state.dead_letter.clone())
    }

    async fn reap_expired_leases(&self) -> Result<usize, QueueError> {
        let reaped = {
            let mut state = self.shared.state.lock().await;
            state.reap_expired(Instant::now(), &self.shared.retry_policy)
        };
        self.shared.record_reaped(&reaped);
        Ok(reaped.len())
    }

    async fn delete_queue(&self) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().await;
        *state = InMemoryQueueState::new();
        tracing::info!(queue = %self.shared.name, "queue deleted");
        Ok(())
    }
}
