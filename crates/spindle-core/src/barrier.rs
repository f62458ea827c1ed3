//! CompletionBarrier - "N 件終わるまで待つ" ための countdown latch.
//!
//! Built on a `watch` channel: every `signal` decrements the remaining count
//! under the channel lock, and waiters wake when it reaches zero.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::domain::BarrierError;

#[derive(Debug)]
pub struct CompletionBarrier {
    remaining: watch::Sender<u64>,
}

impl CompletionBarrier {
    /// Armed for `n` signals. A barrier armed for zero is already satisfied.
    pub fn new(n: u64) -> Self {
        let (remaining, _) = watch::channel(n);
        Self { remaining }
    }

    /// Record one finished unit of work.
    ///
    /// Signalling an already satisfied barrier is rejected and leaves the count
    /// at zero.
    pub fn signal(&self) -> Result<(), BarrierError> {
        let mut overrun = false;
        self.remaining.send_if_modified(|remaining| {
            if *remaining == 0 {
                overrun = true;
                return false;
            }
            *remaining -= 1;
            true
        });

        if overrun {
            tracing::error!("completion barrier overrun");
            return Err(BarrierError::Overrun);
        }
        Ok(())
    }

    pub fn remaining(&self) -> u64 {
        *self.remaining.borrow()
    }

    pub fn is_satisfied(&self) -> bool {
        self.remaining() == 0
    }

    /// Wait until the count reaches zero. Returns `false` on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        self.wait_cancellable(timeout, &CancellationToken::new()).await
    }

    /// Like [`wait`](Self::wait), but gives up early (returning `false`) when
    /// `cancel` fires.
    pub async fn wait_cancellable(&self, timeout: Duration, cancel: &CancellationToken) -> bool {
        let mut rx = self.remaining.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => self.is_satisfied(),
            result = tokio::time::timeout(timeout, rx.wait_for(|remaining| *remaining == 0)) => {
                // The sender lives in `self`, so the channel cannot close here.
                matches!(result, Ok(Ok(_)))
            }
        }
    }
}
