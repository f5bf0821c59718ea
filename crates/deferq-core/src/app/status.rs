//! Status - poller のカウンタ
//!
//! `DelayQueue::counts()` でスナップショットを取る。

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of what the pollers of one `DelayQueue` have done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerCounts {
    /// Iterations that reached the lock attempt.
    pub iterations: u64,
    /// Lock held elsewhere; iteration skipped.
    pub contended: u64,
    /// Lock taken, queue empty.
    pub idle: u64,
    /// Lock taken, earliest item not yet due.
    pub not_due: u64,
    /// Items removed from the queue and handed to a handler.
    pub dispatched: u64,
    /// Due items that were gone by the time of removal (cancelled or claimed elsewhere).
    pub lost: u64,
    /// Iterations ended by a store/lock error or timeout.
    pub iteration_errors: u64,
    pub handler_failures: u64,
    pub handler_panics: u64,
    /// Failed payloads put back by `DeliveryPolicy::Requeue`.
    pub requeued: u64,
    /// Failed payloads given up on.
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PollerStats {
    pub(crate) iterations: AtomicU64,
    pub(crate) contended: AtomicU64,
    pub(crate) idle: AtomicU64,
    pub(crate) not_due: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) lost: AtomicU64,
    pub(crate) iteration_errors: AtomicU64,
    pub(crate) handler_failures: AtomicU64,
    pub(crate) handler_panics: AtomicU64,
    pub(crate) requeued: AtomicU64,
    pub(crate) dropped: AtomicU64,
}

impl PollerStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PollerCounts {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PollerCounts {
            iterations: load(&self.iterations),
            contended: load(&self.contended),
            idle: load(&self.idle),
            not_due: load(&self.not_due),
            dispatched: load(&self.dispatched),
            lost: load(&self.lost),
            iteration_errors: load(&self.iteration_errors),
            handler_failures: load(&self.handler_failures),
            handler_panics: load(&self.handler_panics),
            requeued: load(&self.requeued),
            dropped: load(&self.dropped),
        }
    }
}
