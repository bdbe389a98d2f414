use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use tokio::{sync::Notify, time::timeout};

/// Counts down to zero and releases every waiter once it gets there.
///
/// Workload data is never locked by the harness, so workers that must
/// observe each other's progress (for example "every worker inserted its
/// first batch") coordinate through primitives like this one.
#[derive(Debug)]
pub struct CountDownLatch {
    remaining: AtomicUsize,
    released: Notify,
}

impl CountDownLatch {
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            released: Notify::new(),
        }
    }

    /// Decrements the count; a latch already at zero stays there.
    pub fn count_down(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.released.notify_waiters();
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let released = self.released.notified();
            if self.count() == 0 {
                return;
            }
            released.await;
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `limit`. Returns whether
    /// the latch reached zero.
    pub async fn wait_timeout(&self, limit: Duration) -> bool {
        timeout(limit, self.wait()).await.is_ok()
    }
}
