//! Counting completion latch.
//!
//! Sized once to the number of sessions in a run. Every session holds a
//! [`LatchToken`]; dropping the token counts the latch down, so a session
//! signals completion exactly once on every exit path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct LatchInner {
    remaining: AtomicUsize,
    notify: Notify,
}

/// Cheaply cloneable handle; clones share one count.
#[derive(Clone)]
pub struct CompletionLatch {
    inner: Arc<LatchInner>,
}

impl CompletionLatch {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(LatchInner {
                remaining: AtomicUsize::new(count),
                notify: Notify::new(),
            }),
        }
    }

    /// Obligation to count down once, discharged on drop.
    pub fn token(&self) -> LatchToken {
        LatchToken {
            latch: self.clone(),
        }
    }

    /// Decrement by one. Saturates at zero.
    pub fn count_down(&self) {
        let previous = self
            .inner
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    /// Resolve once the count reaches zero.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent final count_down is not missed.
            notified.as_mut().enable();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CompletionLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionLatch")
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Counts its latch down exactly once when dropped.
#[must_use = "dropping the token immediately counts the latch down"]
pub struct LatchToken {
    latch: CompletionLatch,
}

impl Drop for LatchToken {
    fn drop(&mut self) {
        self.latch.count_down();
    }
}
