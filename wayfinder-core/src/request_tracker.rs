use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Atomic in-flight counter with a drain barrier. Once draining starts,
/// `increment` refuses new work; `start_draining` resolves when the count
/// reaches zero. Callers own the forced-shutdown timeout.
pub struct RequestTracker {
    count: watch::Sender<usize>,
    draining: AtomicBool,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count,
            draining: AtomicBool::new(false),
        }
    }

    /// Register a request. Returns `false` (and does not count) once
    /// draining has begun.
    pub fn increment(&self) -> bool {
        if self.draining.load(Ordering::Acquire) {
            return false;
        }
        self.count.send_modify(|c| *c += 1);
        true
    }

    pub fn decrement(&self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }

    pub fn in_flight(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Switch to draining and wait for the in-flight count to reach zero.
    pub async fn start_draining(&self) {
        self.draining.store(true, Ordering::Release);
        let mut rx = self.count.subscribe();
        while *rx.borrow_and_update() != 0 {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// RAII registration: decrements on drop. `None` while draining.
    pub fn guard(self: &Arc<Self>) -> Option<RequestGuard> {
        if self.increment() {
            Some(RequestGuard {
                tracker: Arc::clone(self),
            })
        } else {
            None
        }
    }
}

pub struct RequestGuard {
    tracker: Arc<RequestTracker>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.decrement();
    }
}
