//! In-flight connection tracking.
//!
//! A counting barrier: every accepted connection holds a [`ConnectionGuard`]
//! that increments the counter on creation and decrements it exactly once,
//! on the first of `release()` or drop. [`ConnectionTracker::wait`] resolves
//! when the counter is back at zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

/// Shared in-flight connection counter.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    count: AtomicUsize,
    /// Notified when the last connection drains.
    drained: Notify,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection.
    pub fn register(&self) -> ConnectionGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            tracker: Some(self.clone()),
        }
    }

    /// Current number of in-flight connections.
    pub fn active(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    fn deregister(&self) {
        let prev = self.inner.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "connection counter underflow");
        if prev == 1 {
            self.inner.drained.notify_waiters();
        }
    }

    /// Wait until no connections are in flight.
    ///
    /// Connections registered while waiting extend the wait.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            // Register interest before reading the counter so a drop racing
            // with this check still wakes us.
            notified.as_mut().enable();

            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Like [`wait`](Self::wait), bounded by `timeout`.
    ///
    /// Returns `true` if all connections drained, `false` if timed out.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let active = self.active();
        if active == 0 {
            return true;
        }

        info!(
            active_connections = active,
            timeout_secs = timeout.as_secs(),
            "Draining active connections"
        );

        tokio::select! {
            _ = self.wait() => true,
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    remaining_connections = self.active(),
                    timeout_secs = timeout.as_secs(),
                    "Drain timeout expired"
                );
                false
            }
        }
    }
}

/// Decrements the owning tracker once, on release or drop.
pub struct ConnectionGuard {
    tracker: Option<ConnectionTracker>,
}

impl ConnectionGuard {
    /// Deregister now. Later calls and the eventual drop are no-ops.
    pub fn release(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.deregister();
        }
    }

    /// Whether this guard still counts towards the tracker.
    pub fn is_active(&self) -> bool {
        self.tracker.is_some()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_counting() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active(), 0);

        let mut guards: Vec<_> = (0..10).map(|_| tracker.register()).collect();
        assert_eq!(tracker.active(), 10);

        guards.truncate(5);
        assert_eq!(tracker.active(), 5);

        drop(guards);
        assert_eq!(tracker.active(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let tracker = ConnectionTracker::new();
        let _other = tracker.register();
        let mut guard = tracker.register();
        assert_eq!(tracker.active(), 2);

        guard.release();
        guard.release();
        assert!(!guard.is_active());
        assert_eq!(tracker.active(), 1);

        drop(guard);
        assert_eq!(tracker.active(), 1);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let tracker = ConnectionTracker::new();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_wait_unblocks_after_last_release() {
        let tracker = ConnectionTracker::new();
        let guards: Vec<_> = (0..3).map(|_| tracker.register()).collect();

        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait().await }
        });

        // Release out of order; the waiter must still be pending until the last one.
        let mut guards = guards.into_iter().rev();
        for _ in 0..2 {
            drop(guards.next());
            tokio::task::yield_now().await;
            assert!(!waiter.is_finished());
        }

        drop(guards.next());
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("wait did not return after last release")
            .unwrap();
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_register_and_release() {
        let tracker = ConnectionTracker::new();
        let mut handles = Vec::new();
        for _ in 0..64 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let guard = tracker.register();
                tokio::task::yield_now().await;
                drop(guard);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(tracker.active(), 0);
        tracker.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_expires() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.register();

        let drained = tracker.wait_timeout(Duration::from_millis(100)).await;
        assert!(!drained);
        assert_eq!(tracker.active(), 1);
    }

    #[tokio::test]
    async fn test_wait_timeout_drains() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.register();
        drop(guard);

        assert!(tracker.wait_timeout(Duration::from_secs(5)).await);
    }
}
