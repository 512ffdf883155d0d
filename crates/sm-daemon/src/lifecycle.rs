//! Daemon lifecycle: one stop flag, plus accounting of the project
//! loops that are still draining.
//!
//! Stopping is a one-way latch on a `watch` channel. Every project loop
//! holds a [`LoopGuard`] while it runs; the guard's drop is the loop's
//! drain confirmation, and `wait_until_idle` blocks the daemon's exit
//! until the last guard is gone or the deadline passes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

struct Inner {
    stop: watch::Sender<bool>,
    live_loops: AtomicUsize,
    idle: Notify,
}

/// Shared handle on the daemon's lifecycle. Clones are cheap and all
/// observe the same stop latch and loop count.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                stop,
                live_loops: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Latch the stop flag. Later calls are no-ops.
    pub fn request_stop(&self) {
        let flipped = self.inner.stop.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        });
        if flipped {
            info!("daemon stop requested");
        }
    }

    pub fn stop_requested(&self) -> bool {
        *self.inner.stop.borrow()
    }

    /// Resolves once the stop flag is set. Usable directly in `select!`
    /// arms; each call watches independently.
    pub async fn stopped(&self) {
        let mut rx = self.inner.stop.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // All lifecycle handles gone counts as stopped.
                return;
            }
        }
    }

    /// Account for a project loop. Hold the guard for the loop's whole
    /// lifetime; dropping it is the drain confirmation.
    pub fn attach_loop(&self, project: &str) -> LoopGuard {
        let live = self.inner.live_loops.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(project, live_loops = live, "project loop attached");
        LoopGuard {
            lifecycle: self.clone(),
            project: project.to_string(),
        }
    }

    pub fn live_loops(&self) -> usize {
        self.inner.live_loops.load(Ordering::Acquire)
    }

    /// Wait until every attached loop has dropped its guard, up to the
    /// deadline. Returns how many loops were still live when it gave up
    /// (zero on a clean drain).
    pub async fn wait_until_idle(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before re-checking so a drop between the check and
            // the await cannot be missed.
            notified.as_mut().enable();

            let live = self.live_loops();
            if live == 0 {
                return 0;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let live = self.live_loops();
                warn!(live_loops = live, "stop deadline passed with loops still running");
                return live;
            }
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// LoopGuard
// ---------------------------------------------------------------------------

/// Accounting token for one running project loop.
pub struct LoopGuard {
    lifecycle: Lifecycle,
    project: String,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        let left = self
            .lifecycle
            .inner
            .live_loops
            .fetch_sub(1, Ordering::AcqRel)
            - 1;
        debug!(project = %self.project, live_loops = left, "project loop detached");
        if left == 0 {
            self.lifecycle.inner.idle.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_a_one_way_latch() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.stop_requested());
        lifecycle.request_stop();
        lifecycle.request_stop();
        assert!(lifecycle.stop_requested());
    }

    #[test]
    fn clones_observe_the_same_state() {
        let lifecycle = Lifecycle::new();
        let observer = lifecycle.clone();
        let _guard = lifecycle.attach_loop("p1");
        lifecycle.request_stop();
        assert!(observer.stop_requested());
        assert_eq!(observer.live_loops(), 1);
    }

    #[tokio::test]
    async fn stopped_resolves_after_request() {
        let lifecycle = Lifecycle::new();
        let waiter = lifecycle.clone();
        let handle = tokio::spawn(async move { waiter.stopped().await });
        lifecycle.request_stop();
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("stopped() should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn stopped_resolves_immediately_when_already_stopped() {
        let lifecycle = Lifecycle::new();
        lifecycle.request_stop();
        tokio::time::timeout(Duration::from_millis(50), lifecycle.stopped())
            .await
            .expect("already-latched stop should not block");
    }

    #[tokio::test]
    async fn idle_wait_tracks_guard_drops() {
        let lifecycle = Lifecycle::new();
        let g1 = lifecycle.attach_loop("p1");
        let g2 = lifecycle.attach_loop("p2");
        assert_eq!(lifecycle.live_loops(), 2);

        tokio::spawn(async move {
            drop(g1);
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(g2);
        });

        let left = lifecycle.wait_until_idle(Duration::from_secs(1)).await;
        assert_eq!(left, 0);
        assert_eq!(lifecycle.live_loops(), 0);
    }

    #[tokio::test]
    async fn idle_wait_reports_stuck_loops_at_deadline() {
        let lifecycle = Lifecycle::new();
        let _stuck = lifecycle.attach_loop("p1");
        let left = lifecycle.wait_until_idle(Duration::from_millis(30)).await;
        assert_eq!(left, 1);
    }

    #[tokio::test]
    async fn idle_wait_returns_at_once_with_no_loops() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.wait_until_idle(Duration::from_secs(1)).await, 0);
    }
}
