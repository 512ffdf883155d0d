use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

// ---------------------------------------------------------------------------
// OrchestratorCounters
// ---------------------------------------------------------------------------

/// Monotonic counters for one project's orchestration activity.
///
/// Shared freely via `Arc`; every field is an atomic so increments from
/// the scheduler, merge queue, and RPC handlers never contend on a lock.
#[derive(Debug, Default)]
pub struct OrchestratorCounters {
    pub spawns: AtomicU64,
    pub spawn_failures: AtomicU64,
    pub completions: AtomicU64,
    pub merges_completed: AtomicU64,
    pub merges_failed: AtomicU64,
    pub task_resets: AtomicU64,
    pub heartbeat_timeouts: AtomicU64,
    pub rpc_calls: AtomicU64,
    pub events_published: AtomicU64,
}

impl OrchestratorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy for the stats endpoint.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            spawns: self.spawns.load(Ordering::Relaxed),
            spawn_failures: self.spawn_failures.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            merges_completed: self.merges_completed.load(Ordering::Relaxed),
            merges_failed: self.merges_failed.load(Ordering::Relaxed),
            task_resets: self.task_resets.load(Ordering::Relaxed),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
            rpc_calls: self.rpc_calls.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            taken_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub spawns: u64,
    pub spawn_failures: u64,
    pub completions: u64,
    pub merges_completed: u64,
    pub merges_failed: u64,
    pub task_resets: u64,
    pub heartbeat_timeouts: u64,
    pub rpc_calls: u64,
    pub events_published: u64,
    pub taken_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
