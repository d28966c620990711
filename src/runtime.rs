//! Process-wide runtime state.
//!
//! Holds the fiber id allocator and the diagnostic counters shared by every
//! fiber and scheduler in the process. The state is created on first use
//! (normally the first fiber materialised on any thread) and lives until the
//! process exits.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared by all fibers and schedulers.
#[derive(Debug)]
pub struct RuntimeState {
    /// Next fiber id to hand out. Ids start at 1; 0 means "no fiber".
    next_fiber_id: AtomicU64,
    /// Total number of fibers ever constructed, thread-main fibers included.
    pub fibers_created: AtomicU64,
    /// Fibers currently alive.
    pub live_fibers: AtomicU64,
    /// Threads currently inside a scheduler dispatch loop.
    pub live_workers: AtomicU64,
    /// Tasks handed to a worker for execution.
    pub tasks_dispatched: AtomicU64,
    /// Fibers put back on a queue after yielding.
    pub fibers_requeued: AtomicU64,
    /// Time the state was initialised.
    pub start_time: Instant,
}

lazy_static::lazy_static! {
    static ref STATE: RuntimeState = RuntimeState::new();
}

/// Returns the process-wide runtime state.
pub fn state() -> &'static RuntimeState {
    &STATE
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            next_fiber_id: AtomicU64::new(1),
            fibers_created: AtomicU64::new(0),
            live_fibers: AtomicU64::new(0),
            live_workers: AtomicU64::new(0),
            tasks_dispatched: AtomicU64::new(0),
            fibers_requeued: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Allocates a fresh fiber id and accounts for the new fiber.
    pub(crate) fn fiber_created(&self) -> u64 {
        self.fibers_created.fetch_add(1, Ordering::Relaxed);
        self.live_fibers.fetch_add(1, Ordering::Relaxed);
        self.next_fiber_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn fiber_destroyed(&self) {
        self.live_fibers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of current counter values.
    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            fibers_created: self.fibers_created.load(Ordering::Relaxed),
            live_fibers: self.live_fibers.load(Ordering::Relaxed),
            live_workers: self.live_workers.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            fibers_requeued: self.fibers_requeued.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Snapshot of the runtime counters at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub fibers_created: u64,
    pub live_fibers: u64,
    pub live_workers: u64,
    pub tasks_dispatched: u64,
    pub fibers_requeued: u64,
    pub elapsed_seconds: f64,
}

impl RuntimeSnapshot {
    /// Dispatched tasks per second since the state was initialised.
    pub fn tasks_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.tasks_dispatched as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_ids_are_unique_and_increasing() {
        let first = state().fiber_created();
        let second = state().fiber_created();
        assert!(first >= 1);
        assert!(second > first);
        state().fiber_destroyed();
        state().fiber_destroyed();
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = state().snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("fibers_created").is_some());
        assert!(json.get("tasks_dispatched").is_some());
        assert!(snapshot.elapsed_seconds >= 0.0);
    }
}
