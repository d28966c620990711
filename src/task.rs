//! Units of work accepted by the scheduler.
//!
//! A task carries either a ready-made [`Fiber`] or a plain callback, plus an
//! optional worker affinity.

use crate::fiber::Fiber;
use std::fmt;

/// Callback accepted by the scheduler.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// What a task runs.
pub enum TaskKind {
    /// An existing fiber, resumed where it last yielded.
    Fiber(Fiber),
    /// A callback, run to completion on a pooled fiber.
    Callback(TaskFn),
}

/// A pending unit of work in a scheduler queue.
pub struct SchedulerTask {
    kind: TaskKind,
    /// Worker this task is pinned to; `None` means any worker.
    thread: Option<usize>,
}

impl SchedulerTask {
    /// Wraps a fiber; it may run on any worker.
    pub fn from_fiber(fiber: Fiber) -> Self {
        SchedulerTask {
            kind: TaskKind::Fiber(fiber),
            thread: None,
        }
    }

    /// Wraps a callback; it may run on any worker.
    pub fn from_callback<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        SchedulerTask {
            kind: TaskKind::Callback(Box::new(callback)),
            thread: None,
        }
    }

    /// Pins the task to the worker with the given id.
    pub fn pinned_to(mut self, worker: usize) -> Self {
        self.thread = Some(worker);
        self
    }

    pub fn affinity(&self) -> Option<usize> {
        self.thread
    }

    /// Whether `worker` is allowed to dequeue this task.
    pub fn runnable_on(&self, worker: usize) -> bool {
        self.thread.map_or(true, |thread| thread == worker)
    }

    pub fn is_fiber(&self) -> bool {
        matches!(self.kind, TaskKind::Fiber(_))
    }

    pub(crate) fn into_kind(self) -> TaskKind {
        self.kind
    }
}

impl fmt::Debug for SchedulerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("SchedulerTask");
        match &self.kind {
            TaskKind::Fiber(fiber) => s.field("fiber", &fiber.id()),
            TaskKind::Callback(_) => s.field("callback", &"<fn>"),
        };
        s.field("thread", &self.thread).finish()
    }
}
