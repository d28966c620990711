//! Worker dispatch loop.
//!
//! Every worker thread, and the root thread in use-caller mode, runs
//! [`run`]: take the first runnable task, switch into its fiber, and park in
//! an idle fiber when the queue has nothing for this worker. The loop ends
//! when the idle fiber terminates, which happens once the scheduler is
//! stopping and fully drained.

use crate::fiber::{Fiber, State};
use crate::fiber_pool::FiberPool;
use crate::runtime;
use crate::scheduler::{SchedulerHandle, Shared};
use crate::task::{SchedulerTask, TaskKind};
use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

thread_local! {
    /// Worker id and scheduler of the dispatch loop running on this thread.
    static WORKER: RefCell<Option<(usize, SchedulerHandle)>> = const { RefCell::new(None) };
}

/// Id of the worker running on the calling thread, if any.
///
/// Valid ids are `0..thread_count`; in use-caller mode the root thread is 0.
#[inline(never)]
pub fn current_worker() -> Option<usize> {
    WORKER.with(|worker| worker.borrow().as_ref().map(|(id, _)| *id))
}

#[inline(never)]
pub(crate) fn current_scheduler() -> Option<SchedulerHandle> {
    WORKER.with(|worker| worker.borrow().as_ref().map(|(_, handle)| handle.clone()))
}

/// Marks the calling thread as worker `id` until dropped.
pub(crate) struct Registration {
    previous: Option<(usize, SchedulerHandle)>,
}

impl Registration {
    #[inline(never)]
    pub(crate) fn enter(shared: &Arc<Shared>, id: usize) -> Self {
        let handle = SchedulerHandle::from_shared(Arc::clone(shared));
        let previous = WORKER.with(|worker| worker.replace(Some((id, handle))));
        runtime::state().live_workers.fetch_add(1, Ordering::Relaxed);
        Registration { previous }
    }
}

impl Drop for Registration {
    #[inline(never)]
    fn drop(&mut self) {
        let previous = self.previous.take();
        WORKER.with(|worker| *worker.borrow_mut() = previous);
        runtime::state().live_workers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Runs the dispatch loop of worker `id`, spawned or root.
///
/// A task that panics is a fatal program error: the failure is logged and
/// the process aborts, whichever thread the task ran on.
pub(crate) fn run_guarded(shared: &Arc<Shared>, id: usize) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| run(shared, id)));
    if let Err(payload) = result {
        log::error!(
            "worker {} of scheduler `{}` panicked: {}",
            id,
            shared.name(),
            panic_message(payload.as_ref())
        );
        std::process::abort();
    }
}

/// Runs the dispatch loop for worker `id` on the calling thread until the
/// scheduler is stopping and drained.
pub(crate) fn run(shared: &Arc<Shared>, id: usize) {
    let _registration = Registration::enter(shared, id);
    #[cfg(feature = "trace")]
    let _collector = crate::trace::CollectorGuard;

    let scheduler_fiber = Fiber::this_id();
    log::debug!(
        "scheduler `{}` worker {} running on fiber {}",
        shared.name(),
        id,
        scheduler_fiber
    );

    let idle = {
        let shared = Arc::clone(shared);
        Fiber::with_options(move || shared.idle(id), 0, false)
    };
    let mut pool = FiberPool::new(shared.config().pool_capacity(), shared.config().stack_size);

    loop {
        match shared.take_task(id) {
            Some(task) => dispatch(shared, id, task, &mut pool),
            None => {
                if idle.state() == State::Term {
                    break;
                }
                shared.idle_enter();
                idle.resume();
                shared.idle_exit();
            }
        }
    }

    log::debug!(
        "scheduler `{}` worker {} left dispatch loop ({} pooled fibers)",
        shared.name(),
        id,
        pool.len()
    );
}

fn dispatch(shared: &Shared, id: usize, task: SchedulerTask, pool: &mut FiberPool) {
    runtime::state()
        .tasks_dispatched
        .fetch_add(1, Ordering::Relaxed);
    #[cfg(feature = "trace")]
    let _span = crate::trace::TraceGuard::new("task", id);

    let (fiber, pooled) = match task.into_kind() {
        TaskKind::Fiber(fiber) => (fiber, false),
        TaskKind::Callback(callback) => match pool.acquire(callback) {
            Ok(fiber) => (fiber, true),
            Err(err) => fatal!("worker {} of `{}`: {}", id, shared.name(), err),
        },
    };

    fiber.resume();

    match fiber.state() {
        State::Ready if fiber.runs_in_scheduler() => shared.requeue(fiber),
        State::Ready => log::warn!(
            "fiber {} yielded on worker {} but does not run in the scheduler; dropping it",
            fiber.id(),
            id
        ),
        State::Term if pooled => pool.release(fiber),
        State::Term => {}
        State::Running => fatal!("fiber {} still running after switching out", fiber.id()),
    }

    shared.finish_task();
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_no_worker_outside_dispatch_loop() {
        assert_eq!(current_worker(), None);
        assert!(current_scheduler().is_none());
    }

    #[test]
    fn test_tasks_see_their_worker() {
        let scheduler = Scheduler::new(2, false, "worker_ids");
        scheduler.start().unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for worker in 0..2 {
            let seen = seen.clone();
            scheduler
                .schedule_on(
                    move || {
                        let handle = SchedulerHandle::current().unwrap();
                        seen.lock().push((worker, current_worker(), handle.name().to_string()));
                    },
                    worker,
                )
                .unwrap();
        }
        scheduler.stop();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        for (expected, actual, name) in seen.iter() {
            assert_eq!(Some(*expected), *actual);
            assert_eq!(name, "worker_ids");
        }
    }

    #[test]
    fn test_yielding_fiber_is_requeued() {
        let scheduler = Scheduler::new(1, false, "requeue");
        scheduler.start().unwrap();
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        scheduler
            .schedule(move || {
                for _ in 0..3 {
                    s.fetch_add(1, Ordering::SeqCst);
                    Fiber::yield_now();
                }
            })
            .unwrap();
        scheduler.stop();
        assert_eq!(steps.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_non_scheduler_fiber_dropped_after_yield() {
        let scheduler = Scheduler::new(1, false, "non_participating");
        scheduler.start().unwrap();
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::with_options(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_now();
                s.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );
        scheduler.schedule_fiber(fiber).unwrap();
        scheduler.stop();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_message_extracts_strings() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
