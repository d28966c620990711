//! M:N fiber scheduler.
//!
//! A [`Scheduler`] owns a fixed pool of worker threads and a single task
//! queue. Tasks are fibers or callbacks, optionally pinned to one worker.
//! Each worker runs the dispatch loop in [`crate::worker`]: it takes the first
//! task it is allowed to run, switches into its fiber, and parks in an idle
//! fiber when nothing is runnable.
//!
//! In use-caller mode the constructing thread is worker `0` (the root
//! thread). Its dispatch loop runs inside [`Scheduler::stop`], which must be
//! called on that thread.
//!
//! ```no_run
//! use fibersched::Scheduler;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let scheduler = Scheduler::new(2, false, "example");
//! scheduler.start().unwrap();
//!
//! let hits = Arc::new(AtomicUsize::new(0));
//! for _ in 0..5 {
//!     let hits = hits.clone();
//!     scheduler.schedule(move || {
//!         hits.fetch_add(1, Ordering::SeqCst);
//!     }).unwrap();
//! }
//!
//! scheduler.stop();
//! assert_eq!(hits.load(Ordering::SeqCst), 5);
//! ```

use crate::config::{Config, ConfigVar};
use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::runtime;
use crate::task::SchedulerTask;
use crate::worker;
use crate::PinningStrategy;
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// Default number of terminated fibers each worker keeps for reuse.
pub const DEFAULT_FIBER_POOL_CAPACITY: u32 = 32;

lazy_static::lazy_static! {
    static ref POOL_CAPACITY: Arc<ConfigVar<u32>> = match Config::lookup(
        "scheduler.fiber_pool_capacity",
        DEFAULT_FIBER_POOL_CAPACITY,
        "terminated fibers kept per worker for reuse",
    ) {
        Ok(var) => var,
        Err(err) => fatal!("cannot register scheduler.fiber_pool_capacity: {}", err),
    };
}

/// Tuning for a scheduler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Stack size of the fibers callback tasks run on. `0` = `fiber.stack_size`.
    pub stack_size: usize,
    /// Terminated fibers each worker keeps. `0` = `scheduler.fiber_pool_capacity`.
    pub fiber_pool_capacity: usize,
    /// How spawned workers are pinned to CPU cores.
    pub pinning: PinningStrategy,
}

impl SchedulerConfig {
    pub(crate) fn pool_capacity(&self) -> usize {
        if self.fiber_pool_capacity == 0 {
            POOL_CAPACITY.value() as usize
        } else {
            self.fiber_pool_capacity
        }
    }
}

/// State shared between the scheduler, its handles and its workers.
pub(crate) struct Shared {
    name: String,
    config: SchedulerConfig,
    /// Total workers, root thread included.
    thread_count: usize,
    /// Worker id of the root thread in use-caller mode.
    root_worker: Option<usize>,
    tasks: Mutex<VecDeque<SchedulerTask>>,
    wake: Condvar,
    /// Bumped (under the queue lock) every time parked workers should re-check.
    tickles: CachePadded<AtomicU64>,
    active: CachePadded<AtomicUsize>,
    idle: CachePadded<AtomicUsize>,
    stopping: AtomicBool,
}

impl Shared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn submit(&self, task: SchedulerTask) -> Result<()> {
        if let Some(worker) = task.affinity() {
            if worker >= self.thread_count {
                return Err(Error::NoSuchWorker {
                    name: self.name.clone(),
                    worker,
                    workers: self.thread_count,
                });
            }
        }

        {
            let mut tasks = self.tasks.lock();
            if self.stopping.load(Ordering::Acquire) {
                log::warn!("scheduler `{}` is stopping; dropping {:?}", self.name, task);
                return Err(Error::Stopping {
                    name: self.name.clone(),
                });
            }
            tasks.push_back(task);
            self.tickles.fetch_add(1, Ordering::Relaxed);
        }
        self.wake.notify_all();
        Ok(())
    }

    /// Puts a yielded fiber back at the tail of the queue. Accepted while
    /// stopping so in-flight fibers can finish.
    pub(crate) fn requeue(&self, fiber: Fiber) {
        {
            let mut tasks = self.tasks.lock();
            tasks.push_back(SchedulerTask::from_fiber(fiber));
            self.tickles.fetch_add(1, Ordering::Relaxed);
        }
        runtime::state()
            .fibers_requeued
            .fetch_add(1, Ordering::Relaxed);
        self.wake.notify_all();
    }

    /// Wakes every worker parked in its idle fiber.
    pub(crate) fn tickle(&self) {
        {
            let _tasks = self.tasks.lock();
            self.tickles.fetch_add(1, Ordering::Relaxed);
        }
        self.wake.notify_all();
    }

    /// Removes the first task `worker` may run and marks the worker active.
    pub(crate) fn take_task(&self, worker: usize) -> Option<SchedulerTask> {
        let mut tasks = self.tasks.lock();
        let index = tasks.iter().position(|task| task.runnable_on(worker))?;
        let task = tasks.remove(index)?;
        self.active.fetch_add(1, Ordering::Relaxed);
        Some(task)
    }

    /// Marks the end of a task taken with [`Shared::take_task`].
    pub(crate) fn finish_task(&self) {
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && self.stopping.load(Ordering::Acquire) {
            // The last busy worker going quiet may complete the drain.
            self.tickle();
        }
    }

    fn drained(&self, tasks: &VecDeque<SchedulerTask>) -> bool {
        self.stopping.load(Ordering::Acquire)
            && tasks.is_empty()
            && self.active.load(Ordering::Acquire) == 0
    }

    /// True once the scheduler is stopping, the queue is empty and no worker
    /// is running a task.
    pub(crate) fn is_drained(&self) -> bool {
        let tasks = self.tasks.lock();
        self.drained(&tasks)
    }

    /// Blocks until a tickle arrives, unless `worker` already has something
    /// to do or the drain is complete. Callers re-check after waking.
    fn park(&self, worker: usize) {
        let mut tasks = self.tasks.lock();
        if self.drained(&tasks) || tasks.iter().any(|task| task.runnable_on(worker)) {
            return;
        }
        let seen = self.tickles.load(Ordering::Relaxed);
        self.wake
            .wait_while(&mut tasks, |_| self.tickles.load(Ordering::Relaxed) == seen);
    }

    /// Body of each worker's idle fiber.
    pub(crate) fn idle(&self, worker: usize) {
        log::debug!("scheduler `{}` worker {} idle fiber started", self.name, worker);
        while !self.is_drained() {
            self.park(worker);
            Fiber::yield_now();
        }
        log::debug!("scheduler `{}` worker {} idle fiber finished", self.name, worker);
    }

    pub(crate) fn idle_enter(&self) {
        self.idle.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn idle_exit(&self) {
        self.idle.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Cloneable submission handle, usable from any thread and from inside tasks.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        SchedulerHandle { shared }
    }

    /// The scheduler whose dispatch loop is running on the calling thread.
    pub fn current() -> Option<SchedulerHandle> {
        worker::current_scheduler()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Total number of workers, the root thread included.
    pub fn thread_count(&self) -> usize {
        self.shared.thread_count
    }

    /// Queues a callback for any worker.
    pub fn schedule<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(SchedulerTask::from_callback(callback))
    }

    /// Queues a callback for the worker with id `worker` only.
    pub fn schedule_on<F>(&self, callback: F, worker: usize) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(SchedulerTask::from_callback(callback).pinned_to(worker))
    }

    /// Queues a fiber for any worker.
    pub fn schedule_fiber(&self, fiber: Fiber) -> Result<()> {
        self.submit(SchedulerTask::from_fiber(fiber))
    }

    /// Queues a fiber for the worker with id `worker` only.
    pub fn schedule_fiber_on(&self, fiber: Fiber, worker: usize) -> Result<()> {
        self.submit(SchedulerTask::from_fiber(fiber).pinned_to(worker))
    }

    /// Queues a prepared task.
    ///
    /// Fails with [`Error::Stopping`] once `stop()` has begun (the task is
    /// dropped) and with [`Error::NoSuchWorker`] for an out-of-range pin.
    pub fn submit(&self, task: SchedulerTask) -> Result<()> {
        self.shared.submit(task)
    }

    /// Wakes every idle worker so it re-checks the queue.
    pub fn tickle(&self) {
        self.shared.tickle();
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("name", &self.shared.name)
            .field("thread_count", &self.shared.thread_count)
            .finish()
    }
}

/// Owner of a worker pool. Dropping it stops the pool.
pub struct Scheduler {
    handle: SchedulerHandle,
    root_thread: Option<ThreadId>,
    pub(crate) threads: Mutex<Vec<JoinHandle<()>>>,
    /// Held for the whole of `stop()` so concurrent callers all wait for the join.
    stop_lock: Mutex<()>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Scheduler {
    /// Creates a scheduler with `thread_count` workers.
    ///
    /// With `use_caller` the calling thread counts as one of them, so one
    /// thread fewer is spawned by [`Scheduler::start`].
    pub fn new(thread_count: usize, use_caller: bool, name: &str) -> Self {
        Self::with_config(thread_count, use_caller, name, SchedulerConfig::default())
    }

    pub fn with_config(
        thread_count: usize,
        use_caller: bool,
        name: &str,
        config: SchedulerConfig,
    ) -> Self {
        fiber_assert!(
            thread_count > 0,
            "scheduler `{}` needs at least one thread",
            name
        );

        let root_thread = if use_caller {
            // The root thread returns to its main fiber between tasks.
            Fiber::this_id();
            Some(thread::current().id())
        } else {
            None
        };

        let shared = Arc::new(Shared {
            name: name.to_string(),
            config,
            thread_count,
            root_worker: use_caller.then_some(0),
            tasks: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            tickles: CachePadded::new(AtomicU64::new(0)),
            active: CachePadded::new(AtomicUsize::new(0)),
            idle: CachePadded::new(AtomicUsize::new(0)),
            stopping: AtomicBool::new(false),
        });
        log::debug!(
            "scheduler `{}` created: {} thread(s), use_caller={}",
            name,
            thread_count,
            use_caller
        );

        Scheduler {
            handle: SchedulerHandle::from_shared(shared),
            root_thread,
            threads: Mutex::new(Vec::with_capacity(thread_count)),
            stop_lock: Mutex::new(()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Creates a scheduler with one spawned worker per CPU.
    pub fn with_default_threads(name: &str) -> Self {
        Self::new(num_cpus::get(), false, name)
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Total number of workers, the root thread included.
    pub fn thread_count(&self) -> usize {
        self.handle.thread_count()
    }

    /// Number of threads [`Scheduler::start`] spawns.
    pub fn spawned_thread_count(&self) -> usize {
        let shared = &self.handle.shared;
        shared.thread_count - usize::from(shared.root_worker.is_some())
    }

    /// The constructing thread, when it acts as a worker.
    pub fn root_thread(&self) -> Option<ThreadId> {
        self.root_thread
    }

    /// Workers currently executing a task.
    pub fn active_threads(&self) -> usize {
        self.handle.shared.active.load(Ordering::Relaxed)
    }

    /// Workers currently parked in their idle fiber.
    pub fn idle_threads(&self) -> usize {
        self.handle.shared.idle.load(Ordering::Relaxed)
    }

    /// Tasks waiting in the queue.
    pub fn pending_tasks(&self) -> usize {
        self.handle.shared.tasks.lock().len()
    }

    pub fn is_stopping(&self) -> bool {
        self.handle.is_stopping()
    }

    pub fn schedule<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.schedule(callback)
    }

    pub fn schedule_on<F>(&self, callback: F, worker: usize) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.schedule_on(callback, worker)
    }

    pub fn schedule_fiber(&self, fiber: Fiber) -> Result<()> {
        self.handle.schedule_fiber(fiber)
    }

    pub fn schedule_fiber_on(&self, fiber: Fiber, worker: usize) -> Result<()> {
        self.handle.schedule_fiber_on(fiber, worker)
    }

    pub fn submit(&self, task: SchedulerTask) -> Result<()> {
        self.handle.submit(task)
    }

    pub fn tickle(&self) {
        self.handle.tickle();
    }

    /// Spawns the worker threads.
    ///
    /// Calling it again while running is a no-op. Once `stop()` has begun it
    /// logs a warning and returns [`Error::Stopping`].
    pub fn start(&self) -> Result<()> {
        let shared = &self.handle.shared;
        let mut threads = self.threads.lock();
        if shared.stopping.load(Ordering::Acquire) {
            log::warn!("scheduler `{}` is stopped; start() ignored", shared.name);
            return Err(Error::Stopping {
                name: shared.name.clone(),
            });
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let cores = match shared.config.pinning {
            PinningStrategy::None => Vec::new(),
            PinningStrategy::Linear => core_affinity::get_core_ids().unwrap_or_default(),
        };

        let first = usize::from(shared.root_worker.is_some());
        for id in first..shared.thread_count {
            let worker_shared = Arc::clone(shared);
            let core = (!cores.is_empty()).then(|| cores[id % cores.len()]);
            let name = format!("{}_{}", shared.name, id);
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    if let Some(core) = core {
                        if !core_affinity::set_for_current(core) {
                            log::warn!("failed to pin worker {} to core {}", id, core.id);
                        }
                    }
                    worker::run_guarded(&worker_shared, id);
                })
                .map_err(|source| Error::ThreadSpawn { name, source })?;
            threads.push(handle);
        }

        log::info!(
            "scheduler `{}` started {} worker thread(s)",
            shared.name,
            threads.len()
        );
        Ok(())
    }

    /// Stops accepting work, lets the workers drain the queue, and joins them.
    ///
    /// In use-caller mode the root thread's dispatch loop runs here, so this
    /// must be called on the thread that created the scheduler. A scheduler
    /// that was never started is started first so queued tasks still run.
    /// Stopping is terminal. Concurrent callers all return after the join.
    ///
    /// Calling it from a task of this scheduler is fatal: the calling task
    /// keeps the scheduler busy, so the drain could never finish.
    pub fn stop(&self) {
        let shared = &self.handle.shared;
        fiber_assert!(
            !self.on_own_worker(),
            "scheduler `{}` cannot be stopped from its own worker",
            shared.name
        );
        if let Some(root) = self.root_thread {
            fiber_assert!(
                thread::current().id() == root,
                "scheduler `{}` must be stopped on its root thread",
                shared.name
            );
        }

        let _stopping = self.stop_lock.lock();
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        if !self.started.load(Ordering::Acquire) {
            if let Err(err) = self.start() {
                log::error!("scheduler `{}` could not start before stopping: {}", shared.name, err);
            }
        }

        log::info!("scheduler `{}` stopping", shared.name);
        {
            let _tasks = shared.tasks.lock();
            shared.stopping.store(true, Ordering::Release);
        }
        shared.tickle();

        if let Some(root) = shared.root_worker {
            worker::run_guarded(shared, root);
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
            if handle.join().is_err() {
                log::error!("worker thread `{}` panicked", name);
            }
        }

        self.stopped.store(true, Ordering::Release);
        log::info!("scheduler `{}` stopped", shared.name);
    }

    /// True when the calling thread is running this scheduler's dispatch loop.
    fn on_own_worker(&self) -> bool {
        SchedulerHandle::current()
            .map_or(false, |current| Arc::ptr_eq(&current.shared, &self.handle.shared))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let on_root = self
            .root_thread
            .map_or(true, |root| root == thread::current().id());
        if on_root && !self.on_own_worker() {
            self.stop();
        } else {
            // The drain cannot finish from here; release the spawned
            // workers and let them exit on their own.
            log::error!(
                "scheduler `{}` dropped off its root thread or inside its own task without stop()",
                self.handle.shared.name
            );
            {
                let _tasks = self.handle.shared.tasks.lock();
                self.handle.shared.stopping.store(true, Ordering::Release);
            }
            self.handle.shared.tickle();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name())
            .field("thread_count", &self.thread_count())
            .field("root_thread", &self.root_thread)
            .field("stopping", &self.is_stopping())
            .finish()
    }
}
