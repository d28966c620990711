//! Stackful fibers and per-thread fiber state.
//!
//! A [`Fiber`] owns a private stack and a saved execution context provided by
//! `corosensei`. Control moves into a fiber with [`Fiber::resume`] and back to
//! whoever resumed it with [`Fiber::yield_now`]; no OS scheduling is involved.
//!
//! Every thread that runs fibers gets a *thread-main* fiber the first time it
//! needs one. It stands for the thread's original call stack: it owns no stack
//! and no callback and only exists as the context other fibers return to.

use crate::config::{Config, ConfigVar};
use crate::error::{Error, Result};
use crate::runtime;
use corosensei::stack::{DefaultStack, Stack};
use corosensei::{Coroutine, CoroutineResult, Yielder};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::ptr;
use std::sync::Arc;

/// Process-unique fiber identity. `0` never names a fiber.
pub type FiberId = u64;

/// Stack size used when neither the caller nor `fiber.stack_size` says otherwise.
pub const DEFAULT_STACK_SIZE: u32 = 128 * 1024;

/// Lifecycle state of a fiber.
///
/// Transitions: `Ready -> Running` on resume, `Running -> Ready` on yield,
/// `Running -> Term` when the callback returns, `Term -> Ready` on reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Ready,
    Running,
    Term,
}

type Callback = Box<dyn FnOnce() + Send + 'static>;
type Context = Coroutine<(), (), (), DefaultStack>;

lazy_static::lazy_static! {
    static ref STACK_SIZE: Arc<ConfigVar<u32>> =
        match Config::lookup("fiber.stack_size", DEFAULT_STACK_SIZE, "fiber stack size") {
            Ok(var) => var,
            Err(err) => fatal!("cannot register fiber.stack_size: {}", err),
        };
}

thread_local! {
    /// The fiber currently running on this thread. Non-owning.
    static CURRENT: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
    /// Owning slot for this thread's main fiber; dropped at thread exit.
    static THREAD_MAIN: RefCell<Option<Box<Fiber>>> = const { RefCell::new(None) };
}

/// A stackful, cooperatively scheduled unit of execution.
pub struct Fiber {
    id: FiberId,
    state: Cell<State>,
    stack_size: usize,
    /// Base address of the owned stack (0 for thread-main fibers).
    stack_base: usize,
    /// `None` only for thread-main fibers.
    context: UnsafeCell<Option<Context>>,
    /// Set by the trampoline on first entry; lives on the fiber's own stack.
    yielder: Cell<*const Yielder<(), ()>>,
    thread_main: bool,
    run_in_scheduler: bool,
}

// SAFETY: a fiber only changes threads while it is suspended (or before it
// first runs). While it runs it is borrowed by `resume` on a single thread, and
// the yielder pointer it caches points into its own stack, which moves with it.
unsafe impl Send for Fiber {}

impl Fiber {
    /// Creates a fiber with the configured default stack size that takes part
    /// in scheduler dispatch.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_options(callback, 0, true)
    }

    /// Creates a fiber with an explicit stack size (`0` = `fiber.stack_size`).
    ///
    /// `run_in_scheduler` marks fibers that a scheduler requeues after they
    /// yield; fibers driven by hand should pass `false`. Stack allocation
    /// failure is fatal; use [`Fiber::try_with_options`] to handle it.
    pub fn with_options<F>(callback: F, stack_size: usize, run_in_scheduler: bool) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        match Self::try_with_options(callback, stack_size, run_in_scheduler) {
            Ok(fiber) => fiber,
            Err(err) => fatal!("{}", err),
        }
    }

    /// Fallible form of [`Fiber::with_options`].
    pub fn try_with_options<F>(callback: F, stack_size: usize, run_in_scheduler: bool) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = if stack_size == 0 {
            STACK_SIZE.value() as usize
        } else {
            stack_size
        };
        let stack = DefaultStack::new(stack_size).map_err(|source| Error::StackAllocation {
            size: stack_size,
            source,
        })?;
        let stack_base = stack.base().get();

        let id = runtime::state().fiber_created();
        log::debug!("Fiber::new id={} stack_size={}", id, stack_size);

        Ok(Fiber {
            id,
            state: Cell::new(State::Ready),
            stack_size,
            stack_base,
            context: UnsafeCell::new(Some(bind(stack, Box::new(callback)))),
            yielder: Cell::new(ptr::null()),
            thread_main: false,
            run_in_scheduler,
        })
    }

    /// Materialises the context of the calling thread's original stack.
    fn thread_main() -> Self {
        let id = runtime::state().fiber_created();
        log::debug!("Fiber::thread_main id={}", id);
        Fiber {
            id,
            state: Cell::new(State::Running),
            stack_size: 0,
            stack_base: 0,
            context: UnsafeCell::new(None),
            yielder: Cell::new(ptr::null()),
            thread_main: true,
            run_in_scheduler: false,
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Base address of the stack this fiber owns. Stays the same across
    /// [`Fiber::reset`].
    pub fn stack_base(&self) -> usize {
        self.stack_base
    }

    /// Whether a scheduler should requeue this fiber after it yields.
    pub fn runs_in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }

    /// Switches into this fiber and returns once it yields or terminates.
    ///
    /// The fiber must be neither `Running` nor `Term`. If the calling thread
    /// has no fiber yet, its thread-main fiber is created first.
    pub fn resume(&self) {
        let state = self.state.get();
        fiber_assert!(
            state != State::Term && state != State::Running,
            "cannot resume fiber {} in state {:?}",
            self.id,
            state
        );
        fiber_assert!(!self.thread_main, "cannot resume thread-main fiber {}", self.id);

        let caller = current_or_main();
        // SAFETY: the fiber is neither running nor the caller, so nothing else
        // holds a reference into its context.
        let context = unsafe { &mut *self.context.get() };
        let Some(context) = context.as_mut() else {
            fatal!("fiber {} has no execution context", self.id);
        };

        let _switch = Switch::enter(self, caller);
        if let CoroutineResult::Return(()) = context.resume(()) {
            self.state.set(State::Term);
            self.yielder.set(ptr::null());
        }
    }

    /// Rebinds a terminated fiber to a new callback, reusing its stack.
    pub fn reset<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        fiber_assert!(
            self.state.get() == State::Term,
            "cannot reset fiber {} in state {:?}",
            self.id,
            self.state.get()
        );
        let Some(context) = self.context.get_mut().take() else {
            fatal!("cannot reset thread-main fiber {}", self.id);
        };

        let stack = context.into_stack();
        self.stack_base = stack.base().get();
        *self.context.get_mut() = Some(bind(stack, Box::new(callback)));
        self.state.set(State::Ready);
    }

    /// Suspends the running fiber and returns control to whoever resumed it.
    ///
    /// Must be called from inside a fiber (not from a thread-main fiber).
    #[inline(never)]
    pub fn yield_now() {
        let fiber = CURRENT.get();
        fiber_assert!(!fiber.is_null(), "yield_now called outside of any fiber");
        // SAFETY: the current fiber is either this thread's main fiber or a
        // fiber borrowed by a `resume` further up this thread's stack.
        let fiber = unsafe { &*fiber };

        let state = fiber.state.get();
        fiber_assert!(
            state == State::Running || state == State::Term,
            "fiber {} cannot yield in state {:?}",
            fiber.id,
            state
        );
        let yielder = fiber.yielder.get();
        fiber_assert!(!yielder.is_null(), "thread-main fiber {} cannot yield", fiber.id);

        if state != State::Term {
            fiber.state.set(State::Ready);
        }
        // SAFETY: the yielder lives on the running fiber's stack.
        unsafe { (*yielder).suspend(()) };
    }

    /// Returns the id of the fiber running on this thread, creating the
    /// thread-main fiber if the thread has none yet.
    #[inline(never)]
    pub fn this_id() -> FiberId {
        // SAFETY: `current_or_main` always returns a live fiber.
        unsafe { (*current_or_main()).id }
    }

    /// Id of the fiber running on this thread, or `0` if there is none.
    #[inline(never)]
    pub fn current_id() -> FiberId {
        let current = CURRENT.get();
        if current.is_null() {
            0
        } else {
            // SAFETY: see `yield_now`.
            unsafe { (*current).id }
        }
    }

    /// State of the fiber running on this thread, if any.
    #[inline(never)]
    pub fn current_state() -> Option<State> {
        let current = CURRENT.get();
        // SAFETY: see `yield_now`.
        (!current.is_null()).then(|| unsafe { (*current).state.get() })
    }

    /// True when the calling code runs on a fiber's own stack rather than on
    /// a thread's original stack.
    #[inline(never)]
    pub fn in_fiber() -> bool {
        let current = CURRENT.get();
        // SAFETY: see `yield_now`.
        !current.is_null() && unsafe { !(*current).thread_main }
    }

    /// Number of fibers currently alive in the process.
    pub fn total_fibers() -> u64 {
        runtime::state()
            .live_fibers
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.thread_main {
            let this = self as *const Fiber;
            let _ = CURRENT.try_with(|current| {
                if current.get() == this {
                    current.set(ptr::null());
                }
            });
        }
        runtime::state().fiber_destroyed();
        log::debug!("Fiber::drop id={} state={:?}", self.id, self.state.get());
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("stack_size", &self.stack_size)
            .field("thread_main", &self.thread_main)
            .field("run_in_scheduler", &self.run_in_scheduler)
            .finish()
    }
}

/// Binds a stack and a callback into a fresh, unstarted context.
fn bind(stack: DefaultStack, callback: Callback) -> Context {
    Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, _input: ()| {
        trampoline(yielder, callback)
    })
}

/// First code every fiber runs. Termination is reported to `resume` by the
/// coroutine returning.
fn trampoline(yielder: &Yielder<(), ()>, callback: Callback) {
    // The fiber cannot move before its first yield, so the pointer is valid here.
    let fiber = CURRENT.get();
    fiber_assert!(!fiber.is_null(), "fiber entered without a current fiber");
    // SAFETY: `resume` made this fiber current right before switching in.
    unsafe { (*fiber).yielder.set(yielder as *const _) };
    callback();
}

/// Returns the current fiber, creating the thread-main fiber on first use.
fn current_or_main() -> *const Fiber {
    let current = CURRENT.get();
    if !current.is_null() {
        return current;
    }
    THREAD_MAIN.with(|slot| {
        let mut slot = slot.borrow_mut();
        let main = slot.get_or_insert_with(|| Box::new(Fiber::thread_main()));
        let main: *const Fiber = &**main;
        CURRENT.set(main);
        main
    })
}

/// Bookkeeping around one switch into a fiber. Dropping it (normally or while
/// a fiber panic unwinds through `resume`) makes the caller current again.
struct Switch<'a> {
    fiber: &'a Fiber,
    caller: *const Fiber,
}

impl<'a> Switch<'a> {
    fn enter(fiber: &'a Fiber, caller: *const Fiber) -> Self {
        // SAFETY: the caller is the live current fiber of this thread.
        unsafe { (*caller).state.set(State::Ready) };
        CURRENT.set(fiber);
        fiber.state.set(State::Running);
        Switch { fiber, caller }
    }
}

impl Drop for Switch<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.fiber.state.set(State::Term);
            self.fiber.yielder.set(ptr::null());
        }
        CURRENT.set(self.caller);
        // SAFETY: the caller stayed suspended in `resume` for the whole switch.
        unsafe { (*self.caller).state.set(State::Running) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_new_fiber_is_ready() {
        let fiber = Fiber::with_options(|| {}, 64 * 1024, false);
        assert_eq!(fiber.state(), State::Ready);
        assert_eq!(fiber.stack_size(), 64 * 1024);
        assert!(fiber.id() > 0);
        assert!(fiber.stack_base() != 0);
        assert!(!fiber.runs_in_scheduler());
    }

    #[test]
    fn test_default_stack_size_from_config() {
        let fiber = Fiber::new(|| {});
        assert_eq!(fiber.stack_size(), DEFAULT_STACK_SIZE as usize);
        assert!(fiber.runs_in_scheduler());
    }

    #[test]
    fn test_ids_increase() {
        let a = Fiber::new(|| {});
        let b = Fiber::new(|| {});
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_resume_yield_resume() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let fiber = Fiber::with_options(
            move || {
                log_clone.lock().push("before");
                Fiber::yield_now();
                log_clone.lock().push("after");
            },
            0,
            false,
        );

        fiber.resume();
        assert_eq!(fiber.state(), State::Ready);
        assert_eq!(*log.lock(), vec!["before"]);

        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(*log.lock(), vec!["before", "after"]);
    }

    #[test]
    fn test_current_fiber_tracks_switches() {
        let main_id = Fiber::this_id();
        assert_eq!(Fiber::current_id(), main_id);
        assert!(!Fiber::in_fiber());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let fiber = Fiber::with_options(
            move || {
                seen_clone.store(Fiber::current_id() as usize, Ordering::SeqCst);
                assert!(Fiber::in_fiber());
                assert_eq!(Fiber::current_state(), Some(State::Running));
                // The resumer is suspended, so this is the only running fiber.
                let main_state = THREAD_MAIN.with(|slot| {
                    slot.borrow().as_ref().map(|main| (main.id(), main.state()))
                });
                assert_eq!(main_state, Some((main_id, State::Ready)));
            },
            0,
            false,
        );
        fiber.resume();

        assert_eq!(seen.load(Ordering::SeqCst) as u64, fiber.id());
        assert_eq!(Fiber::current_id(), main_id);
        assert_eq!(Fiber::current_state(), Some(State::Running));
    }

    #[test]
    fn test_current_id_without_fiber_is_zero() {
        thread::spawn(|| {
            assert_eq!(Fiber::current_id(), 0);
            assert_eq!(Fiber::current_state(), None);
            let id = Fiber::this_id();
            assert!(id > 0);
            assert_eq!(Fiber::current_id(), id);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_reset_reuses_stack() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c1 = counter.clone();
        let mut fiber = Fiber::with_options(move || {
            c1.fetch_add(1, Ordering::SeqCst);
        }, 0, false);
        let base = fiber.stack_base();
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);

        let c2 = counter.clone();
        fiber.reset(move || {
            c2.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), State::Ready);
        assert_eq!(fiber.stack_base(), base);

        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_nested_resume_returns_to_resumer() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let outer_log = log.clone();
        let outer = Fiber::with_options(
            move || {
                let inner_log = outer_log.clone();
                let inner = Fiber::with_options(
                    move || {
                        inner_log.lock().push("inner-1");
                        Fiber::yield_now();
                        inner_log.lock().push("inner-2");
                    },
                    0,
                    false,
                );
                inner.resume();
                outer_log.lock().push("outer");
                inner.resume();
                assert_eq!(inner.state(), State::Term);
            },
            0,
            false,
        );
        outer.resume();
        assert_eq!(outer.state(), State::Term);
        assert_eq!(*log.lock(), vec!["inner-1", "outer", "inner-2"]);
    }

    #[test]
    fn test_fiber_moves_between_threads_while_suspended() {
        let fiber = Fiber::with_options(
            || {
                Fiber::yield_now();
            },
            0,
            true,
        );
        fiber.resume();
        assert_eq!(fiber.state(), State::Ready);

        let state = thread::spawn(move || {
            fiber.resume();
            fiber.state()
        })
        .join()
        .unwrap();
        assert_eq!(state, State::Term);
    }

    #[test]
    fn test_panicking_callback_terminates_fiber() {
        let fiber = Fiber::with_options(|| panic!("boom"), 0, false);
        let result = panic::catch_unwind(AssertUnwindSafe(|| fiber.resume()));
        assert!(result.is_err());
        assert_eq!(fiber.state(), State::Term);
        assert!(!Fiber::in_fiber());
    }

    #[test]
    #[should_panic(expected = "cannot resume fiber")]
    fn test_resume_terminated_fiber_panics() {
        let fiber = Fiber::with_options(|| {}, 0, false);
        fiber.resume();
        fiber.resume();
    }

    #[test]
    #[should_panic(expected = "cannot reset fiber")]
    fn test_reset_ready_fiber_panics() {
        let mut fiber = Fiber::with_options(|| {}, 0, false);
        fiber.reset(|| {});
    }

    #[test]
    #[should_panic(expected = "outside of any fiber")]
    fn test_yield_without_fiber_panics() {
        thread::spawn(Fiber::yield_now)
            .join()
            .map_err(|payload| panic::resume_unwind(payload))
            .ok();
    }

    #[test]
    #[should_panic(expected = "thread-main fiber")]
    fn test_yield_from_thread_main_panics() {
        Fiber::this_id();
        Fiber::yield_now();
    }

    #[test]
    fn test_live_fiber_count_tracks_drops() {
        let before = runtime::state().fibers_created.load(Ordering::Relaxed);
        let fiber = Fiber::new(|| {});
        assert!(runtime::state().fibers_created.load(Ordering::Relaxed) > before);
        assert!(Fiber::total_fibers() >= 1);
        drop(fiber);
    }
}
