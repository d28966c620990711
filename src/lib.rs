//! # fibersched - M:N Cooperative Fiber Scheduler
//!
//! Stackful fibers multiplexed onto a fixed pool of worker threads.
//!
//! ## Architecture
//!
//! - **Fibers**: user-space execution contexts with their own stack that run
//!   a callback and can suspend themselves with [`Fiber::yield_now`]
//! - **Scheduler**: a named worker pool with one shared task queue; tasks may
//!   be pinned to a specific worker
//! - **Workers**: threads running the dispatch loop, parking in an idle fiber
//!   when nothing is runnable
//! - **Config**: process-wide named settings such as `fiber.stack_size`
//!
//! Scheduling is cooperative: a fiber keeps its worker until it yields or
//! finishes. A yielded fiber that participates in scheduling goes back to
//! the tail of the queue.
//!
//! ## Example
//!
//! ```no_run
//! use fibersched::{Fiber, Scheduler};
//!
//! let scheduler = Scheduler::new(4, false, "main");
//! scheduler.start().unwrap();
//!
//! scheduler.schedule(|| {
//!     println!("step 1 on worker {:?}", fibersched::current_worker());
//!     Fiber::yield_now();
//!     println!("step 2 on worker {:?}", fibersched::current_worker());
//! }).unwrap();
//!
//! scheduler.stop();
//! ```

#[macro_use]
mod util;

pub mod config;
pub mod error;
pub mod fiber;
pub mod fiber_pool;
pub mod runtime;
pub mod scheduler;
pub mod task;
#[cfg(feature = "trace")]
pub mod trace;
pub mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning spawned worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i, wrapping around).
    Linear,
}

pub use config::{Config, ConfigVar};
pub use error::{Error, Result};
pub use fiber::{Fiber, FiberId, State};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
pub use task::SchedulerTask;
pub use worker::current_worker;
