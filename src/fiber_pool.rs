//! Per-worker pool of terminated fibers.
//!
//! Callback tasks run on a fiber taken from here and rebound with
//! [`Fiber::reset`], so the stack mapping is reused instead of reallocated.
//! The pool belongs to a single worker thread.

use crate::error::Result;
use crate::fiber::{Fiber, State};

pub struct FiberPool {
    pool: Vec<Fiber>,
    capacity: usize,
    stack_size: usize,
}

impl FiberPool {
    /// Creates an empty pool holding at most `capacity` fibers with stacks of
    /// `stack_size` bytes (`0` = `fiber.stack_size`).
    pub fn new(capacity: usize, stack_size: usize) -> Self {
        FiberPool {
            pool: Vec::with_capacity(capacity),
            capacity,
            stack_size,
        }
    }

    /// Returns a ready fiber bound to `callback`, reusing a pooled one when
    /// available.
    pub fn acquire<F>(&mut self, callback: F) -> Result<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.pool.pop() {
            Some(mut fiber) => {
                fiber.reset(callback);
                Ok(fiber)
            }
            None => Fiber::try_with_options(callback, self.stack_size, true),
        }
    }

    /// Gives a terminated fiber back. Fibers that are not `Term`, or that do
    /// not fit, are dropped.
    pub fn release(&mut self, fiber: Fiber) {
        if fiber.state() == State::Term && self.pool.len() < self.capacity {
            self.pool.push(fiber);
        }
    }

    /// Returns the current number of fibers in the pool.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}
