//! Error type for the recoverable failures of the fiber runtime.
//!
//! Broken invariants are not represented here; they go through
//! `fiber_assert!` and abort the current operation.

use std::io;
use thiserror::Error;

/// Errors surfaced to callers of the fiber and scheduler APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// The OS refused to map a fiber stack.
    #[error("failed to allocate a {size} byte fiber stack")]
    StackAllocation {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread `{name}`")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The scheduler is stopping (or stopped) and no longer accepts work.
    #[error("scheduler `{name}` is stopping")]
    Stopping { name: String },

    /// A task was pinned to a worker id the scheduler does not have.
    #[error("scheduler `{name}` has no worker {worker} (it has {workers})")]
    NoSuchWorker {
        name: String,
        worker: usize,
        workers: usize,
    },

    /// Configuration names are restricted to `[a-z0-9._]`.
    #[error("invalid config name `{0}`")]
    ConfigName(String),

    /// A config name was looked up with a different value type than the one
    /// it was registered with.
    #[error("config `{name}` is registered as {registered}, not {requested}")]
    ConfigType {
        name: String,
        registered: &'static str,
        requested: &'static str,
    },

    /// A config value could not be parsed into the variable's type.
    #[error("failed to parse value for config `{name}`")]
    ConfigParse {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
