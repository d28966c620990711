//! Diagnostic helpers: backtrace formatting and the fail-fast assertion macros.
//!
//! Broken fiber or scheduler invariants cannot be recovered from, so the
//! macros here log the failure together with a backtrace and then panic.

use std::backtrace::Backtrace;

/// Captures the current backtrace and renders it one frame line per output
/// line, each prefixed with `prefix`.
pub fn backtrace_to_string(prefix: &str) -> String {
    let backtrace = Backtrace::force_capture().to_string();
    let mut out = String::with_capacity(backtrace.len() + prefix.len() * 64);
    for line in backtrace.lines() {
        out.push_str(prefix);
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Logs an unrecoverable failure with a backtrace and panics.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        let message = format!($($arg)+);
        log::error!(
            "{}\nbacktrace:\n{}",
            message,
            $crate::util::backtrace_to_string("    ")
        );
        panic!("{}", message);
    }};
}

/// Checks an internal invariant; on failure behaves like [`fatal!`].
macro_rules! fiber_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            fatal!("ASSERTION: {}\n{}", stringify!($cond), format_args!($($arg)+));
        }
    };
}
