//! Chrome Tracing collector for task dispatch.
//!
//! Workers record one span per dispatched task into a thread-local buffer and
//! flush it when their dispatch loop exits. The collected events can be
//! exported to a JSON file readable by chrome://tracing or ui.perfetto.dev.
//! Compiled only with the `trace` feature.

use parking_lot::Mutex;
use serde::Serialize;
use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

/// A single "complete" event (`ph: X`) in Chrome Tracing format.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: &'static str,
    pub ph: &'static str,
    #[serde(rename = "ts")]
    pub start_us: u64,
    #[serde(rename = "dur")]
    pub duration_us: u64,
    pub pid: u32,
    pub tid: usize,
}

thread_local! {
    static TRACE_BUFFER: RefCell<Vec<TraceEvent>> = const { RefCell::new(Vec::new()) };
}

lazy_static::lazy_static! {
    static ref GLOBAL_START: Instant = Instant::now();
    static ref ALL_BUFFERS: Mutex<Vec<Vec<TraceEvent>>> = Mutex::new(Vec::new());
}

/// Records a span of work for worker `tid`.
pub fn record_event(name: &'static str, tid: usize, start: Instant, end: Instant) {
    let start_us = start.saturating_duration_since(*GLOBAL_START).as_micros() as u64;
    let duration_us = end.saturating_duration_since(start).as_micros() as u64;

    TRACE_BUFFER.with(|buf| {
        buf.borrow_mut().push(TraceEvent {
            name,
            ph: "X",
            start_us,
            duration_us,
            pid: std::process::id(),
            tid,
        });
    });
}

/// Moves this thread's buffer into the global list.
pub fn collect_local_trace() {
    TRACE_BUFFER.with(|buf| {
        let mut local = buf.borrow_mut();
        if !local.is_empty() {
            ALL_BUFFERS.lock().push(std::mem::take(&mut *local));
        }
    });
}

/// Exports all collected events as a JSON array.
pub fn export_to_file(path: &str) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let buffers = ALL_BUFFERS.lock();
    let events: Vec<&TraceEvent> = buffers.iter().flatten().collect();
    serde_json::to_writer(&mut writer, &events)?;
    writer.flush()
}

/// Records a span from construction to drop.
pub struct TraceGuard {
    name: &'static str,
    tid: usize,
    start: Instant,
}

impl TraceGuard {
    pub fn new(name: &'static str, tid: usize) -> Self {
        Self {
            name,
            tid,
            start: Instant::now(),
        }
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        record_event(self.name, self.tid, self.start, Instant::now());
    }
}

/// Flushes the local trace buffer when dropped.
pub struct CollectorGuard;

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        collect_local_trace();
    }
}
