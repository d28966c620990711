//! Fiber switch latency benchmark using criterion.
//!
//! Measures the raw resume/yield cost with direct fiber APIs, then the cost
//! of one callback round trip through a single-worker scheduler.

use criterion::{criterion_group, criterion_main, Criterion};
use fibersched::{Fiber, Scheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Resume into a fiber that yields forever: one switch in, one switch out.
fn bench_resume_yield(c: &mut Criterion) {
    let fiber = Fiber::with_options(
        || loop {
            Fiber::yield_now();
        },
        128 * 1024,
        false,
    );

    // Warmup
    for _ in 0..1000 {
        fiber.resume();
    }

    c.bench_function("fiber_resume_yield", |b| {
        b.iter(|| fiber.resume())
    });
}

/// Rebind a terminated fiber and run it to completion, as the worker pool does.
fn bench_reset_and_run(c: &mut Criterion) {
    let mut fiber = Fiber::new(|| {});
    fiber.resume();

    c.bench_function("fiber_reset_run", |b| {
        b.iter(|| {
            fiber.reset(|| {
                std::hint::black_box(42);
            });
            fiber.resume();
        })
    });
}

/// Scheduler round trip for comparison.
fn bench_scheduler_round_trip(c: &mut Criterion) {
    let scheduler = Scheduler::new(1, false, "bench_switch");
    if let Err(err) = scheduler.start() {
        panic!("cannot start scheduler: {}", err);
    }
    let done = Arc::new(AtomicUsize::new(0));

    c.bench_function("scheduler_round_trip", |b| {
        b.iter(|| {
            let target = done.load(Ordering::Acquire) + 1;
            let d = done.clone();
            let _ = scheduler.schedule(move || {
                d.fetch_add(1, Ordering::Release);
            });
            while done.load(Ordering::Acquire) < target {
                std::hint::spin_loop();
            }
        })
    });

    scheduler.stop();
}

criterion_group!(
    benches,
    bench_resume_yield,
    bench_reset_and_run,
    bench_scheduler_round_trip
);
criterion_main!(benches);
