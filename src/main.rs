use fibersched::fiber::DEFAULT_STACK_SIZE;
use fibersched::{runtime, Config, Fiber, Scheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("fibersched - M:N cooperative fiber scheduler\n");

    // Register the setting so the document below can override it.
    if let Err(err) = Config::lookup("fiber.stack_size", DEFAULT_STACK_SIZE, "fiber stack size") {
        eprintln!("Config error: {}", err);
    }
    let settings = serde_json::json!({ "fiber": { "stack_size": 256 * 1024 } });
    if let Err(err) = Config::load_json(&settings) {
        eprintln!("Config error: {}", err);
    }

    // Example 1: a fiber driven by hand on the main thread
    println!("Example 1: Fiber round trip");
    let fiber = Fiber::new(|| {
        println!("  fiber {}: started", Fiber::current_id());
        Fiber::yield_now();
        println!("  fiber {}: resumed", Fiber::current_id());
    });
    println!("  main: resuming fiber {} (stack {} bytes)", fiber.id(), fiber.stack_size());
    fiber.resume();
    println!("  main: fiber yielded, state {:?}", fiber.state());
    fiber.resume();
    println!("  main: fiber finished, state {:?}\n", fiber.state());

    // Example 2: callbacks on a worker pool that includes this thread
    println!("Example 2: Scheduler with the calling thread as a worker");
    let scheduler = Scheduler::new(3, true, "demo");
    if let Err(err) = scheduler.start() {
        eprintln!("Start error: {}", err);
        return;
    }

    for step in 0..3 {
        let submitted = scheduler.schedule(move || {
            println!("  task {} on worker {:?}", step, fibersched::current_worker());
            Fiber::yield_now();
            println!("  task {} resumed on worker {:?}", step, fibersched::current_worker());
        });
        if let Err(err) = submitted {
            eprintln!("Schedule error: {}", err);
        }
    }
    let pinned = scheduler.schedule_on(
        || println!("  pinned task on root worker {:?}", fibersched::current_worker()),
        0,
    );
    if let Err(err) = pinned {
        eprintln!("Schedule error: {}", err);
    }
    scheduler.stop();
    println!();

    // Example 3: throughput
    println!("Example 3: High-throughput run");
    let scheduler = Scheduler::with_default_threads("throughput");
    if let Err(err) = scheduler.start() {
        eprintln!("Start error: {}", err);
        return;
    }
    let done = Arc::new(AtomicUsize::new(0));
    let num_tasks = 10_000;
    let start = Instant::now();
    for _ in 0..num_tasks {
        let done = done.clone();
        if scheduler
            .schedule(move || {
                done.fetch_add(1, Ordering::Relaxed);
            })
            .is_err()
        {
            break;
        }
    }
    scheduler.stop();
    let duration = start.elapsed();
    println!(
        "  Executed {} tasks on {} workers in {:?}",
        done.load(Ordering::Relaxed),
        scheduler.thread_count(),
        duration
    );
    println!(
        "  Throughput: {:.2} tasks/second\n",
        num_tasks as f64 / duration.as_secs_f64()
    );

    let snapshot = runtime::state().snapshot();
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => println!("Runtime counters:\n{}", json),
        Err(err) => eprintln!("Snapshot error: {}", err),
    }
}
