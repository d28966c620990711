use fibersched::{Fiber, Scheduler, SchedulerHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_recursive_parallel_decomposition() {
    init_logger();
    let scheduler = Scheduler::new(2, false, "recursive");
    scheduler.start().unwrap();
    let result = Arc::new(AtomicUsize::new(0));
    let parent_done = Arc::new(AtomicUsize::new(0));

    let r = result.clone();
    let done = parent_done.clone();
    scheduler
        .schedule(move || {
            let handle = SchedulerHandle::current().unwrap();
            let children_done = Arc::new(AtomicUsize::new(0));

            for i in 0..4 {
                let r = r.clone();
                let children_done = children_done.clone();
                let (start, end) = (i * 25, (i + 1) * 25);
                handle
                    .schedule(move || {
                        let sum: usize = (start..end).sum();
                        r.fetch_add(sum, Ordering::SeqCst);
                        children_done.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }

            // Wait cooperatively: yielding lets the children use this worker.
            while children_done.load(Ordering::SeqCst) < 4 {
                Fiber::yield_now();
            }
            done.store(1, Ordering::SeqCst);
        })
        .unwrap();

    while parent_done.load(Ordering::SeqCst) == 0 {
        std::thread::yield_now();
    }
    scheduler.stop();

    let expected: usize = (0..100).sum();
    assert_eq!(result.load(Ordering::SeqCst), expected);
}
