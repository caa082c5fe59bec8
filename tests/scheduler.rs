//! Multi-thread scheduler scenarios not covered by the in-module unit
//! tests: caller-hosted dispatch, and a worker pool under concurrent
//! submission from many threads at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use corosched::{Scheduler, Work};

#[test]
fn caller_hosted_scheduler_runs_queued_work_on_stop() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sched = Scheduler::new(2, true, "test-caller-hosted");
    let ran = Arc::new(AtomicUsize::new(0));
    sched.start();

    for _ in 0..10 {
        let ran = ran.clone();
        sched.submit(Work::from_fn(move || { ran.fetch_add(1, Ordering::SeqCst); }), None);
    }

    // `stop` is what actually enters the caller-hosted dispatch coroutine
    // on this thread; the work above only runs once it does.
    sched.stop();

    assert_eq!(ran.load(Ordering::SeqCst), 10);
}

#[test]
fn many_threads_submitting_concurrently_all_get_run() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sched = Scheduler::new(num_cpus::get().max(2), false, "test-concurrent-submit");
    sched.start();

    let ran = Arc::new(AtomicUsize::new(0));
    let producers: Vec<_> = (0..8)
        .map(|_| {
            let sched = sched.clone();
            let ran = ran.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let ran = ran.clone();
                    sched.submit(Work::from_fn(move || { ran.fetch_add(1, Ordering::SeqCst); }), None);
                }
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }

    std::thread::sleep(Duration::from_millis(300));
    sched.stop();

    assert_eq!(ran.load(Ordering::SeqCst), 400);
}

#[test]
fn pinned_and_unpinned_tasks_all_complete_on_the_right_worker() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sched = Scheduler::new(2, false, "test-pin-fifo");
    sched.start();

    let completions: Arc<Mutex<Vec<(&'static str, Option<usize>)>>> =
        Arc::new(Mutex::new(Vec::new()));

    let submit = |label: &'static str, pin: Option<usize>| {
        let completions = completions.clone();
        sched.submit(
            Work::from_fn(move || {
                let worker = Scheduler::current_worker_id();
                completions.lock().unwrap().push((label, worker));
            }),
            pin,
        );
    };

    // T1(pin=worker_1), T2(any), T3(pin=worker_0), T4(any)
    submit("T1", Some(1));
    submit("T2", None);
    submit("T3", Some(0));
    submit("T4", None);

    // Give the pool time to drain the FIFO before shutting down.
    std::thread::sleep(Duration::from_millis(300));
    sched.stop();

    let seen = completions.lock().unwrap();
    assert_eq!(seen.len(), 4, "every task must run exactly once, none skipped or duplicated");

    let mut labels: Vec<_> = seen.iter().map(|(l, _)| *l).collect();
    labels.sort();
    assert_eq!(labels, vec!["T1", "T2", "T3", "T4"]);

    for (label, worker) in seen.iter() {
        match *label {
            "T1" => assert_eq!(*worker, Some(1), "T1 was pinned to worker 1"),
            "T3" => assert_eq!(*worker, Some(0), "T3 was pinned to worker 0"),
            _ => {}
        }
    }
}
