use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskforge::prelude::*;
use taskforge::{FutureState, ThreadPool};

fn pool(workers: usize) -> ThreadPool {
    ThreadPool::new(&Config::builder().workers(workers).build().unwrap()).unwrap()
}

#[test]
fn test_waiting_tasks_overlap() {
    let pool = pool(2);
    let start = Instant::now();
    let futures: Vec<_> = (0..5)
        .map(|_| pool.spawn(|| std::thread::sleep(Duration::from_millis(200))).unwrap())
        .collect();
    for f in &futures {
        f.result(None).unwrap();
    }
    let elapsed = start.elapsed();
    // three rounds on two workers
    assert!(elapsed >= Duration::from_millis(600), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(950), "{:?}", elapsed);
}

#[test]
fn test_active_workers_never_exceed_pool_size() {
    let pool = pool(3);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let futures: Vec<_> = (0..20)
        .map(|_| {
            let (active, peak) = (active.clone(), peak.clone());
            pool.spawn(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                active.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();
    for f in futures {
        f.result(None).unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
}

#[test]
fn test_failure_isolated_to_its_future() {
    let pool = pool(2);
    let bad = pool
        .spawn_with_context(|_| "not a number".parse::<i32>())
        .unwrap();
    let good = pool.spawn(|| 7).unwrap();

    let err = bad.result(None).unwrap_err();
    assert_eq!(err.task_error().unwrap().kind, "ParseIntError");
    assert_eq!(bad.state(), FutureState::Failed);
    assert_eq!(good.result(None).unwrap(), 7);
}

#[test]
fn test_cancel_only_while_pending() {
    let pool = pool(1);
    let gate = Arc::new(taskforge::sync::Event::new());
    let blocker = {
        let gate = gate.clone();
        pool.spawn(move || gate.wait()).unwrap()
    };
    let queued = pool.spawn(|| 1).unwrap();

    assert!(queued.cancel());
    assert!(queued.cancelled());
    assert!(matches!(queued.result(None), Err(Error::Cancelled)));

    // the blocker is running or about to; once running it cannot be cancelled
    while !blocker.running() {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(!blocker.cancel());
    gate.set();
    blocker.result(None).unwrap();
    assert!(!queued.running());
}

#[test]
fn test_interrupt_reaches_running_task() {
    let pool = pool(1);
    let fut = pool
        .spawn_with_context(|ctx| -> std::result::Result<u32, taskforge::future::Interrupted> {
            loop {
                ctx.checkpoint()?;
                std::thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();
    while !fut.running() {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(fut.interrupt());
    let err = fut.result(Some(Duration::from_secs(5))).unwrap_err();
    assert_eq!(err.task_error().unwrap().kind, "Interrupted");
}

#[test]
fn test_as_completed_yields_in_completion_order() {
    let pool = pool(3);
    let futures: Vec<Future<u64>> = [150u64, 10, 80]
        .into_iter()
        .map(|ms| {
            pool.spawn(move || {
                std::thread::sleep(Duration::from_millis(ms));
                ms
            })
            .unwrap()
        })
        .collect();

    let order: Vec<u64> = as_completed(futures, Some(Duration::from_secs(5)))
        .map(|f| f.unwrap().result(None).unwrap())
        .collect();
    assert_eq!(order, vec![10, 80, 150]);
}

#[test]
fn test_wait_first_exception() {
    let pool = pool(2);
    let slow = pool
        .spawn_with_context(|_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok::<u32, String>(1)
        })
        .unwrap();
    let failing = pool
        .spawn_with_context(|_| Err::<u32, String>("nope".into()))
        .unwrap();

    let outcome = wait(
        vec![slow.clone(), failing.clone()],
        ReturnWhen::FirstException,
        Some(Duration::from_secs(5)),
    );
    assert_eq!(outcome.done.len(), 1);
    assert_eq!(outcome.done[0].id(), failing.id());
    assert_eq!(outcome.not_done.len(), 1);
    slow.result(None).unwrap();
}

#[test]
fn test_result_timeout_leaves_future_pending() {
    let pool = pool(1);
    let fut = pool
        .spawn(|| std::thread::sleep(Duration::from_millis(200)))
        .unwrap();
    assert!(fut.result(Some(Duration::from_millis(10))).unwrap_err().is_timeout());
    assert!(!fut.done());
    fut.result(None).unwrap();
    assert!(fut.done());
}

#[test]
fn test_shutdown_wait_finishes_everything() {
    let pool = pool(2);
    let futures: Vec<_> = (0..6)
        .map(|i| {
            pool.spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                i
            })
            .unwrap()
        })
        .collect();
    pool.shutdown(ShutdownOptions::default());
    assert!(futures.iter().all(|f| f.done()));
    assert!(matches!(pool.spawn(|| ()), Err(Error::ShutDown)));
}

#[test]
fn test_shutdown_cancel_pending() {
    let pool = pool(1);
    let running = pool
        .spawn(|| std::thread::sleep(Duration::from_millis(100)))
        .unwrap();
    while !running.running() {
        std::thread::sleep(Duration::from_millis(1));
    }
    let queued: Vec<_> = (0..3).map(|_| pool.spawn(|| ()).unwrap()).collect();

    pool.shutdown(ShutdownOptions::default().cancel_pending(true));
    assert!(running.result(None).is_ok());
    assert!(queued.iter().all(|f| f.cancelled()));
}

#[test]
fn test_done_callback_runs_once_after_completion() {
    let pool = pool(1);
    let calls = Arc::new(AtomicUsize::new(0));
    let fut = pool.spawn(|| 3).unwrap();
    {
        let calls = calls.clone();
        fut.add_done_callback(move |f| {
            assert!(f.done());
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }
    fut.result(None).unwrap();
    pool.shutdown(ShutdownOptions::default());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // added after completion: runs right away
    let late = calls.clone();
    fut.add_done_callback(move |_| {
        late.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
