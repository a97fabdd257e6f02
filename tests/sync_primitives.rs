use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use taskforge::queue::PutError;
use taskforge::sync::{Condvar, Event, Mutex, ReentrantMutex, Semaphore};
use taskforge::{BoundedQueue, Error};

#[test]
fn test_mutex_counter_is_exact() {
    let counter = Arc::new(Mutex::new(0u64));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..10_000 {
                    *counter.lock() += 1;
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*counter.lock(), 80_000);
}

#[test]
fn test_mutex_timeout_leaves_lock_usable() {
    let lock = Arc::new(Mutex::new(()));
    let holder = {
        let lock = lock.clone();
        let started = Arc::new(Event::new());
        let signal = started.clone();
        let h = thread::spawn(move || {
            let _guard = lock.lock();
            signal.set();
            thread::sleep(Duration::from_millis(150));
        });
        started.wait();
        h
    };
    assert!(matches!(
        lock.lock_timeout(Duration::from_millis(20)),
        Err(Error::Timeout)
    ));
    holder.join().unwrap();
    assert!(lock.lock_timeout(Duration::from_millis(20)).is_ok());
}

#[test]
fn test_reentrant_mutex_nests() {
    let lock = ReentrantMutex::new(5);
    let outer = lock.lock();
    let inner = lock.lock();
    assert_eq!(*outer + *inner, 10);
    assert_eq!(lock.depth(), 2);
    drop(inner);
    assert_eq!(lock.depth(), 1);
    drop(outer);
    assert_eq!(lock.depth(), 0);
}

#[test]
fn test_semaphore_bounds_concurrency() {
    let sem = Arc::new(Semaphore::new(3));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let (sem, active, peak) = (sem.clone(), active.clone(), peak.clone());
            thread::spawn(move || {
                let _permit = sem.permit();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                active.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(sem.available(), 3);
}

#[test]
fn test_bounded_semaphore_rejects_over_release() {
    let sem = Semaphore::bounded(1);
    sem.acquire();
    sem.release().unwrap();
    assert!(matches!(sem.release(), Err(Error::StateViolation(_))));
    assert_eq!(sem.available(), 1);
}

#[test]
fn test_event_wakes_every_waiter() {
    let event = Arc::new(Event::new());
    let woken = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let (event, woken) = (event.clone(), woken.clone());
            thread::spawn(move || {
                event.wait_timeout(Duration::from_secs(5)).unwrap();
                woken.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(30));
    event.set();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 4);

    event.clear();
    assert!(event.wait_timeout(Duration::from_millis(10)).unwrap_err().is_timeout());
}

#[test]
fn test_condvar_handoff() {
    let pair = Arc::new((Mutex::new(Vec::<u32>::new()), Condvar::new()));
    let consumer = {
        let pair = pair.clone();
        thread::spawn(move || {
            let (lock, cvar) = &*pair;
            let mut items = lock.lock();
            cvar.wait_while(&mut items, |items| items.len() < 3);
            items.clone()
        })
    };
    for i in 0..3 {
        let (lock, cvar) = &*pair;
        lock.lock().push(i);
        cvar.notify_all();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(consumer.join().unwrap(), vec![0, 1, 2]);
}

#[test]
fn test_queue_producers_and_consumers() {
    let queue = Arc::new(BoundedQueue::bounded(4));
    let producers: Vec<_> = (0..3)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..100u32 {
                    queue.put(p * 1000 + i).unwrap();
                }
            })
        })
        .collect();

    let total = Arc::new(AtomicUsize::new(0));
    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let (queue, total) = (queue.clone(), total.clone());
            thread::spawn(move || {
                let mut last_seen = [None::<u32>; 3];
                while let Ok(item) = queue.get() {
                    // per-producer order survives the queue
                    let p = (item / 1000) as usize;
                    if let Some(prev) = last_seen[p] {
                        assert!(item > prev);
                    }
                    last_seen[p] = Some(item);
                    total.fetch_add(1, Ordering::SeqCst);
                    queue.task_done().unwrap();
                }
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    queue.join();
    queue.close();
    for c in consumers {
        c.join().unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 300);
}

#[test]
fn test_full_queue_hands_item_back() {
    let queue = BoundedQueue::bounded(1);
    queue.put("first").unwrap();

    let start = Instant::now();
    match queue.put_timeout("second", Duration::from_millis(30)) {
        Err(PutError::Timeout(item)) => assert_eq!(item, "second"),
        _ => panic!("expected a timeout"),
    }
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get().unwrap(), "first");
}
