use super::mutex::MutexGuard;
use crate::error::{Error, Result};
use std::time::{Duration, Instant};

/// Condition variable paired with [`Mutex`](super::Mutex).
///
/// A return from [`wait`](Condvar::wait) says nothing about the predicate:
/// wakeups can be spurious or stolen by another thread that re-acquired the
/// lock first. Re-check in a loop, or use [`wait_while`](Condvar::wait_while).
#[derive(Debug, Default)]
pub struct Condvar {
    inner: parking_lot::Condvar,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            inner: parking_lot::Condvar::new(),
        }
    }

    /// Release the guard's lock, park, and re-acquire before returning.
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) {
        guard.disown();
        self.inner.wait(&mut guard.inner);
        guard.reown();
    }

    /// [`wait`](Condvar::wait) bounded by `timeout`. On expiry the lock is
    /// still re-acquired, then [`Error::Timeout`] is returned.
    pub fn wait_timeout<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
    ) -> Result<()> {
        guard.disown();
        let res = self.inner.wait_for(&mut guard.inner, timeout);
        guard.reown();
        if res.timed_out() {
            Err(Error::Timeout)
        } else {
            Ok(())
        }
    }

    /// Park until `condition` returns false.
    pub fn wait_while<T: ?Sized, F>(&self, guard: &mut MutexGuard<'_, T>, mut condition: F)
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut **guard) {
            self.wait(guard);
        }
    }

    /// [`wait_while`](Condvar::wait_while) with an overall deadline. The
    /// predicate is checked once more after the deadline so a wakeup racing
    /// the timeout is not lost.
    pub fn wait_while_timeout<T: ?Sized, F>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
        mut condition: F,
    ) -> Result<()>
    where
        F: FnMut(&mut T) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while condition(&mut **guard) {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let _ = self.wait_timeout(guard, deadline - now);
        }
        Ok(())
    }

    pub fn notify_one(&self) -> bool {
        self.inner.notify_one()
    }

    /// Wake up to `n` waiters, returning how many were actually woken.
    pub fn notify(&self, n: usize) -> usize {
        let mut woken = 0;
        while woken < n && self.inner.notify_one() {
            woken += 1;
        }
        woken
    }

    pub fn notify_all(&self) -> usize {
        self.inner.notify_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_while_sees_update() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let pair2 = pair.clone();

        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            *pair2.0.lock() = true;
            pair2.1.notify_all();
        });

        let (lock, cvar) = &*pair;
        let mut ready = lock.lock();
        cvar.wait_while(&mut ready, |ready| !*ready);
        assert!(*ready);
        drop(ready);
        setter.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_reacquires() {
        let lock = Mutex::new(0);
        let cvar = Condvar::new();
        let mut guard = lock.lock();
        let res = cvar.wait_timeout(&mut guard, Duration::from_millis(10));
        assert!(matches!(res, Err(Error::Timeout)));
        // still held and usable
        *guard += 1;
        assert!(lock.is_held_by_current_thread());
    }

    #[test]
    fn test_wait_while_timeout_expires() {
        let lock = Mutex::new(false);
        let cvar = Condvar::new();
        let mut guard = lock.lock();
        let res = cvar.wait_while_timeout(&mut guard, Duration::from_millis(20), |v| !*v);
        assert!(res.unwrap_err().is_timeout());
    }

    #[test]
    fn test_notify_n_wakes_at_most_n() {
        let state = Arc::new((Mutex::new(0usize), Condvar::new()));
        let woke = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let state = state.clone();
                let woke = woke.clone();
                thread::spawn(move || {
                    let (lock, cvar) = &*state;
                    let mut tickets = lock.lock();
                    cvar.wait_while(&mut tickets, |t| *t == 0);
                    *tickets -= 1;
                    woke.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        {
            let (lock, cvar) = &*state;
            *lock.lock() = 2;
            cvar.notify(2);
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(woke.load(Ordering::SeqCst), 2);

        {
            let (lock, cvar) = &*state;
            *lock.lock() = 2;
            cvar.notify_all();
        }
        for w in waiters {
            w.join().unwrap();
        }
        assert_eq!(woke.load(Ordering::SeqCst), 4);
    }
}
