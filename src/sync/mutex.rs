use super::current_thread_token;
use crate::error::{Error, Result};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Non-reentrant mutual exclusion lock.
///
/// A thread that already holds the lock and calls [`lock`](Mutex::lock)
/// again would deadlock on itself. Rather than hang, the lock remembers its
/// owner and panics with a state-violation message; this is a bug in the
/// caller, not a recoverable condition. Use
/// [`ReentrantMutex`](super::ReentrantMutex) when re-entry is intended.
pub struct Mutex<T: ?Sized> {
    owner: AtomicU64,
    inner: parking_lot::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicU64::new(0),
            inner: parking_lot::const_mutex(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Block until the lock is held exclusively.
    ///
    /// # Panics
    ///
    /// If the calling thread already holds this lock.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let me = current_thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            panic!("{}", reentry_violation());
        }
        let guard = self.inner.lock();
        self.owned(guard, me)
    }

    /// Like [`lock`](Mutex::lock), giving up with [`Error::Timeout`] after
    /// `timeout`. A timed-out call leaves the lock untouched.
    pub fn lock_timeout(&self, timeout: Duration) -> Result<MutexGuard<'_, T>> {
        let me = current_thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            return Err(reentry_violation());
        }
        match self.inner.try_lock_for(timeout) {
            Some(guard) => Ok(self.owned(guard, me)),
            None => Err(Error::Timeout),
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let me = current_thread_token();
        self.inner.try_lock().map(|guard| self.owned(guard, me))
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_token()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    fn owned<'a>(&'a self, inner: parking_lot::MutexGuard<'a, T>, me: u64) -> MutexGuard<'a, T> {
        self.owner.store(me, Ordering::Release);
        MutexGuard { mutex: self, inner }
    }
}

fn reentry_violation() -> Error {
    Error::state_violation("mutex re-locked by the thread holding it (Mutex is not reentrant)")
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(value) => f.debug_struct("Mutex").field("data", &&*value).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

/// Releases the lock when dropped.
pub struct MutexGuard<'a, T: ?Sized> {
    pub(super) mutex: &'a Mutex<T>,
    pub(super) inner: parking_lot::MutexGuard<'a, T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    // the condvar gives up the lock while parked
    pub(super) fn disown(&self) {
        self.mutex.owner.store(0, Ordering::Release);
    }

    pub(super) fn reown(&self) {
        self.mutex
            .owner
            .store(current_thread_token(), Ordering::Release);
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // cleared before `inner` unlocks
        self.disown();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_and_mutate() {
        let m = Mutex::new(1);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 2);
        assert!(!m.is_locked());
    }

    #[test]
    fn test_counter_across_threads() {
        let m = Arc::new(Mutex::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 8000);
    }

    #[test]
    #[should_panic(expected = "not reentrant")]
    fn test_reentry_panics() {
        let m = Mutex::new(());
        let _first = m.lock();
        let _second = m.lock();
    }

    #[test]
    fn test_reentry_with_timeout_is_an_error() {
        let m = Mutex::new(());
        let _held = m.lock();
        let err = m.lock_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::StateViolation(_)));
    }

    #[test]
    fn test_lock_timeout_leaves_lock_consistent() {
        let m = Arc::new(Mutex::new(5));
        let held = m.lock();

        let m2 = m.clone();
        let waiter = thread::spawn(move || m2.lock_timeout(Duration::from_millis(30)).is_err());
        assert!(waiter.join().unwrap());

        drop(held);
        let m3 = m.clone();
        let value = thread::spawn(move || *m3.lock_timeout(Duration::from_millis(100)).unwrap())
            .join()
            .unwrap();
        assert_eq!(value, 5);
    }

    #[test]
    fn test_try_lock() {
        let m = Mutex::new(0);
        let guard = m.try_lock().unwrap();
        assert!(m.is_held_by_current_thread());
        drop(guard);
        assert!(!m.is_held_by_current_thread());
        assert!(m.try_lock().is_some());
    }
}
