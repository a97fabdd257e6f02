use super::current_thread_token;
use crate::error::{Error, Result};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Lock that its owner may acquire again.
///
/// Each acquisition by the owning thread bumps a depth counter; the lock is
/// released to other threads only when the depth drops back to zero. Like
/// any reentrant lock it hands out shared references only; wrap the data in
/// a `Cell`/`RefCell` for mutation.
pub struct ReentrantMutex<T> {
    owner: AtomicU64,
    depth: AtomicUsize,
    inner: parking_lot::ReentrantMutex<T>,
}

impl<T> ReentrantMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
            inner: parking_lot::const_reentrant_mutex(value),
        }
    }

    pub fn lock(&self) -> ReentrantMutexGuard<'_, T> {
        let guard = self.inner.lock();
        self.enter(guard)
    }

    pub fn lock_timeout(&self, timeout: Duration) -> Result<ReentrantMutexGuard<'_, T>> {
        match self.inner.try_lock_for(timeout) {
            Some(guard) => Ok(self.enter(guard)),
            None => Err(Error::Timeout),
        }
    }

    pub fn try_lock(&self) -> Option<ReentrantMutexGuard<'_, T>> {
        self.inner.try_lock().map(|guard| self.enter(guard))
    }

    /// How many nested guards the owner currently holds (0 when free).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_token()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    fn enter<'a>(
        &'a self,
        inner: parking_lot::ReentrantMutexGuard<'a, T>,
    ) -> ReentrantMutexGuard<'a, T> {
        // only the owner gets here, so depth and owner are not contended
        if self.depth.fetch_add(1, Ordering::AcqRel) == 0 {
            self.owner.store(current_thread_token(), Ordering::Release);
        }
        ReentrantMutexGuard { lock: self, inner }
    }
}

impl<T: fmt::Debug> fmt::Debug for ReentrantMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantMutex")
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

pub struct ReentrantMutexGuard<'a, T> {
    lock: &'a ReentrantMutex<T>,
    inner: parking_lot::ReentrantMutexGuard<'a, T>,
}

impl<T> Deref for ReentrantMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> Drop for ReentrantMutexGuard<'_, T> {
    fn drop(&mut self) {
        if self.lock.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.lock.owner.store(0, Ordering::Release);
        }
    }
}
