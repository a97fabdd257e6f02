use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counting semaphore.
///
/// [`Semaphore::bounded`] additionally remembers its initial count and
/// rejects any `release` that would exceed it: a double release is a bug in
/// the caller that an unbounded semaphore would quietly absorb.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    cvar: Condvar,
    limit: Option<usize>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cvar: Condvar::new(),
            limit: None,
        }
    }

    pub fn bounded(permits: usize) -> Self {
        Self {
            limit: Some(permits),
            ..Self::new(permits)
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.limit.is_some()
    }

    pub fn available(&self) -> usize {
        *self.permits.lock()
    }

    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cvar.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Acquire a permit or give up with [`Error::Timeout`], leaving the
    /// count unchanged.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.cvar.wait_until(&mut permits, deadline).timed_out() && *permits == 0 {
                return Err(Error::Timeout);
            }
        }
        *permits -= 1;
        Ok(())
    }

    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Return a permit and wake one waiter.
    ///
    /// A bounded semaphore fails with [`Error::StateViolation`] instead of
    /// growing past its initial count.
    pub fn release(&self) -> Result<()> {
        let mut permits = self.permits.lock();
        if let Some(limit) = self.limit {
            if *permits >= limit {
                return Err(Error::state_violation(format!(
                    "semaphore released more times than acquired (limit {})",
                    limit
                )));
            }
        }
        *permits += 1;
        drop(permits);
        self.cvar.notify_one();
        Ok(())
    }

    /// Acquire a permit that is returned when the guard drops.
    pub fn permit(&self) -> SemaphorePermit<'_> {
        self.acquire();
        SemaphorePermit { sem: self }
    }

    pub fn try_permit(&self) -> Option<SemaphorePermit<'_>> {
        self.try_acquire().then(|| SemaphorePermit { sem: self })
    }
}

#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.release() {
            // someone released our permit by hand
            tracing::error!(error = %e, "semaphore permit release rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let sem = Semaphore::new(2);
        sem.acquire();
        sem.acquire();
        assert!(!sem.try_acquire());
        sem.release().unwrap();
        assert!(sem.try_acquire());
    }

    #[test]
    fn test_unbounded_release_grows() {
        let sem = Semaphore::new(1);
        sem.release().unwrap();
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn test_bounded_over_release() {
        let sem = Semaphore::bounded(2);
        sem.acquire();
        sem.release().unwrap();
        let err = sem.release().unwrap_err();
        assert!(matches!(err, Error::StateViolation(_)));
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn test_acquire_timeout_does_not_consume() {
        let sem = Semaphore::new(0);
        assert!(sem.acquire_timeout(Duration::from_millis(10)).unwrap_err().is_timeout());
        assert_eq!(sem.available(), 0);
        sem.release().unwrap();
        sem.acquire_timeout(Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_permit_guard() {
        let sem = Semaphore::bounded(1);
        {
            let _p = sem.permit();
            assert!(sem.try_permit().is_none());
        }
        assert_eq!(sem.available(), 1);
    }
}
