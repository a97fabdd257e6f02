//! Blocking synchronization primitives.
//!
//! Thin, explicit layers over `parking_lot` that add what the executor
//! needs on top: owner tracking (so re-entry is caught instead of hanging),
//! timeouts that report [`Error::Timeout`](crate::Error::Timeout), and a
//! bounded semaphore that refuses to be over-released.
//!
//! Every timed operation either completes fully or leaves the primitive
//! exactly as it was, so a timed-out caller can simply retry.

pub mod condvar;
pub mod event;
pub mod mutex;
pub mod reentrant;
pub mod semaphore;

pub use condvar::Condvar;
pub use event::Event;
pub use mutex::{Mutex, MutexGuard};
pub use reentrant::{ReentrantMutex, ReentrantMutexGuard};
pub use semaphore::{Semaphore, SemaphorePermit};

use std::sync::atomic::{AtomicU64, Ordering};

/// Token identifying the calling thread. Zero is never handed out and means
/// "no owner".
pub(crate) fn current_thread_token() -> u64 {
    static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

    thread_local! {
        static TOKEN: u64 = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    }

    TOKEN.with(|t| *t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_tokens_are_distinct() {
        let here = current_thread_token();
        assert_eq!(here, current_thread_token());

        let there = std::thread::spawn(current_thread_token).join().unwrap();
        assert_ne!(here, there);
        assert_ne!(there, 0);
    }
}
