//! Result handles for submitted tasks.
//!
//! A [`Future`] moves through `Pending -> Running -> Fulfilled | Failed`,
//! or `Pending -> Cancelled`. Terminal states never change again. Every
//! clone of a future observes the same state.

mod cancel;
mod wait;

pub use cancel::{CancelToken, Interrupted};
pub use wait::{as_completed, wait, AsCompleted, ReturnWhen, WaitOutcome};

use crate::error::{Error, Result};
use crate::executor::task::TaskId;
use crate::executor::panic_handler::panic_message;
use crate::sync::{Condvar, Mutex, MutexGuard};
use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureState {
    Pending,
    Running,
    Fulfilled,
    Failed,
    Cancelled,
}

impl FutureState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FutureState::Fulfilled | FutureState::Failed | FutureState::Cancelled
        )
    }
}

type Callback<T> = Box<dyn FnOnce(&Future<T>) + Send>;

struct Inner<T> {
    state: FutureState,
    value: Option<T>,
    error: Option<Error>,
    callbacks: Vec<Callback<T>>,
}

struct Shared<T> {
    id: TaskId,
    inner: Mutex<Inner<T>>,
    done: Condvar,
    token: CancelToken,
    affinity: Option<PoolAffinity>,
}

/// Handle to the eventual outcome of one task.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Future<T> {
    /// A detached pending future, completed by whoever holds a clone.
    pub fn new() -> Self {
        Self::build(TaskId::next(), None)
    }

    pub(crate) fn with_affinity(affinity: PoolAffinity) -> Self {
        Self::build(TaskId::next(), Some(affinity))
    }

    fn build(id: TaskId, affinity: Option<PoolAffinity>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                inner: Mutex::new(Inner {
                    state: FutureState::Pending,
                    value: None,
                    error: None,
                    callbacks: Vec::new(),
                }),
                done: Condvar::new(),
                token: CancelToken::new(),
                affinity,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn state(&self) -> FutureState {
        self.shared.inner.lock().state
    }

    pub fn done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn running(&self) -> bool {
        self.state() == FutureState::Running
    }

    pub fn cancelled(&self) -> bool {
        self.state() == FutureState::Cancelled
    }

    /// The token the running task polls for interruption.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.token.clone()
    }

    /// Cancel a task that has not started. Returns false once it is
    /// running or finished; use [`interrupt`](Future::interrupt) for a
    /// running task.
    pub fn cancel(&self) -> bool {
        let callbacks = {
            let mut inner = self.shared.inner.lock();
            if inner.state != FutureState::Pending {
                return false;
            }
            inner.state = FutureState::Cancelled;
            std::mem::take(&mut inner.callbacks)
        };
        self.shared.token.cancel();
        self.shared.done.notify_all();
        self.run_callbacks(callbacks);
        true
    }

    /// Ask a running task to stop at its next checkpoint. The future then
    /// completes however the task chooses to return.
    pub fn interrupt(&self) -> bool {
        let running = self.state() == FutureState::Running;
        if running {
            self.shared.token.cancel();
        }
        running
    }

    /// Claim the future for execution. `Ok(false)` means it was cancelled
    /// while queued and must be skipped.
    pub fn set_running(&self) -> Result<bool> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            FutureState::Pending => {
                inner.state = FutureState::Running;
                Ok(true)
            }
            FutureState::Cancelled => Ok(false),
            other => Err(Error::state_violation(format!(
                "task {} cannot start from {:?}",
                self.shared.id, other
            ))),
        }
    }

    pub fn set_result(&self, value: T) -> Result<()> {
        self.complete(Ok(value))
    }

    pub fn set_exception(&self, error: Error) -> Result<()> {
        self.complete(Err(error))
    }

    fn complete(&self, outcome: Result<T>) -> Result<()> {
        let callbacks = {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_terminal() {
                return Err(Error::state_violation(format!(
                    "task {} already {:?}",
                    self.shared.id, inner.state
                )));
            }
            match outcome {
                Ok(value) => {
                    inner.value = Some(value);
                    inner.state = FutureState::Fulfilled;
                }
                Err(error) => {
                    inner.error = Some(error);
                    inner.state = FutureState::Failed;
                }
            }
            std::mem::take(&mut inner.callbacks)
        };
        self.shared.done.notify_all();
        self.run_callbacks(callbacks);
        Ok(())
    }

    /// Block until the future is terminal.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.wait_terminal(timeout).map(drop)
    }

    /// Block for the value. A failed task yields its error, a cancelled one
    /// [`Error::Cancelled`], an expired wait [`Error::Timeout`].
    pub fn result(&self, timeout: Option<Duration>) -> Result<T>
    where
        T: Clone,
    {
        let inner = self.wait_terminal(timeout)?;
        match inner.state {
            FutureState::Fulfilled => inner
                .value
                .clone()
                .ok_or_else(|| Error::state_violation("result was already taken")),
            _ => Err(Self::failure(&inner)),
        }
    }

    /// Move the value out instead of cloning it. Later reads of the value
    /// fail with [`Error::StateViolation`].
    pub(crate) fn take_result(&self, timeout: Option<Duration>) -> Result<T> {
        let mut inner = self.wait_terminal(timeout)?;
        match inner.state {
            FutureState::Fulfilled => inner
                .value
                .take()
                .ok_or_else(|| Error::state_violation("result was already taken")),
            _ => Err(Self::failure(&inner)),
        }
    }

    /// The task's error, or `None` if it succeeded.
    pub fn exception(&self, timeout: Option<Duration>) -> Result<Option<Error>> {
        let inner = self.wait_terminal(timeout)?;
        match inner.state {
            FutureState::Fulfilled => Ok(None),
            FutureState::Cancelled => Err(Error::Cancelled),
            _ => Ok(inner.error.clone()),
        }
    }

    /// Run `callback` exactly once after completion, on the completing
    /// thread, or immediately if the future is already terminal. A
    /// panicking callback is logged and does not affect the future.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Future<T>) + Send + 'static,
    {
        let mut inner = self.shared.inner.lock();
        if !inner.state.is_terminal() {
            inner.callbacks.push(Box::new(callback));
            return;
        }
        drop(inner);
        self.invoke(Box::new(callback));
    }

    fn failure(inner: &Inner<T>) -> Error {
        match inner.state {
            FutureState::Cancelled => Error::Cancelled,
            _ => inner
                .error
                .clone()
                .unwrap_or_else(|| Error::state_violation("future is not terminal")),
        }
    }

    fn wait_terminal(&self, timeout: Option<Duration>) -> Result<MutexGuard<'_, Inner<T>>> {
        let mut inner = self.shared.inner.lock();
        if inner.state.is_terminal() {
            return Ok(inner);
        }
        let _blocked = match &self.shared.affinity {
            Some(affinity) => affinity.enter_wait()?,
            None => None,
        };
        match timeout {
            None => self
                .shared
                .done
                .wait_while(&mut inner, |i| !i.state.is_terminal()),
            Some(timeout) => {
                self.shared
                    .done
                    .wait_while_timeout(&mut inner, timeout, |i| !i.state.is_terminal())?
            }
        }
        Ok(inner)
    }

    fn run_callbacks(&self, callbacks: Vec<Callback<T>>) {
        for callback in callbacks {
            self.invoke(callback);
        }
    }

    fn invoke(&self, callback: Callback<T>) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(self))) {
            tracing::error!(
                task = %self.shared.id,
                panic = %panic_message(payload.as_ref()),
                "done callback panicked"
            );
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

thread_local! {
    static CURRENT_POOL: Cell<u64> = Cell::new(0);
}

/// Mark the calling thread as a worker of pool `pool`.
pub(crate) fn enter_pool(pool: u64) {
    CURRENT_POOL.with(|c| c.set(pool));
}

pub(crate) fn current_pool() -> u64 {
    CURRENT_POOL.with(|c| c.get())
}

/// Ties futures to the pool that runs them, so a worker waiting on work
/// queued behind itself can be refused instead of hanging forever.
#[derive(Clone, Debug)]
pub(crate) struct PoolAffinity {
    pool: u64,
    workers: usize,
    blocked: Arc<AtomicUsize>,
}

impl PoolAffinity {
    pub(crate) fn new(pool: u64, workers: usize) -> Self {
        Self {
            pool,
            workers,
            blocked: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of this pool's workers currently parked on one of its futures.
    pub(crate) fn blocked(&self) -> usize {
        self.blocked.load(Ordering::Acquire)
    }

    fn enter_wait(&self) -> Result<Option<BlockedWorker>> {
        if current_pool() != self.pool {
            return Ok(None);
        }
        let now_blocked = self.blocked.fetch_add(1, Ordering::AcqRel) + 1;
        if now_blocked >= self.workers {
            self.blocked.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::WouldDeadlock(format!(
                "all {} workers would be waiting on tasks queued behind them",
                self.workers
            )));
        }
        Ok(Some(BlockedWorker {
            blocked: self.blocked.clone(),
        }))
    }
}

struct BlockedWorker {
    blocked: Arc<AtomicUsize>,
}

impl Drop for BlockedWorker {
    fn drop(&mut self) {
        self.blocked.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_result_after_set() {
        let fut = Future::new();
        assert_eq!(fut.state(), FutureState::Pending);
        assert!(fut.set_running().unwrap());
        fut.set_result(7).unwrap();
        assert_eq!(fut.result(None).unwrap(), 7);
        assert!(fut.exception(None).unwrap().is_none());
    }

    #[test]
    fn test_result_blocks_until_completed() {
        let fut: Future<&str> = Future::new();
        let setter = {
            let fut = fut.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                fut.set_result("late").unwrap();
            })
        };
        assert_eq!(fut.result(None).unwrap(), "late");
        setter.join().unwrap();
    }

    #[test]
    fn test_result_timeout_leaves_future_pending() {
        let fut: Future<u8> = Future::new();
        let err = fut.result(Some(Duration::from_millis(10))).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(fut.state(), FutureState::Pending);
    }

    #[test]
    fn test_second_completion_rejected() {
        let fut = Future::new();
        fut.set_result(1).unwrap();
        assert!(matches!(fut.set_result(2), Err(Error::StateViolation(_))));
        assert!(matches!(
            fut.set_exception(Error::Timeout),
            Err(Error::StateViolation(_))
        ));
        assert_eq!(fut.result(None).unwrap(), 1);
    }

    #[test]
    fn test_cancel_only_while_pending() {
        let fut: Future<u8> = Future::new();
        assert!(fut.cancel());
        assert!(fut.cancelled());
        assert!(!fut.set_running().unwrap());
        assert!(matches!(fut.result(None), Err(Error::Cancelled)));
        assert!(fut.cancel_token().is_cancelled());

        let running: Future<u8> = Future::new();
        running.set_running().unwrap();
        assert!(!running.cancel());
        assert!(running.interrupt());
        assert!(running.cancel_token().is_cancelled());
    }

    #[test]
    fn test_exception_reports_failure() {
        let fut: Future<u8> = Future::new();
        fut.set_exception(Error::submission("boom")).unwrap();
        let err = fut.exception(None).unwrap().unwrap();
        assert!(matches!(err, Error::Submission(_)));
        assert!(fut.result(None).is_err());
    }

    #[test]
    fn test_done_callback_runs_once() {
        let fut = Future::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let tx2 = tx.clone();
        fut.add_done_callback(move |f: &Future<u8>| tx.send(f.state()).unwrap());
        fut.set_result(1).unwrap();
        fut.add_done_callback(move |f: &Future<u8>| tx2.send(f.state()).unwrap());

        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let fut = Future::new();
        fut.add_done_callback(|_: &Future<u8>| panic!("callback failure"));
        fut.set_result(3).unwrap();
        assert_eq!(fut.result(None).unwrap(), 3);
    }

    #[test]
    fn test_take_result_moves_value() {
        let fut = Future::new();
        fut.set_result(vec![1, 2]).unwrap();
        assert_eq!(fut.take_result(None).unwrap(), vec![1, 2]);
        assert!(matches!(fut.take_result(None), Err(Error::StateViolation(_))));
    }

    #[test]
    fn test_affinity_refuses_last_worker() {
        let affinity = PoolAffinity::new(9_999, 1);
        let fut: Future<u8> = Future::with_affinity(affinity.clone());

        // not a worker of that pool: plain timeout
        assert!(fut.wait(Some(Duration::from_millis(5))).unwrap_err().is_timeout());

        let worker = thread::spawn(move || {
            enter_pool(9_999);
            fut.wait(None)
        });
        assert!(matches!(worker.join().unwrap(), Err(Error::WouldDeadlock(_))));
        assert_eq!(affinity.blocked(), 0);
    }
}
