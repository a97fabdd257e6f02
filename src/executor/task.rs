//! Task representation and execution.

use super::panic_handler::PanicHandler;
use crate::error::{Error, TaskError};
use crate::future::{CancelToken, Future, Interrupted};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Global task ID counter
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a task, stable across the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a running task can see about itself.
#[derive(Debug, Clone)]
pub struct TaskContext {
    id: TaskId,
    token: CancelToken,
    worker: Option<usize>,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, token: CancelToken, worker: Option<usize>) -> Self {
        Self { id, token, worker }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Index of the thread or process slot running the task.
    pub fn worker(&self) -> Option<usize> {
        self.worker
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Bail out with `?` once the task has been interrupted.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        self.token.checkpoint()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }
}

/// How one trip through a worker ended, for the metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    /// Cancelled while queued; the callable never ran.
    Skipped,
    Fulfilled,
    Failed,
    Panicked,
}

type RunFn = Box<dyn FnOnce(&PanicHandler, usize) -> TaskOutcome + Send>;

/// A queued unit of work bound to the future it completes.
pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) spawn_time: Instant,
    run: RunFn,
    cancel: Box<dyn FnOnce() -> bool + Send>,
}

impl Task {
    pub(crate) fn bind<T, F>(future: &Future<T>, f: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T, TaskError> + Send + 'static,
    {
        let runner = future.clone();
        let canceller = future.clone();
        Task {
            id: future.id(),
            spawn_time: Instant::now(),
            run: Box::new(move |handler, worker| run_bound(&runner, f, handler, worker)),
            cancel: Box::new(move || canceller.cancel()),
        }
    }

    pub(crate) fn execute(self, handler: &PanicHandler, worker: usize) -> TaskOutcome {
        (self.run)(handler, worker)
    }

    /// Cancel the bound future without running it.
    pub(crate) fn cancel(self) -> bool {
        (self.cancel)()
    }
}

fn run_bound<T, F>(future: &Future<T>, f: F, handler: &PanicHandler, worker: usize) -> TaskOutcome
where
    F: FnOnce(&TaskContext) -> Result<T, TaskError>,
{
    match future.set_running() {
        Ok(true) => {}
        Ok(false) => return TaskOutcome::Skipped,
        Err(e) => {
            tracing::error!(task = %future.id(), error = %e, "task dequeued twice");
            return TaskOutcome::Skipped;
        }
    }

    let ctx = TaskContext::new(future.id(), future.cancel_token(), Some(worker));
    let (completion, outcome) = match handler.execute(|| f(&ctx)) {
        Ok(Ok(value)) => (future.set_result(value), TaskOutcome::Fulfilled),
        Ok(Err(e)) => (future.set_exception(Error::Task(e)), TaskOutcome::Failed),
        Err(panic) => (
            future.set_exception(Error::Task(panic.into())),
            TaskOutcome::Panicked,
        ),
    };
    if let Err(e) = completion {
        tracing::error!(task = %future.id(), error = %e, "could not record task outcome");
    }
    outcome
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("spawn_time", &self.spawn_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureState;

    #[test]
    fn test_bound_task_fulfils_future() {
        let fut = Future::new();
        let task = Task::bind(&fut, |ctx| Ok(ctx.worker().unwrap_or(99) * 2));
        assert_eq!(task.execute(&PanicHandler::default(), 3), TaskOutcome::Fulfilled);
        assert_eq!(fut.result(None).unwrap(), 6);
    }

    #[test]
    fn test_cancelled_task_is_skipped() {
        let fut: Future<u8> = Future::new();
        let task = Task::bind(&fut, |_| Ok(1));
        assert!(fut.cancel());
        assert_eq!(task.execute(&PanicHandler::default(), 0), TaskOutcome::Skipped);
        assert_eq!(fut.state(), FutureState::Cancelled);
    }

    #[test]
    fn test_panic_fails_future() {
        let fut: Future<u8> = Future::new();
        let task = Task::bind(&fut, |_| panic!("kaboom"));
        assert_eq!(task.execute(&PanicHandler::default(), 0), TaskOutcome::Panicked);
        let err = fut.result(None).unwrap_err();
        assert!(err.task_error().unwrap().is_panic());
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }
}
