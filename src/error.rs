use serde::{Deserialize, Serialize};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between submitting a task and reading its
/// result.
///
/// `Error` is `Clone` because a failed [`Future`](crate::Future) hands the
/// same error to every reader.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("submission rejected: {0}")]
    Submission(String),

    #[error("executor is shut down")]
    ShutDown,

    #[error("task queue is full")]
    QueueFull,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("task failed: {0}")]
    Task(#[from] TaskError),

    #[error("task was cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("worker {slot} lost: {reason}")]
    WorkerLost { slot: usize, reason: String },

    #[error("state violation: {0}")]
    StateViolation(String),

    #[error("waiting here would deadlock the pool: {0}")]
    WouldDeadlock(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("worker launch failed: {0}")]
    Launch(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    pub fn submission<S: Into<String>>(msg: S) -> Self {
        Error::Submission(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn state_violation<S: Into<String>>(msg: S) -> Self {
        Error::StateViolation(msg.into())
    }

    pub fn launch<S: Into<String>>(msg: S) -> Self {
        Error::Launch(msg.into())
    }

    pub fn worker_lost<S: Into<String>>(slot: usize, reason: S) -> Self {
        Error::WorkerLost {
            slot,
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_worker_lost(&self) -> bool {
        matches!(self, Error::WorkerLost { .. })
    }

    /// The callable's own failure, if this is one.
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            Error::Task(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => {
                Error::ChannelClosed
            }
            _ => Error::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// A failure raised by a task's callable, in a form that survives being
/// sent across a process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Type name of the original error, or `"panic"`.
    pub kind: String,
    pub message: String,
    /// Rendered backtrace, when `RUST_BACKTRACE` enabled capturing one.
    pub traceback: Option<String>,
}

impl TaskError {
    pub fn new<K: Into<String>, M: Into<String>>(kind: K, message: M) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: None,
        }
    }

    /// Capture any displayable error, recording its type name and a
    /// backtrace of the conversion point.
    pub fn from_display<E: fmt::Display>(err: E) -> Self {
        let backtrace = Backtrace::capture();
        let traceback = match backtrace.status() {
            BacktraceStatus::Captured => Some(backtrace.to_string()),
            _ => None,
        };
        Self {
            kind: short_type_name::<E>().to_string(),
            message: err.to_string(),
            traceback,
        }
    }

    pub fn panic<M: Into<String>>(message: M) -> Self {
        Self::new("panic", message)
    }

    pub fn is_panic(&self) -> bool {
        self.kind == "panic"
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

// `core::num::ParseIntError` -> `ParseIntError`, keeping generics intact
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
