use crate::error::TaskError;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

/// What a worker does after a task panics. Either way the panic is turned
/// into a failed future and the worker keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicStrategy {
    /// Capture silently.
    Isolate,
    /// Capture and log a warning.
    #[default]
    LogAndContinue,
}

impl std::str::FromStr for PanicStrategy {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "isolate" => Ok(PanicStrategy::Isolate),
            "log" | "log-and-continue" => Ok(PanicStrategy::LogAndContinue),
            other => Err(crate::error::Error::config(format!(
                "unknown panic strategy `{}`",
                other
            ))),
        }
    }
}

#[derive(Debug)]
pub struct PanicHandler {
    strategy: PanicStrategy,
    panic_count: AtomicUsize,
}

impl PanicHandler {
    pub fn new(strategy: PanicStrategy) -> Self {
        Self {
            strategy,
            panic_count: AtomicUsize::new(0),
        }
    }

    pub fn execute<F, R>(&self, f: F) -> Result<R, PanicInfo>
    where
        F: FnOnce() -> R,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => Ok(result),
            Err(payload) => {
                self.panic_count.fetch_add(1, Ordering::Relaxed);
                let info = PanicInfo::from_payload(payload.as_ref());
                if self.strategy == PanicStrategy::LogAndContinue {
                    tracing::warn!(message = %info.message, "task panicked");
                }
                Err(info)
            }
        }
    }

    pub fn panic_count(&self) -> usize {
        self.panic_count.load(Ordering::Relaxed)
    }

    pub fn strategy(&self) -> PanicStrategy {
        self.strategy
    }
}

impl Default for PanicHandler {
    fn default() -> Self {
        Self::new(PanicStrategy::default())
    }
}

#[derive(Debug, Clone)]
pub struct PanicInfo {
    pub message: String,
}

impl PanicInfo {
    fn from_payload(payload: &(dyn Any + Send)) -> Self {
        Self {
            message: panic_message(payload),
        }
    }
}

impl From<PanicInfo> for TaskError {
    fn from(info: PanicInfo) -> Self {
        TaskError::panic(info.message)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_handler_isolate() {
        let handler = PanicHandler::new(PanicStrategy::Isolate);
        let result = handler.execute(|| -> u8 { panic!("test panic") });
        let info = result.unwrap_err();
        assert_eq!(info.message, "test panic");
        assert_eq!(handler.panic_count(), 1);
    }

    #[test]
    fn test_panic_handler_success() {
        let handler = PanicHandler::default();
        assert_eq!(handler.execute(|| 42).unwrap(), 42);
        assert_eq!(handler.panic_count(), 0);
    }

    #[test]
    fn test_formatted_panic_becomes_task_error() {
        let handler = PanicHandler::new(PanicStrategy::Isolate);
        let info = handler
            .execute(|| -> () { panic!("index {} out of range", 4) })
            .unwrap_err();
        let err = TaskError::from(info);
        assert!(err.is_panic());
        assert_eq!(err.message, "index 4 out of range");
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("isolate".parse::<PanicStrategy>().unwrap(), PanicStrategy::Isolate);
        assert!("abort".parse::<PanicStrategy>().is_err());
    }
}
