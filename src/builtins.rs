//! Tasks shipped with the `taskforge` binary.
//!
//! The binary registers these in both roles, as host and as isolated
//! worker, so any of them can be run on either backend from the command
//! line.

use crate::executor::task::TaskContext;
use crate::future::Interrupted;
use crate::isolated::is_worker_process;
use crate::registry::Registry;
use serde_json::Value;
use std::hint::black_box;
use std::time::{Duration, Instant};

// how often `sleep` wakes up to check for cancellation
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Failure raised on purpose by the `fail` and `crash` tasks.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TaskFailure(pub String);

/// A registry holding every built-in task.
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register("echo", echo)
        .register_with_context("sleep", sleep)
        .register_with_context("spin", spin)
        .register("fib", fib)
        .register("count_down", count_down)
        .register_fallible("fail", fail)
        .register_fallible("crash", crash);
    registry
}

/// One-line descriptions for `taskforge tasks`, sorted by name.
pub fn describe() -> Vec<(&'static str, &'static str)> {
    vec![
        ("count_down", "n: u64 - decrement a counter n times, returns n"),
        ("crash", "code: i32 - exit the worker process with `code` (isolated only)"),
        ("echo", "value: any JSON - return the argument unchanged"),
        ("fail", "message: string - fail with `message`"),
        ("fib", "n: u64 - naive recursive Fibonacci number"),
        ("sleep", "ms: u64 - sleep, waking every 10ms to honour cancellation"),
        ("spin", "ms: u64 - busy-loop for ms milliseconds, returns iterations"),
    ]
}

pub fn echo(value: Value) -> Value {
    value
}

pub fn sleep(ctx: &TaskContext, ms: u64) -> Result<u64, Interrupted> {
    let deadline = Instant::now() + Duration::from_millis(ms);
    loop {
        ctx.checkpoint()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(ms);
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

pub fn spin(ctx: &TaskContext, ms: u64) -> Result<u64, Interrupted> {
    let deadline = Instant::now() + Duration::from_millis(ms);
    let mut iterations = 0u64;
    while Instant::now() < deadline {
        if iterations % 1024 == 0 {
            ctx.checkpoint()?;
        }
        iterations = black_box(iterations + 1);
    }
    Ok(iterations)
}

pub fn fib(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fib(n - 1) + fib(n - 2)
    }
}

pub fn count_down(n: u64) -> u64 {
    let mut remaining = n;
    while remaining > 0 {
        remaining = black_box(remaining - 1);
    }
    n
}

pub fn fail(message: String) -> Result<(), TaskFailure> {
    Err(TaskFailure(message))
}

/// Exit the current process. Refuses to run outside an isolated worker,
/// where it would take the host down with it.
pub fn crash(code: i32) -> Result<(), TaskFailure> {
    if !is_worker_process() {
        return Err(TaskFailure(
            "crash only runs inside an isolated worker".to_string(),
        ));
    }
    tracing::warn!(code, "crashing worker on request");
    std::process::exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::task::TaskId;
    use crate::future::CancelToken;
    use serde_json::json;

    fn ctx() -> TaskContext {
        TaskContext::new(TaskId::next(), CancelToken::new(), None)
    }

    #[test]
    fn test_registry_has_every_described_task() {
        let registry = registry();
        let described: Vec<&str> = describe().into_iter().map(|(name, _)| name).collect();
        assert_eq!(registry.names(), described);
    }

    #[test]
    fn test_fib() {
        assert_eq!(fib(0), 0);
        assert_eq!(fib(1), 1);
        assert_eq!(fib(20), 6765);
    }

    #[test]
    fn test_call_by_value() {
        let registry = registry();
        let ctx = ctx();
        assert_eq!(registry.call_value(&ctx, "fib", json!(10)).unwrap(), json!(55));
        assert_eq!(
            registry.call_value(&ctx, "echo", json!({"a": [1, 2]})).unwrap(),
            json!({"a": [1, 2]})
        );
        assert_eq!(registry.call_value(&ctx, "count_down", json!(1000)).unwrap(), json!(1000));

        let err = registry.call_value(&ctx, "fail", json!("boom")).unwrap_err();
        assert_eq!(err.kind, "TaskFailure");
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_sleep_stops_when_cancelled() {
        let ctx = ctx();
        let token = ctx.cancel_token().clone();
        let start = Instant::now();
        let handle = std::thread::spawn(move || sleep(&ctx, 5_000));
        std::thread::sleep(Duration::from_millis(30));
        token.cancel();
        assert!(handle.join().unwrap().is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_spin_runs_for_duration() {
        let start = Instant::now();
        let iterations = spin(&ctx(), 20).unwrap();
        assert!(iterations > 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
