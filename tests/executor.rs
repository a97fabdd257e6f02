use serde_json::{json, Value};
use std::time::Duration;
use taskforge::prelude::*;
use taskforge::{builtins, StartMethod, WorkerCommand};

fn executor(backend: BackendKind, workers: usize) -> Executor {
    let config = Config::builder()
        .workers(workers)
        .backend(backend)
        .start_method(StartMethod::Spawn(
            WorkerCommand::new(env!("CARGO_BIN_EXE_taskforge")).arg("worker"),
        ))
        .build()
        .unwrap();
    Executor::new(config, builtins::registry()).unwrap()
}

#[test]
fn test_backends_agree() {
    for backend in [BackendKind::Shared, BackendKind::Isolated] {
        let ex = executor(backend, 2);
        assert_eq!(ex.backend(), backend);

        let fib: Future<u64> = ex.submit("fib", 25u64).unwrap();
        assert_eq!(fib.result(None).unwrap(), 75025, "{}", backend);

        let echoed: Future<Value> = ex.submit("echo", json!({"k": [true]})).unwrap();
        assert_eq!(echoed.result(None).unwrap(), json!({"k": [true]}));

        let failed: Future<()> = ex.submit("fail", "bad".to_string()).unwrap();
        assert_eq!(failed.result(None).unwrap_err().task_error().unwrap().message, "bad");

        let squares: Vec<u64> = ex
            .map::<u64, u64, _>("count_down", vec![3, 1, 2], 2)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(squares, vec![3, 1, 2]);

        ex.shutdown(ShutdownOptions::default());
        let snapshot = ex.metrics();
        assert_eq!(snapshot.tasks_submitted, 5);
        assert_eq!(snapshot.tasks_completed, 4);
        assert_eq!(snapshot.tasks_failed, 1);
    }
}

#[test]
fn test_crash_refused_on_shared_backend() {
    let ex = executor(BackendKind::Shared, 1);
    let fut: Future<()> = ex.submit("crash", 3).unwrap();
    let err = fut.result(None).unwrap_err();
    assert!(err.task_error().unwrap().message.contains("isolated worker"));
}

#[test]
fn test_tasks_may_spawn_without_waiting() {
    let ex = std::sync::Arc::new(executor(BackendKind::Shared, 1));
    let inner_ex = ex.clone();
    let outer = ex
        .spawn(move || inner_ex.submit::<u64, u64>("fib", 10).unwrap())
        .unwrap();
    let inner = outer.result(None).unwrap();
    assert_eq!(inner.result(Some(Duration::from_secs(5))).unwrap(), 55);
}

#[test]
fn test_waiting_on_own_pool_is_refused_when_it_would_hang() {
    let ex = std::sync::Arc::new(executor(BackendKind::Shared, 1));
    let inner_ex = ex.clone();
    let outer = ex
        .spawn(move || {
            let inner: Future<u64> = inner_ex.submit("fib", 10u64).unwrap();
            inner.result(None)
        })
        .unwrap();
    let inner_result = outer.result(Some(Duration::from_secs(5))).unwrap();
    assert!(matches!(inner_result, Err(Error::WouldDeadlock(_))));
}

#[test]
fn test_shutdown_no_wait_returns_immediately() {
    let ex = executor(BackendKind::Shared, 1);
    let running: Future<u64> = ex.submit("sleep", 200u64).unwrap();
    let start = std::time::Instant::now();
    ex.shutdown(ShutdownOptions::no_wait());
    assert!(start.elapsed() < Duration::from_millis(150));
    assert!(ex.is_shutdown());
    assert_eq!(running.result(None).unwrap(), 200);
}
