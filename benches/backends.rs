//! CPU-bound throughput of the shared and isolated backends.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use taskforge::prelude::*;
use taskforge::{builtins, StartMethod, WorkerCommand};

const TASKS: u64 = 8;

fn executor(backend: BackendKind, workers: usize) -> Executor {
    // this bench binary has no `worker` subcommand
    let worker = WorkerCommand::new(env!("CARGO_BIN_EXE_taskforge")).arg("worker");
    let config = Config::builder()
        .workers(workers)
        .backend(backend)
        .start_method(StartMethod::Spawn(worker))
        .build()
        .unwrap();
    Executor::new(config, builtins::registry()).unwrap()
}

fn bench_fib(c: &mut Criterion) {
    let workers = num_cpus::get().clamp(2, 8);
    let mut group = c.benchmark_group("fib_25_x8");
    group.sample_size(10);

    group.bench_function("sequential", |b| {
        b.iter(|| (0..TASKS).map(|_| builtins::fib(black_box(25))).sum::<u64>())
    });

    for backend in [BackendKind::Shared, BackendKind::Isolated] {
        let executor = executor(backend, workers);
        group.bench_with_input(BenchmarkId::new(backend.to_string(), workers), &executor, |b, ex| {
            b.iter(|| {
                let futures: Vec<Future<u64>> = (0..TASKS)
                    .map(|_| ex.submit("fib", black_box(25u64)).unwrap())
                    .collect();
                futures.into_iter().map(|f| f.result(None).unwrap()).sum::<u64>()
            })
        });
        executor.shutdown(ShutdownOptions::default());
    }

    group.finish();
}

fn bench_map_chunking(c: &mut Criterion) {
    let executor = executor(BackendKind::Isolated, 2);
    let mut group = c.benchmark_group("isolated_map_count_down_256");
    group.sample_size(10);

    for chunk_size in [1usize, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk_size), &chunk_size, |b, &chunk| {
            b.iter(|| {
                executor
                    .map::<u64, u64, _>("count_down", 0..256, chunk)
                    .unwrap()
                    .count()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fib, bench_map_chunking);
criterion_main!(benches);
