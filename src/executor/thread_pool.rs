use super::panic_handler::PanicHandler;
use super::task::{Task, TaskContext};
use super::worker::{Worker, WorkerId, WorkerState};
use super::{Admission, ShutdownOptions};
use crate::config::Config;
use crate::error::{Error, Result, TaskError};
use crate::future::{current_pool, Future, PoolAffinity};
use crate::queue::BoundedQueue;
use crate::telemetry::Metrics;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

static POOL_IDS: AtomicU64 = AtomicU64::new(1);

/// Fixed set of worker threads fed from one FIFO queue.
///
/// Tasks share the host's memory, so closures can be submitted directly and
/// nothing is serialized. Rust has no interpreter lock: CPU-bound tasks run
/// in parallel here too, up to the worker count.
pub struct ThreadPool {
    id: u64,
    workers: Mutex<Vec<WorkerHandle>>,
    queue: Arc<BoundedQueue<Task>>,
    accepting: AtomicBool,
    idle: Arc<AtomicUsize>,
    affinity: PoolAffinity,
    num_workers: usize,
    pub(crate) metrics: Arc<Metrics>,
}

struct WorkerHandle {
    id: WorkerId,
    thread: Option<JoinHandle<()>>,
    state: Arc<WorkerState>,
}

impl ThreadPool {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_metrics(config, Arc::new(Metrics::new()))
    }

    pub(crate) fn with_metrics(config: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        config.validate()?;
        let num_workers = config.worker_count();
        if num_workers == 0 {
            return Err(Error::config("need at least 1 worker"));
        }

        let id = POOL_IDS.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(BoundedQueue::with_capacity(config.queue_capacity));
        let idle = Arc::new(AtomicUsize::new(0));
        let panic_handler = Arc::new(PanicHandler::new(config.panic_strategy));

        let pool = Self {
            id,
            workers: Mutex::new(Vec::with_capacity(num_workers)),
            queue,
            accepting: AtomicBool::new(true),
            idle,
            affinity: PoolAffinity::new(id, num_workers),
            num_workers,
            metrics,
        };

        for worker_id in 0..num_workers {
            let state = Arc::new(WorkerState::default());
            let worker = Worker {
                id: worker_id,
                pool: id,
                queue: pool.queue.clone(),
                idle: pool.idle.clone(),
                panic_handler: panic_handler.clone(),
                metrics: pool.metrics.clone(),
                state: state.clone(),
            };

            let mut builder =
                thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, worker_id));
            if let Some(stack_size) = config.stack_size {
                builder = builder.stack_size(stack_size);
            }

            // on failure, dropping `pool` stops the workers already started
            let thread = builder
                .spawn(move || worker.run())
                .map_err(|e| Error::launch(format!("spawn failed: {}", e)))?;

            pool.workers.lock().push(WorkerHandle {
                id: worker_id,
                thread: Some(thread),
                state,
            });
        }

        tracing::debug!(pool = id, workers = num_workers, "thread pool started");
        Ok(pool)
    }

    /// Run a closure on a worker.
    pub fn spawn<F, T>(&self, f: F) -> Result<Future<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with_context(move |_| Ok::<T, Infallible>(f()))
    }

    /// Run a fallible closure that can poll for interruption. Its `Err`
    /// fails the future.
    pub fn spawn_with_context<F, T, E>(&self, f: F) -> Result<Future<T>>
    where
        F: FnOnce(&TaskContext) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display,
    {
        self.submit_task(move |ctx| f(ctx).map_err(TaskError::from_display), Admission::Block)
    }

    /// [`spawn`](ThreadPool::spawn) that fails with [`Error::QueueFull`]
    /// instead of blocking on a bounded queue.
    pub fn spawn_nowait<F, T>(&self, f: F) -> Result<Future<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.submit_task(move |_| Ok(f()), Admission::NoWait)
    }

    pub(crate) fn submit_task<F, T>(&self, f: F, admission: Admission) -> Result<Future<T>>
    where
        F: FnOnce(&TaskContext) -> std::result::Result<T, TaskError> + Send + 'static,
        T: Send + 'static,
    {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }

        let future = Future::with_affinity(self.affinity.clone());
        let task = Task::bind(&future, f);
        match admission {
            Admission::Block => self.queue.put(task)?,
            Admission::NoWait => self.queue.try_put(task)?,
        }
        self.metrics.record_submitted();
        Ok(future)
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Workers parked waiting for work.
    pub fn idle_workers(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Tasks queued but not yet picked up.
    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Tasks each worker has run so far, by worker index.
    pub fn tasks_per_worker(&self) -> Vec<u64> {
        self.workers
            .lock()
            .iter()
            .map(|w| w.state.tasks_executed.load(Ordering::Relaxed))
            .collect()
    }

    pub fn is_shutdown(&self) -> bool {
        !self.accepting.load(Ordering::Acquire)
    }

    /// Block until every task submitted so far has run, or `timeout` expires.
    pub fn join(&self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            Some(t) => self.queue.join_timeout(t),
            None => {
                self.queue.join();
                Ok(())
            }
        }
    }

    /// Stop accepting work. Idempotent.
    ///
    /// With `cancel_pending`, queued tasks are cancelled; otherwise they
    /// still run. With `wait`, returns after every worker has exited.
    pub fn shutdown(&self, options: ShutdownOptions) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            tracing::debug!(pool = self.id, ?options, "thread pool shutting down");
        }

        if options.cancel_pending {
            let mut cancelled = 0;
            for task in self.queue.drain() {
                if task.cancel() {
                    cancelled += 1;
                    self.metrics.record_cancelled();
                }
            }
            if cancelled > 0 {
                tracing::debug!(pool = self.id, cancelled, "cancelled queued tasks");
            }
        }

        self.queue.close();

        if !options.wait {
            return;
        }
        if current_pool() == self.id {
            // a worker cannot join itself
            tracing::warn!(pool = self.id, "shutdown(wait) from a worker; not joining");
            return;
        }
        for worker in self.workers.lock().iter_mut() {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    tracing::error!(pool = self.id, worker = worker.id, "worker thread panicked");
                }
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown(ShutdownOptions::default());
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.id)
            .field("workers", &self.num_workers)
            .field("pending", &self.pending_tasks())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
