//! Task execution: the [`Executor`] facade and the in-process thread pool.
//!
//! The executor hides which backend runs the work. Tasks are submitted by
//! registered name so the same call works on both; closures can be spawned
//! directly on the shared backend only.
//!
//! # Waiting on the pool from inside the pool
//!
//! A task that blocks on another task queued to the same thread pool holds a
//! worker while it waits. If every worker does this, nothing is left to run
//! the tasks they wait for. Such a wait fails with
//! [`Error::WouldDeadlock`] instead of hanging; spawning sub-tasks without
//! blocking on them is always fine.

mod map;
pub mod panic_handler;
pub mod task;
pub mod thread_pool;
pub(crate) mod worker;

pub use map::MapIter;
pub use panic_handler::{PanicHandler, PanicStrategy};
pub use task::{TaskContext, TaskId};
pub use thread_pool::ThreadPool;

use crate::config::{BackendKind, Config};
use crate::error::{Error, Result};
use crate::future::Future;
use crate::isolated::ProcessPool;
use crate::registry::Registry;
use crate::telemetry::{Metrics, MetricsSnapshot};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// How [`Executor::shutdown`] treats outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOptions {
    /// Block until running tasks finish and every worker has exited.
    pub wait: bool,
    /// Cancel tasks still waiting in the queue.
    pub cancel_pending: bool,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            wait: true,
            cancel_pending: false,
        }
    }
}

impl ShutdownOptions {
    pub fn no_wait() -> Self {
        Self {
            wait: false,
            ..Self::default()
        }
    }

    pub fn cancel_pending(mut self, cancel: bool) -> Self {
        self.cancel_pending = cancel;
        self
    }
}

/// Whether a submission may block on a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Block,
    NoWait,
}

enum Backend {
    Shared(ThreadPool),
    Isolated(ProcessPool),
}

/// One submit/map/shutdown API over either backend.
pub struct Executor {
    backend: Backend,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Executor {
    pub fn new(config: Config, registry: Registry) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(registry);
        let metrics = Arc::new(Metrics::new());

        let backend = match config.backend {
            BackendKind::Shared => {
                Backend::Shared(ThreadPool::with_metrics(&config, metrics.clone())?)
            }
            BackendKind::Isolated => Backend::Isolated(ProcessPool::with_metrics(
                &config,
                registry.clone(),
                metrics.clone(),
            )?),
        };

        tracing::info!(
            backend = %config.backend,
            workers = config.worker_count(),
            queue_capacity = ?config.effective_queue_capacity(),
            tasks = registry.len(),
            "executor started"
        );
        Ok(Self {
            backend,
            registry,
            metrics,
        })
    }

    pub fn backend(&self) -> BackendKind {
        match self.backend {
            Backend::Shared(_) => BackendKind::Shared,
            Backend::Isolated(_) => BackendKind::Isolated,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn num_workers(&self) -> usize {
        match &self.backend {
            Backend::Shared(pool) => pool.num_workers(),
            Backend::Isolated(pool) => pool.num_workers(),
        }
    }

    /// The thread pool, when running on the shared backend.
    pub fn as_shared(&self) -> Option<&ThreadPool> {
        match &self.backend {
            Backend::Shared(pool) => Some(pool),
            Backend::Isolated(_) => None,
        }
    }

    /// The process pool, when running on the isolated backend.
    pub fn as_isolated(&self) -> Option<&ProcessPool> {
        match &self.backend {
            Backend::Isolated(pool) => Some(pool),
            Backend::Shared(_) => None,
        }
    }

    /// Queue the registered task `name` with `args` and return its future
    /// at once. Blocks only while a bounded queue is full.
    ///
    /// Submission fails for an unknown name, after shutdown, and on the
    /// isolated backend for arguments that cannot be serialized.
    pub fn submit<A, R>(&self, name: &str, args: A) -> Result<Future<R>>
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        self.submit_with(name, args, Admission::Block)
    }

    /// [`submit`](Executor::submit) that fails with [`Error::QueueFull`]
    /// rather than block.
    pub fn submit_nowait<A, R>(&self, name: &str, args: A) -> Result<Future<R>>
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        self.submit_with(name, args, Admission::NoWait)
    }

    fn submit_with<A, R>(&self, name: &str, args: A, admission: Admission) -> Result<Future<R>>
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        match &self.backend {
            Backend::Shared(pool) => {
                let f = self.registry.resolve::<A, R>(name)?;
                pool.submit_task(move |ctx| f(ctx, args), admission)
            }
            Backend::Isolated(pool) => pool.submit_with(name, &args, admission),
        }
    }

    /// Run a closure. Only the shared backend can do this; isolated
    /// workers need a registered name.
    pub fn spawn<F, T>(&self, f: F) -> Result<Future<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match &self.backend {
            Backend::Shared(pool) => pool.spawn(f),
            Backend::Isolated(_) => Err(closure_rejected()),
        }
    }

    pub fn spawn_with_context<F, T, E>(&self, f: F) -> Result<Future<T>>
    where
        F: FnOnce(&TaskContext) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display,
    {
        match &self.backend {
            Backend::Shared(pool) => pool.spawn_with_context(f),
            Backend::Isolated(_) => Err(closure_rejected()),
        }
    }

    /// Apply `name` to every input, `chunk_size` inputs per dispatch, and
    /// iterate the results in input order.
    ///
    /// All chunks are submitted before this returns, so a bounded queue may
    /// make it block. Submission errors cancel whatever was already queued.
    pub fn map<A, R, I>(&self, name: &str, inputs: I, chunk_size: usize) -> Result<MapIter<R>>
    where
        I: IntoIterator<Item = A>,
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        if chunk_size == 0 {
            return Err(Error::submission("chunk_size must be at least 1"));
        }

        let mut inputs = inputs.into_iter();
        let mut chunks = Vec::new();
        loop {
            let chunk: Vec<A> = inputs.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            match self.submit_chunk(name, chunk) {
                Ok(future) => chunks.push(future),
                Err(e) => {
                    for queued in &chunks {
                        queued.cancel();
                    }
                    return Err(e);
                }
            }
        }
        Ok(MapIter::new(chunks))
    }

    fn submit_chunk<A, R>(&self, name: &str, chunk: Vec<A>) -> Result<Future<Vec<R>>>
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        match &self.backend {
            Backend::Shared(pool) => {
                let f = self.registry.resolve::<A, R>(name)?;
                pool.submit_task(
                    move |ctx| {
                        let mut out = Vec::with_capacity(chunk.len());
                        for arg in chunk {
                            ctx.checkpoint()?;
                            out.push(f(ctx, arg)?);
                        }
                        Ok(out)
                    },
                    Admission::Block,
                )
            }
            Backend::Isolated(pool) => pool.submit_batch(name, &chunk, Admission::Block),
        }
    }

    /// Stop accepting submissions. See [`ShutdownOptions`]. Task failures
    /// are reported only through their futures, never here.
    pub fn shutdown(&self, options: ShutdownOptions) {
        match &self.backend {
            Backend::Shared(pool) => pool.shutdown(options),
            Backend::Isolated(pool) => pool.shutdown(options),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        match &self.backend {
            Backend::Shared(pool) => pool.is_shutdown(),
            Backend::Isolated(pool) => pool.is_shutdown(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn closure_rejected() -> Error {
    Error::submission("closures cannot cross into isolated workers; register the task and submit it by name")
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown(ShutdownOptions::default());
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("backend", &self.backend())
            .field("workers", &self.num_workers())
            .field("registry", &self.registry)
            .finish()
    }
}
