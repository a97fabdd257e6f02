//! Process-isolated backend.
//!
//! Each worker is a separate OS process with its own memory, so CPU-bound
//! tasks never contend on anything in the host, and a worker that crashes
//! takes down only the task it was running. Tasks are called by registered
//! name; arguments and results cross the boundary as JSON.

mod dispatch;
pub mod process;
pub mod protocol;
mod serve;
mod slot;

pub use process::{StartMethod, WorkerCommand, WorkerExit, WorkerProcess, WORKER_SLOT_ENV};
pub use serve::{is_worker_process, serve, serve_stdio};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::task::TaskId;
use crate::executor::{Admission, ShutdownOptions};
use crate::future::Future;
use crate::queue::BoundedQueue;
use crate::registry::Registry;
use crate::telemetry::Metrics;
use dispatch::Dispatch;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use slot::{Driver, Slot};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub(crate) struct Shared {
    registry: Arc<Registry>,
    start: StartMethod,
    queue: BoundedQueue<Dispatch>,
    slots: Vec<Arc<Slot>>,
    accepting: AtomicBool,
    max_tasks_per_worker: Option<usize>,
    respawn_attempts: usize,
    shutdown_grace: Duration,
    metrics: Arc<Metrics>,
}

/// Pool of worker processes, one host thread per worker.
///
/// The queue is always bounded (twice the worker count unless configured),
/// so a fast producer blocks in `submit` instead of buffering without
/// limit.
pub struct ProcessPool {
    shared: Arc<Shared>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessPool {
    pub fn new(config: &Config, registry: Arc<Registry>) -> Result<Self> {
        Self::with_metrics(config, registry, Arc::new(Metrics::new()))
    }

    pub(crate) fn with_metrics(
        config: &Config,
        registry: Arc<Registry>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        config.validate()?;
        let workers = config.worker_count();
        let capacity = config.isolated_queue_capacity();

        let shared = Arc::new(Shared {
            registry,
            start: config.start_method.clone(),
            queue: BoundedQueue::bounded(capacity),
            slots: (0..workers).map(|i| Arc::new(Slot::new(i))).collect(),
            accepting: AtomicBool::new(true),
            max_tasks_per_worker: config.max_tasks_per_worker,
            respawn_attempts: config.respawn_attempts,
            shutdown_grace: config.shutdown_grace,
            metrics,
        });

        // every worker starts before the pool is handed out, so a broken
        // worker command surfaces here
        let mut drivers = Vec::with_capacity(workers);
        for slot in &shared.slots {
            let mut driver = Driver::new(slot.clone(), shared.clone());
            driver.ensure_worker()?;
            drivers.push(driver);
        }

        let pool = Self {
            shared,
            drivers: Mutex::new(Vec::with_capacity(workers)),
        };
        for driver in drivers {
            let name = format!("{}-slot-{}", config.thread_name_prefix, driver.index());
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || driver.run())
                .map_err(|e| Error::launch(format!("spawn failed: {}", e)))?;
            pool.drivers.lock().push(handle);
        }

        tracing::debug!(workers, capacity, "process pool started");
        Ok(pool)
    }

    /// Run the registered task `name` on `args` in a worker process.
    ///
    /// `args` is serialized here, so an argument that cannot be encoded, or
    /// whose frame would exceed [`protocol::MAX_FRAME_LEN`], is rejected
    /// before anything is queued. Blocks while the queue is full.
    pub fn submit<A, R>(&self, name: &str, args: &A) -> Result<Future<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.submit_with(name, args, Admission::Block)
    }

    /// [`submit`](ProcessPool::submit) that fails with
    /// [`Error::QueueFull`] instead of blocking.
    pub fn submit_nowait<A, R>(&self, name: &str, args: &A) -> Result<Future<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.submit_with(name, args, Admission::NoWait)
    }

    pub(crate) fn submit_with<A, R>(&self, name: &str, args: &A, admission: Admission) -> Result<Future<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.check_submission(name)?;
        let payload = encode(name, args)?;
        let future = Future::new();
        self.enqueue(Dispatch::single(&future, name, payload), admission)?;
        Ok(future)
    }

    /// Run `name` over a chunk of inputs in one round trip. The result
    /// holds one value per input, in order; the first failure fails the
    /// whole chunk.
    pub(crate) fn submit_batch<A, R>(&self, name: &str, args: &[A], admission: Admission) -> Result<Future<Vec<R>>>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        self.check_submission(name)?;
        let payloads = args
            .iter()
            .map(|a| encode(name, a))
            .collect::<Result<Vec<Value>>>()?;
        let future = Future::new();
        self.enqueue(Dispatch::batch(&future, name, payloads), admission)?;
        Ok(future)
    }

    fn check_submission(&self, name: &str) -> Result<()> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }
        if !self.shared.registry.contains(name) {
            return Err(Error::submission(format!("no task named `{}` is registered", name)));
        }
        Ok(())
    }

    fn enqueue(&self, dispatch: Dispatch, admission: Admission) -> Result<()> {
        protocol::check_run_frame(dispatch.id, &dispatch.name, &dispatch.payloads).map_err(|e| {
            Error::submission(format!(
                "task `{}` cannot be sent to a worker: {}",
                dispatch.name, e
            ))
        })?;
        match admission {
            Admission::Block => self.shared.queue.put(dispatch)?,
            Admission::NoWait => self.shared.queue.try_put(dispatch)?,
        }
        self.shared.metrics.record_submitted();
        Ok(())
    }

    pub fn num_workers(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared.queue.capacity().unwrap_or(usize::MAX)
    }

    /// Dispatches queued but not yet taken by a worker slot.
    pub fn pending_tasks(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Current worker pid per slot; `None` while a slot has no process.
    pub fn worker_pids(&self) -> Vec<Option<u32>> {
        self.shared.slots.iter().map(|s| s.pid()).collect()
    }

    /// The slot currently running task `id`, if any.
    pub fn slot_of(&self, id: TaskId) -> Option<usize> {
        self.shared
            .slots
            .iter()
            .find(|s| s.current() == Some(id))
            .map(|s| s.index)
    }

    /// Kill the worker in `slot`. Its running task, if any, fails with
    /// [`Error::WorkerLost`] and a replacement is started. Returns whether a
    /// live process was killed.
    pub fn terminate_worker(&self, slot: usize) -> Result<bool> {
        let slot = self
            .shared
            .slots
            .get(slot)
            .ok_or_else(|| Error::submission(format!("no worker slot {}", slot)))?;
        let killed = slot.kill()?;
        if killed {
            tracing::info!(slot = slot.index, "worker terminated on request");
        }
        Ok(killed)
    }

    pub fn is_shutdown(&self) -> bool {
        !self.shared.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting work and let every slot retire its worker once the
    /// queue is empty. Idempotent.
    pub fn shutdown(&self, options: ShutdownOptions) {
        if self.shared.accepting.swap(false, Ordering::AcqRel) {
            tracing::debug!(?options, "process pool shutting down");
        }

        if options.cancel_pending {
            for dispatch in self.shared.queue.drain() {
                if dispatch.completion.cancel() {
                    self.shared.metrics.record_cancelled();
                }
            }
        }

        self.shared.queue.close();

        if options.wait {
            for handle in self.drivers.lock().drain(..) {
                if handle.join().is_err() {
                    tracing::error!("slot driver panicked");
                }
            }
        }
    }
}

fn encode<A: Serialize + ?Sized>(name: &str, args: &A) -> Result<Value> {
    serde_json::to_value(args).map_err(|e| {
        Error::submission(format!(
            "argument for `{}` cannot be sent to a worker: {}",
            name, e
        ))
    })
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.shutdown(ShutdownOptions::default());
    }
}

impl fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessPool")
            .field("workers", &self.num_workers())
            .field("pending", &self.pending_tasks())
            .field("pids", &self.worker_pids())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
