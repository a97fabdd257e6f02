// worker thread loop
use super::panic_handler::PanicHandler;
use super::task::Task;
use crate::future::enter_pool;
use crate::queue::BoundedQueue;
use crate::telemetry::Metrics;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub type WorkerId = usize;

// per-worker stats
#[derive(Debug, Default)]
pub struct WorkerState {
    pub tasks_executed: AtomicU64,
    pub busy_time_ns: AtomicU64,
}

pub(crate) struct Worker {
    pub id: WorkerId,
    pub pool: u64,
    pub queue: Arc<BoundedQueue<Task>>,
    pub idle: Arc<AtomicUsize>,
    pub panic_handler: Arc<PanicHandler>,
    pub metrics: Arc<Metrics>,
    pub state: Arc<WorkerState>,
}

impl Worker {
    // main loop; returns once the queue is closed and empty
    pub fn run(self) {
        enter_pool(self.pool);
        tracing::debug!(worker = self.id, "worker started");

        loop {
            self.idle.fetch_add(1, Ordering::AcqRel);
            let next = self.queue.get();
            self.idle.fetch_sub(1, Ordering::AcqRel);

            match next {
                Ok(task) => self.execute_task(task),
                Err(_) => break,
            }
        }

        tracing::debug!(
            worker = self.id,
            executed = self.state.tasks_executed.load(Ordering::Relaxed),
            busy_ms = self.state.busy_time_ns.load(Ordering::Relaxed) / 1_000_000,
            "worker stopped"
        );
    }

    fn execute_task(&self, task: Task) {
        let tid = task.id;
        let queued_at = task.spawn_time;
        let start = Instant::now();

        let outcome = task.execute(&self.panic_handler, self.id);
        self.metrics.record_outcome(outcome, queued_at, start);

        self.state
            .busy_time_ns
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.state.tasks_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(worker = self.id, task = %tid, ?outcome, "task finished");

        if let Err(e) = self.queue.task_done() {
            tracing::error!(worker = self.id, error = %e, "queue bookkeeping out of sync");
        }
    }
}
