//! Metrics collection for pool monitoring.

use crate::executor::task::TaskOutcome;
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by every worker of one executor.
#[derive(Debug)]
pub struct Metrics {
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_panicked: AtomicU64,
    tasks_cancelled: AtomicU64,

    workers_spawned: AtomicU64,
    workers_lost: AtomicU64,
    workers_recycled: AtomicU64,

    busy_time_ns: AtomicU64,

    // queue-to-finish latency
    latency_histogram: RwLock<Histogram<u64>>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        // 3 significant figures, up to one hour in nanoseconds
        let histogram = Histogram::new_with_max(3_600_000_000_000, 3)
            .expect("histogram bounds are valid");

        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            workers_spawned: AtomicU64::new(0),
            workers_lost: AtomicU64::new(0),
            workers_recycled: AtomicU64::new(0),
            busy_time_ns: AtomicU64::new(0),
            latency_histogram: RwLock::new(histogram),
            start_time: Instant::now(),
        }
    }

    pub fn record_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task leaving a worker. `queued_at` is when it was submitted,
    /// `started_at` when a worker picked it up.
    pub(crate) fn record_outcome(&self, outcome: TaskOutcome, queued_at: Instant, started_at: Instant) {
        let counter = match outcome {
            TaskOutcome::Skipped => &self.tasks_cancelled,
            TaskOutcome::Fulfilled => &self.tasks_completed,
            TaskOutcome::Failed => &self.tasks_failed,
            TaskOutcome::Panicked => &self.tasks_panicked,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if outcome == TaskOutcome::Skipped {
            return;
        }

        self.busy_time_ns
            .fetch_add(started_at.elapsed().as_nanos() as u64, Ordering::Relaxed);
        if let Some(mut hist) = self.latency_histogram.try_write() {
            let _ = hist.record(queued_at.elapsed().as_nanos() as u64);
        }
    }

    pub fn record_worker_spawned(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_lost(&self) {
        self.workers_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_recycled(&self) {
        self.workers_recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let histogram = self.latency_histogram.read();

        MetricsSnapshot {
            uptime: self.start_time.elapsed(),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_panicked: self.tasks_panicked.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            workers_lost: self.workers_lost.load(Ordering::Relaxed),
            workers_recycled: self.workers_recycled.load(Ordering::Relaxed),
            busy_time_ns: self.busy_time_ns.load(Ordering::Relaxed),
            avg_latency_ns: if histogram.len() > 0 {
                histogram.mean() as u64
            } else {
                0
            },
            p50_latency_ns: histogram.value_at_quantile(0.50),
            p99_latency_ns: histogram.value_at_quantile(0.99),
            max_latency_ns: histogram.max(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub uptime: Duration,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_panicked: u64,
    pub tasks_cancelled: u64,
    pub workers_spawned: u64,
    pub workers_lost: u64,
    pub workers_recycled: u64,
    pub busy_time_ns: u64,
    pub avg_latency_ns: u64,
    pub p50_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl MetricsSnapshot {
    /// Tasks that ran to an outcome, successful or not.
    pub fn tasks_finished(&self) -> u64 {
        self.tasks_completed + self.tasks_failed + self.tasks_panicked
    }

    pub fn tasks_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.tasks_finished() as f64 / seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_basic() {
        let metrics = Metrics::new();
        let queued = Instant::now();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_outcome(TaskOutcome::Fulfilled, queued, Instant::now());
        metrics.record_outcome(TaskOutcome::Failed, queued, Instant::now());
        metrics.record_worker_lost();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_submitted, 2);
        assert_eq!(snapshot.tasks_completed, 1);
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(snapshot.tasks_finished(), 2);
        assert_eq!(snapshot.workers_lost, 1);
    }

    #[test]
    fn test_skipped_counts_as_cancelled() {
        let metrics = Metrics::new();
        metrics.record_outcome(TaskOutcome::Skipped, Instant::now(), Instant::now());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_cancelled, 1);
        assert_eq!(snapshot.tasks_finished(), 0);
    }
}
