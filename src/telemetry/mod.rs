//! Pool metrics.
//!
//! Without the `telemetry` feature the collector compiles down to no-ops and
//! snapshots are all zero.

#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub use metrics::{Metrics, MetricsSnapshot};

#[cfg(not(feature = "telemetry"))]
pub mod metrics {
    use crate::executor::task::TaskOutcome;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, Default)]
    pub struct Metrics;

    impl Metrics {
        pub fn new() -> Self {
            Self
        }
        pub fn record_submitted(&self) {}
        pub fn record_cancelled(&self) {}
        pub(crate) fn record_outcome(&self, _: TaskOutcome, _: Instant, _: Instant) {}
        pub fn record_worker_spawned(&self) {}
        pub fn record_worker_lost(&self) {}
        pub fn record_worker_recycled(&self) {}
        pub fn snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot::default()
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
        pub fn tasks_finished(&self) -> u64 {
            self.tasks_completed + self.tasks_failed + self.tasks_panicked
        }

        pub fn tasks_per_second(&self) -> f64 {
            0.0
        }
    }
}

#[cfg(not(feature = "telemetry"))]
pub use metrics::{Metrics, MetricsSnapshot};
