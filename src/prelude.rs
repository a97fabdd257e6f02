pub use crate::config::{BackendKind, Config, ConfigBuilder};
pub use crate::error::{Error, Result, TaskError};
pub use crate::executor::{Executor, ShutdownOptions, TaskContext};
pub use crate::future::{as_completed, wait, CancelToken, Future, ReturnWhen};
pub use crate::registry::Registry;

pub use crate::isolated::{StartMethod, WorkerCommand};

#[cfg(feature = "telemetry")]
pub use crate::telemetry::{Metrics, MetricsSnapshot};
