use crate::error::{Error, Result};
use crate::executor::panic_handler::PanicStrategy;
use crate::isolated::StartMethod;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which pool runs the tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Worker threads sharing the host's memory. Best for tasks that spend
    /// their time waiting.
    #[default]
    Shared,
    /// Worker processes with their own memory. Arguments and results must
    /// serialize; a crash only takes down one worker.
    Isolated,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Shared => "shared",
            BackendKind::Isolated => "isolated",
        })
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shared" | "thread" | "threads" => Ok(BackendKind::Shared),
            "isolated" | "process" | "processes" => Ok(BackendKind::Isolated),
            other => Err(Error::config(format!(
                "unknown backend `{}` (expected `shared` or `isolated`)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Worker count; `None` means one per logical CPU.
    pub workers: Option<usize>,
    pub backend: BackendKind,
    /// Queue bound. The isolated backend defaults to twice the worker
    /// count; the shared backend defaults to unbounded.
    pub queue_capacity: Option<usize>,
    /// Replace an isolated worker after it has run this many tasks.
    pub max_tasks_per_worker: Option<usize>,
    pub start_method: StartMethod,
    pub panic_strategy: PanicStrategy,
    pub stack_size: Option<usize>,
    pub thread_name_prefix: String,
    /// Launch attempts before a dispatch fails with a launch error.
    pub respawn_attempts: usize,
    /// How long a retiring worker may take to exit before it is killed.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: None,
            backend: BackendKind::default(),
            queue_capacity: None,
            max_tasks_per_worker: None,
            start_method: StartMethod::default(),
            panic_strategy: PanicStrategy::default(),
            stack_size: Some(2 * 1024 * 1024),
            thread_name_prefix: "taskforge-worker".to_string(),
            respawn_attempts: 3,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.workers {
            if n == 0 {
                return Err(Error::config("workers must be > 0"));
            }
            if n > 1024 {
                return Err(Error::config("workers too large (max 1024)"));
            }
        }

        if self.queue_capacity == Some(0) {
            return Err(Error::config("queue_capacity must be > 0"));
        }

        if self.max_tasks_per_worker == Some(0) {
            return Err(Error::config("max_tasks_per_worker must be > 0"));
        }

        if self.respawn_attempts == 0 {
            return Err(Error::config("respawn_attempts must be > 0"));
        }

        if self.thread_name_prefix.is_empty() {
            return Err(Error::config("thread_name_prefix must not be empty"));
        }

        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get)
    }

    /// The queue bound actually applied for the configured backend.
    pub fn effective_queue_capacity(&self) -> Option<usize> {
        match self.backend {
            BackendKind::Shared => self.queue_capacity,
            BackendKind::Isolated => Some(self.isolated_queue_capacity()),
        }
    }

    /// The isolated backend's queue is always bounded: twice the worker
    /// count unless configured.
    pub fn isolated_queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(self.worker_count() * 2)
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = Some(n);
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = Some(capacity);
        self
    }

    pub fn max_tasks_per_worker(mut self, n: usize) -> Self {
        self.config.max_tasks_per_worker = Some(n);
        self
    }

    pub fn start_method(mut self, method: StartMethod) -> Self {
        self.config.start_method = method;
        self
    }

    pub fn panic_strategy(mut self, strategy: PanicStrategy) -> Self {
        self.config.panic_strategy = strategy;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn respawn_attempts(mut self, n: usize) -> Self {
        self.config.respawn_attempts = n;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
