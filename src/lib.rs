//! taskforge - futures over shared-memory thread pools and isolated
//! process pools.
//!
//! Work is submitted to an [`Executor`] and comes back as a [`Future`]. The
//! executor runs on one of two backends:
//!
//! - **Shared**: a pool of OS threads in this process. Tasks can be plain
//!   closures and share memory with the caller. Rust has no interpreter
//!   lock, so CPU-bound tasks run in parallel here too.
//! - **Isolated**: a pool of worker processes. Tasks are called by name from
//!   a [`Registry`] and their arguments and results travel as JSON. A task
//!   that crashes its process fails with [`Error::WorkerLost`] and the
//!   worker is replaced.
//!
//! # Quick Start
//!
//! ```no_run
//! use taskforge::prelude::*;
//!
//! let mut registry = Registry::new();
//! registry.register("square", |x: u64| x * x);
//!
//! let executor = Executor::new(Config::builder().workers(4).build()?, registry)?;
//! let fut: Future<u64> = executor.submit("square", 12u64)?;
//! assert_eq!(fut.result(None)?, 144);
//!
//! let squares: Vec<u64> = executor
//!     .map::<u64, u64, _>("square", 1..=10, 4)?
//!     .collect::<Result<_>>()?;
//! assert_eq!(squares[9], 100);
//!
//! executor.shutdown(ShutdownOptions::default());
//! # Ok::<(), taskforge::Error>(())
//! ```
//!
//! An isolated executor needs a binary that answers the worker protocol;
//! see [`isolated::serve_stdio`].
//!
//! # Features
//!
//! - **Sync toolkit**: mutex, reentrant mutex, semaphores, events and
//!   condition variables with timeouts ([`sync`])
//! - **Bounded queue**: FIFO with back-pressure and `join` ([`queue`])
//! - **Cooperative cancellation** through [`CancelToken`]
//! - **Telemetry**: task counters and latency percentiles (optional)

pub mod builtins;
pub mod config;
pub mod error;
pub mod executor;
pub mod future;
pub mod isolated;
pub mod prelude;
pub mod queue;
pub mod registry;
pub mod sync;
pub mod telemetry;
pub mod util;

pub use config::{BackendKind, Config, ConfigBuilder};
pub use error::{Error, Result, TaskError};
pub use executor::{Executor, MapIter, ShutdownOptions, TaskContext, TaskId, ThreadPool};
pub use future::{as_completed, wait, CancelToken, Future, FutureState, ReturnWhen};
pub use isolated::{ProcessPool, StartMethod, WorkerCommand};
pub use queue::BoundedQueue;
pub use registry::Registry;
pub use telemetry::MetricsSnapshot;
