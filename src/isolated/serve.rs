//! The worker side of the protocol.

use super::process::WORKER_SLOT_ENV;
use super::protocol::{FrameReader, FrameWriter, Outcome, Request, Response};
use crate::error::{Error, Result, TaskError};
use crate::executor::panic_handler::{PanicHandler, PanicStrategy};
use crate::executor::task::{TaskContext, TaskId};
use crate::future::{CancelToken, Interrupted};
use crate::registry::Registry;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

static SERVING: AtomicBool = AtomicBool::new(false);

struct Job {
    id: TaskId,
    name: String,
    payloads: Vec<Value>,
    token: CancelToken,
}

// tokens of jobs received but not yet answered
type Running = Arc<Mutex<HashMap<TaskId, CancelToken>>>;

/// Serve tasks from `registry` until the host sends `Shutdown` or hangs up.
///
/// A listener thread keeps reading while a task runs, so a `Cancel` for the
/// running task reaches its [`CancelToken`] immediately.
pub fn serve<R, W>(registry: &Registry, slot: Option<usize>, reader: R, writer: W) -> Result<()>
where
    R: Read + Send + 'static,
    W: Write,
{
    let mut writer = FrameWriter::new(writer);
    writer.send(&Response::Ready {
        pid: std::process::id(),
    })?;

    let running: Running = Arc::default();
    let (tx, rx) = crossbeam_channel::unbounded();
    let listener = {
        let running = running.clone();
        thread::Builder::new()
            .name("taskforge-listener".into())
            .spawn(move || listen(FrameReader::new(reader), tx, running))?
    };

    // panics are reported to the host, which logs them
    let handler = PanicHandler::new(PanicStrategy::Isolate);
    for job in rx {
        let ctx = TaskContext::new(job.id, job.token, slot);
        let outcome = run_job(registry, &handler, &ctx, &job.name, job.payloads);
        running.lock().remove(&job.id);
        match writer.send(&Response::Done { id: job.id, outcome }) {
            Ok(()) => {}
            // nothing was written, so the stream is still in sync
            Err(Error::Serialization(reason)) => {
                tracing::warn!(task = %job.id, %reason, "result cannot be sent back");
                writer.send(&Response::Done {
                    id: job.id,
                    outcome: Outcome::Err(TaskError::new("SerializationError", reason)),
                })?;
            }
            Err(e) => return Err(e),
        }
    }

    let _ = listener.join();
    Ok(())
}

/// Whether this process was started as an isolated worker, through
/// [`serve_stdio`] or a fork. Tasks that must never run inside the host
/// check this.
pub fn is_worker_process() -> bool {
    SERVING.load(Ordering::Acquire)
}

pub(crate) fn mark_worker_process() {
    SERVING.store(true, Ordering::Release);
}

/// [`serve`] over this process's stdin and stdout.
///
/// On unix the channel moves to a private descriptor and stdout is pointed
/// at stderr, so a task that prints cannot corrupt the frame stream.
pub fn serve_stdio(registry: &Registry) -> Result<()> {
    mark_worker_process();
    let slot = std::env::var(WORKER_SLOT_ENV).ok().and_then(|s| s.parse().ok());
    #[cfg(unix)]
    {
        let channel = detach_stdout()?;
        serve(registry, slot, std::io::stdin(), channel)
    }
    #[cfg(not(unix))]
    {
        serve(registry, slot, std::io::stdin(), std::io::stdout())
    }
}

#[cfg(unix)]
fn detach_stdout() -> Result<std::fs::File> {
    use std::os::unix::io::FromRawFd;

    // SAFETY: dup/dup2 on the standard descriptors; the duplicate is owned
    // by the returned File alone.
    unsafe {
        let channel = libc::dup(libc::STDOUT_FILENO);
        if channel < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        libc::fcntl(channel, libc::F_SETFD, libc::FD_CLOEXEC);
        if libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(channel);
            return Err(err.into());
        }
        Ok(std::fs::File::from_raw_fd(channel))
    }
}

fn listen<R: Read>(mut reader: FrameReader<R>, tx: Sender<Job>, running: Running) {
    loop {
        match reader.recv::<Request>() {
            Ok(Request::Run { id, name, payloads }) => {
                let token = CancelToken::new();
                running.lock().insert(id, token.clone());
                let job = Job {
                    id,
                    name,
                    payloads,
                    token,
                };
                if tx.send(job).is_err() {
                    break;
                }
            }
            Ok(Request::Cancel { id }) => {
                if let Some(token) = running.lock().get(&id) {
                    token.cancel();
                }
            }
            Ok(Request::Shutdown) => break,
            Err(e) => {
                if !matches!(e, Error::ChannelClosed) {
                    tracing::warn!(error = %e, "unreadable frame from host");
                }
                break;
            }
        }
    }
}

fn run_job(
    registry: &Registry,
    handler: &PanicHandler,
    ctx: &TaskContext,
    name: &str,
    payloads: Vec<Value>,
) -> Outcome {
    let mut values = Vec::with_capacity(payloads.len());
    for payload in payloads {
        if ctx.is_cancelled() {
            return Outcome::Err(Interrupted.into());
        }
        match handler.execute(|| registry.call_value(ctx, name, payload)) {
            Ok(Ok(value)) => values.push(value),
            Ok(Err(e)) => return Outcome::Err(e),
            Err(panic) => return Outcome::Err(TaskError::from(panic)),
        }
    }
    Outcome::Ok(values)
}
