//! One worker process and the host thread that feeds it.

use super::dispatch::Dispatch;
use super::process::{self, WorkerProcess};
use super::protocol::{FrameReader, FrameWriter, Request, Response};
use super::Shared;
use crate::error::{Error, Result};
use crate::executor::task::{TaskId, TaskOutcome};
use crate::future::CancelToken;
use crate::util::Backoff;
use parking_lot::Mutex;
use serde_json::Value;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

const REAP_GRACE: Duration = Duration::from_millis(250);

struct Link {
    process: WorkerProcess,
    writer: FrameWriter<Box<dyn Write + Send>>,
}

/// State of one worker slot visible to the rest of the pool.
pub(crate) struct Slot {
    pub(crate) index: usize,
    link: Mutex<Option<Link>>,
    current: Mutex<Option<TaskId>>,
}

impl Slot {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            link: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.link.lock().as_ref().map(|l| l.process.pid())
    }

    pub(crate) fn current(&self) -> Option<TaskId> {
        *self.current.lock()
    }

    /// Kill the worker process. Returns whether it was still running.
    pub(crate) fn kill(&self) -> Result<bool> {
        match self.link.lock().as_mut() {
            Some(link) => {
                let alive = link.process.is_alive();
                link.process.kill()?;
                Ok(alive)
            }
            None => Ok(false),
        }
    }

    fn send_cancel(&self, id: TaskId) {
        if self.current() != Some(id) {
            return;
        }
        if let Some(link) = self.link.lock().as_mut() {
            if let Err(e) = link.writer.send(&Request::Cancel { id }) {
                tracing::debug!(slot = self.index, task = %id, error = %e, "cancel not delivered");
            }
        }
    }
}

/// Runs on its own host thread: pulls dispatches, keeps a worker alive for
/// the slot, and turns the worker's replies into completed futures.
pub(crate) struct Driver {
    slot: Arc<Slot>,
    pool: Arc<Shared>,
    reader: Option<FrameReader<Box<dyn Read + Send>>>,
    completed: usize,
    backoff: Backoff,
}

impl Driver {
    pub(crate) fn new(slot: Arc<Slot>, pool: Arc<Shared>) -> Self {
        Self {
            slot,
            pool,
            reader: None,
            completed: 0,
            backoff: Backoff::default(),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.slot.index
    }

    pub(crate) fn run(mut self) {
        tracing::debug!(slot = self.slot.index, "slot driver started");
        while let Ok(dispatch) = self.pool.queue.get() {
            self.handle(dispatch);
            if let Err(e) = self.pool.queue.task_done() {
                tracing::error!(slot = self.slot.index, error = %e, "queue bookkeeping out of sync");
            }
        }
        self.retire();
        tracing::debug!(slot = self.slot.index, "slot driver stopped");
    }

    fn handle(&mut self, dispatch: Dispatch) {
        let Dispatch {
            id,
            name,
            payloads,
            completion,
            queued_at,
        } = dispatch;

        match completion.start() {
            Ok(true) => {}
            Ok(false) => {
                self.pool
                    .metrics
                    .record_outcome(TaskOutcome::Skipped, queued_at, Instant::now());
                return;
            }
            Err(e) => {
                tracing::error!(slot = self.slot.index, task = %id, error = %e, "task dispatched twice");
                return;
            }
        }

        let started = Instant::now();
        let result = match self.ensure_worker() {
            Ok(()) => self.exchange(id, name, payloads, completion.token()),
            Err(e) => Err(e),
        };
        let lost = matches!(result, Err(Error::WorkerLost { .. }));
        let outcome = completion.finish(result);
        self.pool.metrics.record_outcome(outcome, queued_at, started);

        if lost {
            self.replace();
            return;
        }
        self.completed += 1;
        if let Some(max) = self.pool.max_tasks_per_worker {
            if self.completed >= max {
                tracing::debug!(slot = self.slot.index, tasks = self.completed, "recycling worker");
                self.retire();
                self.pool.metrics.record_worker_recycled();
                self.replace();
            }
        }
    }

    /// Make sure a live worker is attached, launching one if needed.
    pub(crate) fn ensure_worker(&mut self) -> Result<()> {
        if self.reader.is_some() {
            let alive = self
                .slot
                .link
                .lock()
                .as_mut()
                .map_or(false, |l| l.process.is_alive());
            if alive {
                return Ok(());
            }
            let exit = self.reap();
            self.pool.metrics.record_worker_lost();
            tracing::warn!(slot = self.slot.index, %exit, "idle worker died; replacing it");
        }

        let attempts = self.pool.respawn_attempts;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.launch() {
                Ok(()) => {
                    self.backoff.reset();
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(slot = self.slot.index, attempt, error = %e, "worker launch failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        self.backoff.snooze();
                    }
                }
            }
        }
        Err(Error::launch(format!(
            "no worker for slot {} after {} attempts: {}",
            self.slot.index,
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn replace(&mut self) {
        if let Err(e) = self.ensure_worker() {
            // retried before the next dispatch
            tracing::warn!(slot = self.slot.index, error = %e, "could not replace worker");
        }
    }

    fn launch(&mut self) -> Result<()> {
        let (mut process, rx, tx) =
            process::launch(&self.pool.start, &self.pool.registry, self.slot.index)?;
        let mut reader = FrameReader::new(rx);

        match reader.recv::<Response>() {
            Ok(Response::Ready { pid }) => {
                tracing::debug!(slot = self.slot.index, pid, "worker ready");
            }
            Ok(other) => {
                let _ = process.terminate();
                return Err(Error::launch(format!("expected a ready frame, got {:?}", other)));
            }
            Err(e) => {
                let exit = process
                    .terminate()
                    .map(|x| x.to_string())
                    .unwrap_or_else(|_| "unknown exit status".into());
                return Err(Error::launch(format!("worker failed its handshake ({}): {}", exit, e)));
            }
        }

        *self.slot.link.lock() = Some(Link {
            process,
            writer: FrameWriter::new(tx),
        });
        self.reader = Some(reader);
        self.completed = 0;
        self.pool.metrics.record_worker_spawned();
        Ok(())
    }

    fn exchange(
        &mut self,
        id: TaskId,
        name: String,
        payloads: Vec<Value>,
        token: CancelToken,
    ) -> Result<Vec<Value>> {
        let request = Request::Run { id, name, payloads };
        let sent = match self.slot.link.lock().as_mut() {
            Some(link) => link.writer.send(&request),
            None => Err(Error::ChannelClosed),
        };
        match sent {
            Ok(()) => {}
            // rejected before any byte went out; the worker is fine
            Err(e @ Error::Serialization(_)) => return Err(e),
            Err(e) => return Err(self.lost(format!("could not send task: {}", e))),
        }

        *self.slot.current.lock() = Some(id);
        let slot = Arc::downgrade(&self.slot);
        token.on_cancel(move || {
            if let Some(slot) = slot.upgrade() {
                slot.send_cancel(id);
            }
        });

        let received = loop {
            let Some(reader) = self.reader.as_mut() else {
                break Err(Error::ChannelClosed);
            };
            match reader.recv::<Response>() {
                Ok(Response::Done { id: done, outcome }) if done == id => break Ok(outcome),
                Ok(other) => {
                    tracing::warn!(slot = self.slot.index, frame = ?other, "ignoring unexpected frame");
                }
                Err(e) => break Err(e),
            }
        };
        *self.slot.current.lock() = None;

        match received {
            Ok(outcome) => outcome.into_result(),
            Err(e) => Err(self.lost(e.to_string())),
        }
    }

    /// Tear down a worker that stopped answering and describe how it ended.
    fn lost(&mut self, reason: String) -> Error {
        let exit = self.reap();
        self.pool.metrics.record_worker_lost();
        tracing::warn!(slot = self.slot.index, %reason, %exit, "worker lost");
        Error::worker_lost(self.slot.index, format!("{} ({})", reason, exit))
    }

    fn reap(&mut self) -> String {
        self.reader = None;
        let link = self.slot.link.lock().take();
        let Some(mut link) = link else {
            return "no process".to_string();
        };
        // a worker that hung up is usually already exiting on its own
        let exit = match link.process.wait_timeout(REAP_GRACE) {
            Ok(Some(exit)) => Ok(exit),
            Ok(None) => link.process.terminate(),
            Err(e) => Err(e),
        };
        match exit {
            Ok(exit) => exit.to_string(),
            Err(e) => format!("not reaped: {}", e),
        }
    }

    /// Ask the worker to exit, killing it if it outlives the grace period.
    fn retire(&mut self) {
        self.reader = None;
        let Some(link) = self.slot.link.lock().take() else {
            return;
        };
        let Link {
            mut process,
            mut writer,
        } = link;
        let _ = writer.send(&Request::Shutdown);
        drop(writer);

        match process.wait_timeout(self.pool.shutdown_grace) {
            Ok(Some(exit)) => {
                tracing::debug!(slot = self.slot.index, pid = process.pid(), %exit, "worker exited");
            }
            Ok(None) => {
                tracing::warn!(slot = self.slot.index, pid = process.pid(), "worker ignored shutdown; killing it");
                let _ = process.terminate();
            }
            Err(e) => {
                tracing::warn!(slot = self.slot.index, error = %e, "could not reap worker");
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.retire();
    }
}
