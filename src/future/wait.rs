use super::{Future, FutureState};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

/// Iterator over futures in completion order, built by [`as_completed`].
pub struct AsCompleted<T> {
    pending: Vec<Option<Future<T>>>,
    remaining: usize,
    rx: Receiver<usize>,
    deadline: Option<Instant>,
    fused: bool,
}

/// Yield each future as it finishes, whatever the submission order.
///
/// With a timeout, the first future that does not finish in time produces
/// one `Err(Error::Timeout)` and the iterator ends.
pub fn as_completed<T, I>(futures: I, timeout: Option<Duration>) -> AsCompleted<T>
where
    I: IntoIterator<Item = Future<T>>,
    T: 'static,
{
    let futures: Vec<Future<T>> = futures.into_iter().collect();
    let rx = notify_on_completion(&futures);
    AsCompleted {
        remaining: futures.len(),
        pending: futures.into_iter().map(Some).collect(),
        rx,
        deadline: timeout.map(|t| Instant::now() + t),
        fused: false,
    }
}

fn notify_on_completion<T: 'static>(futures: &[Future<T>]) -> Receiver<usize> {
    let (tx, rx) = crossbeam_channel::unbounded();
    for (index, future) in futures.iter().enumerate() {
        let tx = tx.clone();
        future.add_done_callback(move |_| {
            let _ = tx.send(index);
        });
    }
    rx
}

impl<T> Iterator for AsCompleted<T> {
    type Item = Result<Future<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused || self.remaining == 0 {
            return None;
        }
        let received = match self.deadline {
            Some(deadline) => self.rx.recv_deadline(deadline),
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(index) => {
                self.remaining -= 1;
                self.pending[index].take().map(Ok)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.fused = true;
                Some(Err(Error::Timeout))
            }
            // every outstanding future was dropped unfinished
            Err(RecvTimeoutError::Disconnected) => {
                self.fused = true;
                None
            }
        }
    }
}

/// Condition for [`wait`] to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnWhen {
    FirstCompleted,
    FirstException,
    AllCompleted,
}

#[derive(Debug)]
pub struct WaitOutcome<T> {
    pub done: Vec<Future<T>>,
    pub not_done: Vec<Future<T>>,
}

/// Block until `return_when` holds or the timeout expires, then split the
/// futures into finished and unfinished, each in input order.
pub fn wait<T, I>(futures: I, return_when: ReturnWhen, timeout: Option<Duration>) -> WaitOutcome<T>
where
    I: IntoIterator<Item = Future<T>>,
    T: 'static,
{
    let futures: Vec<Future<T>> = futures.into_iter().collect();
    let rx = notify_on_completion(&futures);
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut finished = vec![false; futures.len()];
    let mut finished_count = 0;
    let mut failed = false;

    loop {
        let satisfied = match return_when {
            ReturnWhen::AllCompleted => finished_count == futures.len(),
            ReturnWhen::FirstCompleted => finished_count > 0 || futures.is_empty(),
            ReturnWhen::FirstException => failed || finished_count == futures.len(),
        };
        if satisfied {
            break;
        }
        let received = match deadline {
            Some(deadline) => rx.recv_deadline(deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(index) => {
                finished[index] = true;
                finished_count += 1;
                failed |= futures[index].state() == FutureState::Failed;
            }
            Err(_) => break,
        }
    }

    let mut outcome = WaitOutcome {
        done: Vec::new(),
        not_done: Vec::new(),
    };
    for (future, finished) in futures.into_iter().zip(finished) {
        if finished || future.done() {
            outcome.done.push(future);
        } else {
            outcome.not_done.push(future);
        }
    }
    outcome
}
