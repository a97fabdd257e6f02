//! Thread-safe FIFO with blocking `put`/`get` and an optional capacity.
//!
//! Producers block while a bounded queue is full, consumers while it is
//! empty. Enqueueing is all-or-nothing: a `put` that times out, finds the
//! queue full, or finds it closed hands the item back inside [`PutError`],
//! so the caller never has to guess whether it went in.

use crate::error::{Error, Result};
use crate::sync::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    // items put but not yet marked done
    unfinished: usize,
}

pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    all_done: Condvar,
    capacity: Option<usize>,
}

/// A rejected `put`, carrying the item back to the caller.
pub enum PutError<T> {
    Full(T),
    Timeout(T),
    Closed(T),
}

impl<T> PutError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PutError::Full(item) | PutError::Timeout(item) | PutError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Debug for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutError::Full(_) => f.write_str("Full(..)"),
            PutError::Timeout(_) => f.write_str("Timeout(..)"),
            PutError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutError::Full(_) => f.write_str("queue is full"),
            PutError::Timeout(_) => f.write_str("timed out waiting for queue space"),
            PutError::Closed(_) => f.write_str("queue is closed"),
        }
    }
}

impl<T> std::error::Error for PutError<T> {}

impl<T> From<PutError<T>> for Error {
    fn from(e: PutError<T>) -> Self {
        match e {
            PutError::Full(_) => Error::QueueFull,
            PutError::Timeout(_) => Error::Timeout,
            PutError::Closed(_) => Error::ShutDown,
        }
    }
}

impl<T> BoundedQueue<T> {
    /// A queue holding at most `capacity` items (at least one).
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
                unfinished: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            all_done: Condvar::new(),
            capacity: capacity.map(|c| c.max(1)),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        match self.capacity {
            Some(cap) => self.len() >= cap,
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Append `item`, blocking while the queue is full.
    pub fn put(&self, item: T) -> std::result::Result<(), PutError<T>> {
        let mut state = self.state.lock();
        while !state.closed && self.at_capacity(&state) {
            self.not_full.wait(&mut state);
        }
        self.push_locked(state, item)
    }

    pub fn put_timeout(&self, item: T, timeout: Duration) -> std::result::Result<(), PutError<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.closed && self.at_capacity(&state) {
            let now = Instant::now();
            if now >= deadline {
                return Err(PutError::Timeout(item));
            }
            let _ = self.not_full.wait_timeout(&mut state, deadline - now);
        }
        self.push_locked(state, item)
    }

    /// Append without blocking.
    pub fn try_put(&self, item: T) -> std::result::Result<(), PutError<T>> {
        let state = self.state.lock();
        if !state.closed && self.at_capacity(&state) {
            return Err(PutError::Full(item));
        }
        self.push_locked(state, item)
    }

    /// Take the oldest item, blocking while empty. A closed queue still hands
    /// out what it holds, then reports [`Error::ChannelClosed`].
    pub fn get(&self) -> Result<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = self.pop_locked(&mut state) {
                return Ok(item);
            }
            if state.closed {
                return Err(Error::ChannelClosed);
            }
            self.not_empty.wait(&mut state);
        }
    }

    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = self.pop_locked(&mut state) {
                return Ok(item);
            }
            if state.closed {
                return Err(Error::ChannelClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let _ = self.not_empty.wait_timeout(&mut state, deadline - now);
        }
    }

    pub fn try_get(&self) -> Option<T> {
        let mut state = self.state.lock();
        self.pop_locked(&mut state)
    }

    /// Remove everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let drained: Vec<T> = state.items.drain(..).collect();
        state.unfinished = state.unfinished.saturating_sub(drained.len());
        if state.unfinished == 0 {
            self.all_done.notify_all();
        }
        drop(state);
        self.not_full.notify_all();
        drained
    }

    /// Refuse further puts and wake every blocked producer and consumer.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Mark one previously fetched item as fully processed.
    pub fn task_done(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.unfinished == 0 {
            return Err(Error::state_violation(
                "task_done called more times than items were put",
            ));
        }
        state.unfinished -= 1;
        if state.unfinished == 0 {
            self.all_done.notify_all();
        }
        Ok(())
    }

    /// Block until every item put so far has been marked done.
    pub fn join(&self) {
        let mut state = self.state.lock();
        self.all_done.wait_while(&mut state, |s| s.unfinished > 0);
    }

    pub fn join_timeout(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        self.all_done
            .wait_while_timeout(&mut state, timeout, |s| s.unfinished > 0)
    }

    fn at_capacity(&self, state: &State<T>) -> bool {
        matches!(self.capacity, Some(cap) if state.items.len() >= cap)
    }

    fn push_locked(
        &self,
        mut state: crate::sync::MutexGuard<'_, State<T>>,
        item: T,
    ) -> std::result::Result<(), PutError<T>> {
        if state.closed {
            return Err(PutError::Closed(item));
        }
        state.items.push_back(item);
        state.unfinished += 1;
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    fn pop_locked(&self, state: &mut State<T>) -> Option<T> {
        let item = state.items.pop_front()?;
        // one slot freed, one producer may proceed
        self.not_full.notify_one();
        Some(item)
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}
