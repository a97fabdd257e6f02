use crate::error::Result;
use crate::future::Future;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Results of [`Executor::map`](super::Executor::map), in input order.
///
/// The first failure is yielded as an `Err`, every chunk not yet started is
/// cancelled, and iteration ends. Dropping the iterator early cancels the
/// remaining chunks too.
pub struct MapIter<R> {
    chunks: VecDeque<Future<Vec<R>>>,
    current: std::vec::IntoIter<R>,
    deadline: Option<Instant>,
    finished: bool,
}

impl<R> MapIter<R> {
    pub(crate) fn new(chunks: Vec<Future<Vec<R>>>) -> Self {
        Self {
            chunks: chunks.into(),
            current: Vec::new().into_iter(),
            deadline: None,
            finished: false,
        }
    }

    /// Give the whole iteration `timeout`, counted from now. Running past it
    /// yields [`Error::Timeout`](crate::Error::Timeout).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Chunks not yet consumed.
    pub fn remaining_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn cancel_rest(&mut self) {
        for chunk in self.chunks.drain(..) {
            chunk.cancel();
        }
    }
}

impl<R> Iterator for MapIter<R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(value) = self.current.next() {
                return Some(Ok(value));
            }
            if self.finished {
                return None;
            }
            let Some(chunk) = self.chunks.pop_front() else {
                self.finished = true;
                return None;
            };
            let timeout = self
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now()));
            match chunk.take_result(timeout) {
                Ok(values) => self.current = values.into_iter(),
                Err(e) => {
                    chunk.cancel();
                    self.finished = true;
                    self.cancel_rest();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl<R> Drop for MapIter<R> {
    fn drop(&mut self) {
        self.cancel_rest();
    }
}
