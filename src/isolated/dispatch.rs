use crate::error::{Error, Result};
use crate::executor::task::{TaskId, TaskOutcome};
use crate::future::{CancelToken, Future};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Instant;

/// The host-side end of a future whose value comes back as JSON.
pub(crate) trait Completion: Send {
    fn start(&self) -> Result<bool>;
    fn cancel(&self) -> bool;
    fn token(&self) -> CancelToken;
    fn finish(self: Box<Self>, result: Result<Vec<Value>>) -> TaskOutcome;
}

struct Decoding<T> {
    future: Future<T>,
    decode: fn(Vec<Value>) -> Result<T>,
}

impl<T: Send + 'static> Completion for Decoding<T> {
    fn start(&self) -> Result<bool> {
        self.future.set_running()
    }

    fn cancel(&self) -> bool {
        self.future.cancel()
    }

    fn token(&self) -> CancelToken {
        self.future.cancel_token()
    }

    fn finish(self: Box<Self>, result: Result<Vec<Value>>) -> TaskOutcome {
        let decode = self.decode;
        let (completion, outcome) = match result.and_then(decode) {
            Ok(value) => (self.future.set_result(value), TaskOutcome::Fulfilled),
            Err(Error::Task(e)) if e.is_panic() => (
                self.future.set_exception(Error::Task(e)),
                TaskOutcome::Panicked,
            ),
            Err(e) => (self.future.set_exception(e), TaskOutcome::Failed),
        };
        if let Err(e) = completion {
            tracing::error!(task = %self.future.id(), error = %e, "could not record task outcome");
        }
        outcome
    }
}

fn decode_single<R: DeserializeOwned>(values: Vec<Value>) -> Result<R> {
    let value = values
        .into_iter()
        .next()
        .ok_or_else(|| Error::Serialization("worker returned no value".into()))?;
    Ok(serde_json::from_value(value)?)
}

fn decode_batch<R: DeserializeOwned>(values: Vec<Value>) -> Result<Vec<R>> {
    values
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(Error::from))
        .collect()
}

/// One queued request for an isolated worker.
pub(crate) struct Dispatch {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) payloads: Vec<Value>,
    pub(crate) completion: Box<dyn Completion>,
    pub(crate) queued_at: Instant,
}

impl Dispatch {
    pub(crate) fn single<R>(future: &Future<R>, name: &str, payload: Value) -> Self
    where
        R: DeserializeOwned + Send + 'static,
    {
        Self::new(
            future.id(),
            name,
            vec![payload],
            Box::new(Decoding {
                future: future.clone(),
                decode: decode_single::<R>,
            }),
        )
    }

    pub(crate) fn batch<R>(future: &Future<Vec<R>>, name: &str, payloads: Vec<Value>) -> Self
    where
        R: DeserializeOwned + Send + 'static,
    {
        Self::new(
            future.id(),
            name,
            payloads,
            Box::new(Decoding {
                future: future.clone(),
                decode: decode_batch::<R>,
            }),
        )
    }

    fn new(id: TaskId, name: &str, payloads: Vec<Value>, completion: Box<dyn Completion>) -> Self {
        Self {
            id,
            name: name.to_string(),
            payloads,
            completion,
            queued_at: Instant::now(),
        }
    }
}
