//! Named task callables.
//!
//! Isolated workers cannot receive closures, so every task runnable by name
//! is registered here. Each entry keeps two views of the same callable: a
//! typed one the thread backend calls directly, and a JSON one used across
//! the process boundary or when the caller's types differ from the
//! registered ones.

use crate::error::{Error, Result, TaskError};
use crate::executor::task::TaskContext;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

/// A registered callable with its argument and result types restored.
pub type TaskFn<A, R> = Arc<dyn Fn(&TaskContext, A) -> std::result::Result<R, TaskError> + Send + Sync>;

type ValueFn = TaskFn<Value, Value>;

#[derive(Clone)]
struct Entry {
    typed: Arc<dyn Any + Send + Sync>,
    erased: ValueFn,
    signature: (&'static str, &'static str),
}

#[derive(Clone, Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an infallible callable.
    pub fn register<A, R, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        self.register_with_context(name, move |_: &TaskContext, arg: A| {
            Ok::<R, Infallible>(f(arg))
        })
    }

    /// Register a callable whose `Err` becomes the task's failure.
    pub fn register_fallible<A, R, E, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        E: fmt::Display + 'static,
        F: Fn(A) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        self.register_with_context(name, move |_: &TaskContext, arg: A| f(arg))
    }

    /// Register a callable that also receives its [`TaskContext`], for
    /// cooperative interruption.
    ///
    /// Registering a name twice replaces the earlier callable.
    pub fn register_with_context<A, R, E, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        E: fmt::Display + 'static,
        F: Fn(&TaskContext, A) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let typed: TaskFn<A, R> =
            Arc::new(move |ctx: &TaskContext, arg: A| f(ctx, arg).map_err(TaskError::from_display));

        let erased: ValueFn = {
            let typed = typed.clone();
            Arc::new(move |ctx: &TaskContext, arg: Value| {
                let arg: A = serde_json::from_value(arg)
                    .map_err(|e| TaskError::new("ArgumentError", e.to_string()))?;
                let out = typed(ctx, arg)?;
                serde_json::to_value(out).map_err(|e| TaskError::new("SerializationError", e.to_string()))
            })
        };

        let entry = Entry {
            typed: Arc::new(typed),
            erased,
            signature: (type_name::<A>(), type_name::<R>()),
        };
        if self.entries.insert(name.to_string(), entry).is_some() {
            tracing::warn!(task = name, "replacing previously registered task");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Argument and result type names of a registered task.
    pub fn signature(&self, name: &str) -> Option<(&'static str, &'static str)> {
        self.entries.get(name).map(|e| e.signature)
    }

    /// Look up `name` as a callable from `A` to `R`.
    ///
    /// When the types match the registration the callable is returned as
    /// is. Otherwise calls are bridged through JSON, so a task registered on
    /// `u64` can still be driven with a `serde_json::Value`.
    pub fn resolve<A, R>(&self, name: &str) -> Result<TaskFn<A, R>>
    where
        A: Serialize + 'static,
        R: DeserializeOwned + 'static,
    {
        let entry = self.entry(name)?;
        if let Some(typed) = entry.typed.downcast_ref::<TaskFn<A, R>>() {
            return Ok(typed.clone());
        }
        let erased = entry.erased.clone();
        Ok(Arc::new(move |ctx: &TaskContext, arg: A| {
            let arg = serde_json::to_value(arg)
                .map_err(|e| TaskError::new("SerializationError", e.to_string()))?;
            let out = erased(ctx, arg)?;
            serde_json::from_value(out).map_err(|e| TaskError::new("DeserializationError", e.to_string()))
        }))
    }

    /// Call `name` with a JSON argument, as an isolated worker does.
    pub fn call_value(
        &self,
        ctx: &TaskContext,
        name: &str,
        arg: Value,
    ) -> std::result::Result<Value, TaskError> {
        match self.entries.get(name) {
            Some(entry) => (entry.erased)(ctx, arg),
            None => Err(TaskError::new(
                "UnknownTask",
                format!("no task named `{}` is registered in this worker", name),
            )),
        }
    }

    fn entry(&self, name: &str) -> Result<&Entry> {
        self.entries
            .get(name)
            .ok_or_else(|| Error::submission(format!("no task named `{}` is registered", name)))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tasks", &self.names())
            .finish()
    }
}
