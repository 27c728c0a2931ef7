//! `MockOperation` — a test double for `Operation`.
//!
//! Useful in unit and integration tests where real job logic is either
//! unavailable or irrelevant.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Operation, OperationContext, RuntimeError};
use crate::traits::LogLevel;

/// Behaviour injected into `MockOperation` at construction time.
pub enum MockBehaviour {
    /// Merge the given object into the incoming state's `data`.
    MergeData(Value),
    /// Replace the state outright.
    ReturnValue(Value),
    /// Fail with the given error.
    Fail(RuntimeError),
    /// Wait (asynchronously) and pass the state through.
    Sleep(Duration),
    /// Block the executing thread and pass the state through.
    Block(Duration),
}

/// A mock operation that records every state it receives and does what it
/// was told to.
pub struct MockOperation {
    /// Label used in test assertions and in log lines.
    pub name: String,
    pub behaviour: MockBehaviour,
    /// All states seen by this operation (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
}

impl MockOperation {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A mock that merges `data` into `state.data`.
    pub fn merging(name: impl Into<String>, data: Value) -> Self {
        Self::with(name, MockBehaviour::MergeData(data))
    }

    /// A mock that always returns `value` as the new state.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    /// A mock that always fails with `error`.
    pub fn failing(name: impl Into<String>, error: RuntimeError) -> Self {
        Self::with(name, MockBehaviour::Fail(error))
    }

    pub fn sleeping(name: impl Into<String>, duration: Duration) -> Self {
        Self::with(name, MockBehaviour::Sleep(duration))
    }

    /// A mock that hogs its thread; used to exercise wall-clock limits.
    pub fn blocking(name: impl Into<String>, duration: Duration) -> Self {
        Self::with(name, MockBehaviour::Block(duration))
    }

    /// Number of times this operation has been executed.
    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Shared handle to the recorded calls, usable after the mock is moved
    /// into a plan.
    pub fn recorder(&self) -> Arc<Mutex<Vec<Value>>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Operation for MockOperation {
    async fn execute(&self, state: Value, ctx: &OperationContext) -> Result<Value, RuntimeError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state.clone());
        ctx.log(LogLevel::Info, format!("mock '{}' called", self.name));

        match &self.behaviour {
            MockBehaviour::MergeData(data) => {
                let mut out = state;
                if !out.is_object() {
                    out = Value::Object(Default::default());
                }
                if let Some(obj) = out.as_object_mut() {
                    let target = obj
                        .entry("data")
                        .or_insert_with(|| Value::Object(Default::default()));
                    if let (Some(target), Some(extra)) = (target.as_object_mut(), data.as_object()) {
                        for (k, v) in extra {
                            target.insert(k.clone(), v.clone());
                        }
                    }
                }
                Ok(out)
            }
            MockBehaviour::ReturnValue(v) => Ok(v.clone()),
            MockBehaviour::Fail(err) => Err(err.clone()),
            MockBehaviour::Sleep(d) => {
                tokio::time::sleep(*d).await;
                Ok(state)
            }
            MockBehaviour::Block(d) => {
                std::thread::sleep(*d);
                Ok(state)
            }
        }
    }
}
