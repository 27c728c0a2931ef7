//! Run-tagged events and the per-run subscriber registry.
//!
//! Tasks emit onto one outward stream. Every event is tagged with its run id
//! at the point of send, and [`RunChannels`] delivers it to the subscribers
//! of that run only.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use engine::{EngineError, MemorySnapshot};
use sandbox::{JobLog, RuntimeError, Severity};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::PoolError;

/// An event tagged with the run that raised it.
#[derive(Debug, Clone)]
pub struct Tagged<E> {
    pub run_id: String,
    pub event: E,
}

struct Subscribers<E> {
    /// Runs that have started, with their live subscribers.
    active: HashMap<String, Vec<mpsc::UnboundedSender<E>>>,
    /// Subscribers waiting for a run that has not started yet.
    pending: HashMap<String, Vec<mpsc::UnboundedSender<E>>>,
}

/// Two-phase subscriber registry.
///
/// `subscribe` before `open` parks the subscriber; `open` creates the run's
/// channel and attaches everything parked for it under the same lock, so no
/// event sent after `open` can be missed.
pub struct RunChannels<E> {
    inner: Mutex<Subscribers<E>>,
}

impl<E> Default for RunChannels<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Subscribers {
                active: HashMap::new(),
                pending: HashMap::new(),
            }),
        }
    }
}

impl<E: Clone> RunChannels<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive every event of `run_id` from now on.
    pub fn subscribe(&self, run_id: &str) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.active.get_mut(run_id) {
            Some(subscribers) => subscribers.push(tx),
            None => inner.pending.entry(run_id.to_string()).or_default().push(tx),
        }
        rx
    }

    /// Start `run_id`, attaching parked subscribers, and return one more
    /// subscription for the caller.
    pub fn open(&self, run_id: &str) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let mut subscribers = inner.pending.remove(run_id).unwrap_or_default();
        subscribers.push(tx);
        inner.active.insert(run_id.to_string(), subscribers);
        rx
    }

    /// Deliver an event to its run's subscribers. Returns how many got it.
    pub fn publish(&self, tagged: Tagged<E>) -> usize {
        let mut inner = self.lock();
        let Some(subscribers) = inner.active.get_mut(&tagged.run_id) else {
            trace!(run_id = %tagged.run_id, "dropping event for unknown run");
            return 0;
        };
        subscribers.retain(|tx| tx.send(tagged.event.clone()).is_ok());
        subscribers.len()
    }

    /// Forget `run_id`; its subscribers see the stream end.
    pub fn close(&self, run_id: &str) {
        self.lock().active.remove(run_id);
    }

    pub fn is_open(&self, run_id: &str) -> bool {
        self.lock().active.contains_key(run_id)
    }
}

/// Everything observers of a run can hear about it, in emission order.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    WorkflowStart {
        thread_id: String,
    },
    JobStart {
        job_id: String,
        thread_id: String,
    },
    JobComplete {
        job_id: String,
        thread_id: String,
        duration: Duration,
        state: Value,
        serialized_state: String,
        next: Vec<String>,
        mem: MemorySnapshot,
    },
    JobError {
        job_id: String,
        thread_id: String,
        duration: Duration,
        error: RuntimeError,
        state: Value,
        next: Vec<String>,
    },
    Log(JobLog),
    WorkflowComplete {
        state: Value,
        duration: Duration,
    },
    WorkflowError {
        error: RunFailure,
        duration: Duration,
    },
}

impl EngineEvent {
    /// `true` for the last event a run emits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::WorkflowComplete { .. } | EngineEvent::WorkflowError { .. }
        )
    }
}

/// Why a run ended early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub severity: Severity,
    pub error_type: String,
    pub message: String,
}

impl From<&EngineError> for RunFailure {
    fn from(err: &EngineError) -> Self {
        let message = match err {
            EngineError::Runtime(inner) => inner.message(),
            other => other.to_string(),
        };
        Self {
            severity: err.severity(),
            error_type: err.error_type().to_string(),
            message,
        }
    }
}

impl From<&PoolError> for RunFailure {
    fn from(err: &PoolError) -> Self {
        let (severity, error_type) = match err {
            PoolError::Timeout(_) => (Severity::Kill, "TimeoutError"),
            PoolError::MemoryLimitExceeded { .. } => (Severity::Kill, "OOMError"),
            PoolError::Shutdown | PoolError::WorkerLost(_) | PoolError::Spawn(_) => {
                (Severity::Crash, "ExitError")
            }
        };
        Self {
            severity,
            error_type: error_type.to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(run_id: &str, event: u32) -> Tagged<u32> {
        Tagged {
            run_id: run_id.into(),
            event,
        }
    }

    #[tokio::test]
    async fn early_subscribers_are_attached_on_open() {
        let channels = RunChannels::new();
        let mut early = channels.subscribe("r1");

        // Nothing is delivered before the run opens.
        assert_eq!(channels.publish(tagged("r1", 1)), 0);

        let mut own = channels.open("r1");
        assert_eq!(channels.publish(tagged("r1", 2)), 2);

        assert_eq!(early.recv().await, Some(2));
        assert_eq!(own.recv().await, Some(2));
    }

    #[tokio::test]
    async fn events_only_reach_their_run() {
        let channels = RunChannels::new();
        let mut a = channels.open("a");
        let mut b = channels.open("b");

        channels.publish(tagged("a", 1));
        channels.publish(tagged("b", 2));
        channels.close("a");
        channels.close("b");

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, Some(2));
        assert_eq!(b.recv().await, None);
    }
}
