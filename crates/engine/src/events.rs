//! Lifecycle notifications raised while a plan runs, and the callbacks the
//! runtime uses to reach the outside world.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{JobLog, RuntimeError};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::memory::MemorySnapshot;
use crate::models::JobId;

#[derive(Debug, Clone)]
pub enum Notification {
    /// A job started resolving its inputs.
    InitStart { job_id: JobId },
    InitComplete { job_id: JobId, duration: Duration },
    /// Job logic is about to run.
    JobStart { job_id: JobId },
    JobComplete {
        job_id: JobId,
        duration: Duration,
        state: Value,
        /// `state` already serialized, so observers need not do it again.
        serialized: String,
        next: Vec<JobId>,
        mem: MemorySnapshot,
    },
    JobError {
        job_id: JobId,
        duration: Duration,
        error: RuntimeError,
        state: Value,
        next: Vec<JobId>,
    },
    /// A referenced initial state was fetched.
    StateLoad { id: String, duration: Duration },
    Log(JobLog),
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ResolveError(pub String);

/// Fetches lazily-referenced inputs.
#[async_trait]
pub trait Resolvers: Send + Sync {
    async fn resolve_credential(&self, id: &str) -> Result<Value, ResolveError>;
    async fn resolve_state(&self, id: &str) -> Result<Value, ResolveError>;
}

pub type Notify = Arc<dyn Fn(Notification) + Send + Sync>;

/// Hooks handed to a run.
#[derive(Clone, Default)]
pub struct Callbacks {
    notify: Option<Notify>,
    resolvers: Option<Arc<dyn Resolvers>>,
    cancel: Option<CancellationToken>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notify(mut self, notify: impl Fn(Notification) + Send + Sync + 'static) -> Self {
        self.notify = Some(Arc::new(notify));
        self
    }

    pub fn with_resolvers(mut self, resolvers: Arc<dyn Resolvers>) -> Self {
        self.resolvers = Some(resolvers);
        self
    }

    /// Once `cancel` fires, no further job starts.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    pub fn notify(&self, notification: Notification) {
        if let Some(notify) = &self.notify {
            notify(notification);
        }
    }

    pub fn notifier(&self) -> Option<Notify> {
        self.notify.clone()
    }

    pub fn resolvers(&self) -> Option<&Arc<dyn Resolvers>> {
        self.resolvers.as_ref()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("notify", &self.notify.is_some())
            .field("resolvers", &self.resolvers.is_some())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
