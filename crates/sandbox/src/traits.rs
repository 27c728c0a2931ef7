//! The `Operation` and `Sandbox` traits, and the context handed to job logic.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Expression, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A line logged by job logic while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub job_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Receives every [`JobLog`] emitted by job logic.
pub type LogSink = Arc<dyn Fn(JobLog) + Send + Sync>;

/// Context passed to every operation while a job runs.
#[derive(Clone)]
pub struct OperationContext {
    job_id: String,
    logs: Option<LogSink>,
}

impl OperationContext {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            logs: None,
        }
    }

    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.logs = Some(sink);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Forward a log line to whoever is observing this job.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        if let Some(sink) = &self.logs {
            sink(JobLog {
                job_id: self.job_id.clone(),
                level,
                message: message.into(),
                timestamp: Utc::now(),
            });
        }
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("job_id", &self.job_id)
            .field("logs", &self.logs.is_some())
            .finish()
    }
}

/// A single state-to-state step of job logic.
///
/// Operations receive the current state and return the next one. Adaptor
/// functions, test doubles and compiled job bodies all implement this.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn execute(&self, state: Value, ctx: &OperationContext) -> Result<Value, RuntimeError>;
}

/// Adapts a plain closure into an [`Operation`].
pub struct FnOperation<F>(F);

#[async_trait]
impl<F> Operation for FnOperation<F>
where
    F: Fn(Value) -> Result<Value, RuntimeError> + Send + Sync,
{
    async fn execute(&self, state: Value, _ctx: &OperationContext) -> Result<Value, RuntimeError> {
        (self.0)(state)
    }
}

/// Wrap a synchronous closure as a shareable operation.
pub fn operation<F>(f: F) -> Arc<dyn Operation>
where
    F: Fn(Value) -> Result<Value, RuntimeError> + Send + Sync + 'static,
{
    Arc::new(FnOperation(f))
}

/// Raised by a sandbox when job logic fails.
///
/// `state` is the last state the job produced before the failure, so soft
/// failures can still pass a useful state downstream.
#[derive(Debug, Clone)]
pub struct ExpressionFailure {
    pub error: RuntimeError,
    pub state: Value,
}

/// Runs job logic against an input state.
///
/// The runtime never assumes anything about how job logic is evaluated; it
/// only calls this capability.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        expression: &Expression,
        state: Value,
        ctx: &OperationContext,
    ) -> Result<Value, ExpressionFailure>;
}
