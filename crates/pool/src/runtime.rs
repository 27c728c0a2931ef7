//! Multi-run orchestration on top of the worker pool.
//!
//! `RuntimeEngine` owns the pool, the per-run subscriber registry and the
//! state of every run it was asked to execute. Each run is dispatched as one
//! pool task that walks the whole plan on a worker thread.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use engine::{
    execute_plan, Callbacks, EngineError, ExecutionOptions, ExecutionPlan, Notification, Resolvers,
};
use sandbox::{Sandbox, StandardSandbox};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::error::PoolError;
use crate::events::{EngineEvent, RunChannels, RunFailure, Tagged};
use crate::pool::{DispatchOptions, PoolConfig, WorkerPool};
use crate::worker::WorkerContext;

#[derive(Clone)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    /// Defaults applied to every run.
    pub execution: ExecutionOptions,
    pub sandbox: Arc<dyn Sandbox>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            execution: ExecutionOptions::default(),
            sandbox: Arc::new(StandardSandbox),
        }
    }
}

/// Per-run overrides.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Wall-clock budget for the whole run.
    pub timeout: Option<Duration>,
    pub memory_limit_mb: Option<u64>,
    /// Wall-clock budget for each job.
    pub job_timeout: Option<Duration>,
    pub resolvers: Option<Arc<dyn Resolvers>>,
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("timeout", &self.timeout)
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("job_timeout", &self.job_timeout)
            .field("resolvers", &self.resolvers.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Done,
    Err,
}

/// What the engine knows about one run.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub id: String,
    pub status: WorkflowStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub thread_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<RunFailure>,
    pub plan: ExecutionPlan,
    pub options: RunOptions,
}

/// A started run and its event stream.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: String,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

/// Cheap to clone; every clone drives the same pool.
#[derive(Clone)]
pub struct RuntimeEngine {
    inner: Arc<Inner>,
}

struct Inner {
    pool: WorkerPool<EngineEvent>,
    channels: Arc<RunChannels<EngineEvent>>,
    states: Mutex<HashMap<String, WorkflowState>>,
    execution: ExecutionOptions,
    sandbox: Arc<dyn Sandbox>,
}

impl RuntimeEngine {
    /// Start the engine. Must be called from within a Tokio runtime.
    pub fn new(config: EngineConfig) -> Self {
        let (pool, stream) = WorkerPool::new(config.pool);
        let channels = Arc::new(RunChannels::new());
        tokio::spawn(route(stream, Arc::clone(&channels)));
        info!(workers = pool.capacity(), "runtime engine ready");
        Self {
            inner: Arc::new(Inner {
                pool,
                channels,
                states: Mutex::new(HashMap::new()),
                execution: config.execution,
                sandbox: config.sandbox,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    /// Subscribe to a run's events, before or after it starts.
    pub fn listen(&self, run_id: &str) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.inner.channels.subscribe(run_id)
    }

    /// Register `plan` and dispatch it to the pool.
    ///
    /// The run id is the plan's id, or a fresh UUID when it has none.
    ///
    /// # Errors
    /// [`PoolError::Shutdown`] once the engine is being destroyed.
    #[instrument(skip_all, fields(run_id))]
    pub fn execute(&self, mut plan: ExecutionPlan, options: RunOptions) -> Result<RunHandle, PoolError> {
        if self.inner.pool.is_shutting_down() {
            return Err(PoolError::Shutdown);
        }
        let run_id = plan
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        plan.id = Some(run_id.clone());
        tracing::Span::current().record("run_id", run_id.as_str());

        self.inner.lock_states().insert(
            run_id.clone(),
            WorkflowState {
                id: run_id.clone(),
                status: WorkflowStatus::Pending,
                start_time: None,
                duration: None,
                thread_id: None,
                result: None,
                error: None,
                plan: plan.clone(),
                options: options.clone(),
            },
        );

        let events = self.inner.channels.open(&run_id);
        info!(run_id = %run_id, "run registered");

        let inner = Arc::clone(&self.inner);
        let id = run_id.clone();
        tokio::spawn(async move { inner.run(id, plan, options).await });

        Ok(RunHandle { run_id, events })
    }

    pub fn status(&self, run_id: &str) -> Option<WorkflowStatus> {
        self.inner.lock_states().get(run_id).map(|s| s.status)
    }

    pub fn workflow(&self, run_id: &str) -> Option<WorkflowState> {
        self.inner.lock_states().get(run_id).cloned()
    }

    /// Runs that are pending or running.
    pub fn active_runs(&self) -> usize {
        self.inner
            .lock_states()
            .values()
            .filter(|s| matches!(s.status, WorkflowStatus::Pending | WorkflowStatus::Running))
            .count()
    }

    /// Forget a finished run.
    pub fn remove(&self, run_id: &str) -> Option<WorkflowState> {
        self.inner.lock_states().remove(run_id)
    }

    /// Stop accepting runs and shut the pool down.
    pub async fn destroy(&self, instant: bool) {
        self.inner.pool.destroy(instant).await;
    }
}

impl Inner {
    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkflowState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, run_id: &str, f: impl FnOnce(&mut WorkflowState)) {
        if let Some(state) = self.lock_states().get_mut(run_id) {
            f(state);
        }
    }

    async fn run(&self, run_id: String, plan: ExecutionPlan, options: RunOptions) {
        let started = Instant::now();
        self.update(&run_id, |s| {
            s.status = WorkflowStatus::Running;
            s.start_time = Some(Utc::now());
        });

        let mut execution = self.execution.clone();
        if let Some(job_timeout) = options.job_timeout {
            execution.job_timeout = Some(job_timeout);
        }
        let sandbox = Arc::clone(&self.sandbox);
        let resolvers = options.resolvers.clone();
        let dispatch = DispatchOptions {
            timeout: options.timeout,
            memory_limit_mb: options.memory_limit_mb,
        };

        let outcome = self
            .pool
            .dispatch(&run_id, dispatch, move |ctx| {
                run_plan(ctx, plan, execution, resolvers, sandbox)
            })
            .await;
        let duration = started.elapsed();

        let event = match outcome {
            Ok((thread_id, Ok(state))) => {
                info!(run_id = %run_id, duration_ms = duration.as_millis() as u64, "run complete");
                self.update(&run_id, |s| {
                    s.status = WorkflowStatus::Done;
                    s.duration = Some(duration);
                    s.thread_id = Some(thread_id);
                    s.result = Some(state.clone());
                });
                EngineEvent::WorkflowComplete { state, duration }
            }
            Ok((thread_id, Err(err))) => {
                self.fail(&run_id, RunFailure::from(&err), duration, Some(thread_id))
            }
            Err(err) => self.fail(&run_id, RunFailure::from(&err), duration, None),
        };

        // Sent on the pool stream so it lands after the run's job events.
        if let Err(lost) = self.pool.emitter().send(Tagged { run_id, event }) {
            debug!(run_id = %lost.0.run_id, "event stream closed, terminal event dropped");
        }
    }

    fn fail(
        &self,
        run_id: &str,
        failure: RunFailure,
        duration: Duration,
        thread_id: Option<String>,
    ) -> EngineEvent {
        error!(
            run_id,
            severity = %failure.severity,
            error_type = %failure.error_type,
            "run failed: {}",
            failure.message
        );
        self.update(run_id, |s| {
            s.status = WorkflowStatus::Err;
            s.duration = Some(duration);
            s.thread_id = thread_id;
            s.error = Some(failure.clone());
        });
        EngineEvent::WorkflowError {
            error: failure,
            duration,
        }
    }
}

/// Demultiplex the pool's outward stream onto per-run subscribers.
async fn route(
    mut stream: mpsc::UnboundedReceiver<Tagged<EngineEvent>>,
    channels: Arc<RunChannels<EngineEvent>>,
) {
    while let Some(tagged) = stream.recv().await {
        let closing = tagged.event.is_terminal().then(|| tagged.run_id.clone());
        channels.publish(tagged);
        if let Some(run_id) = closing {
            channels.close(&run_id);
        }
    }
    debug!("event router stopped");
}

/// The task each run executes on its worker.
async fn run_plan(
    ctx: WorkerContext<EngineEvent>,
    plan: ExecutionPlan,
    options: ExecutionOptions,
    resolvers: Option<Arc<dyn Resolvers>>,
    sandbox: Arc<dyn Sandbox>,
) -> (String, Result<Value, EngineError>) {
    let thread_id = ctx.thread_id();
    ctx.emit(EngineEvent::WorkflowStart {
        thread_id: thread_id.clone(),
    });

    let forward = ctx.clone();
    let tid = thread_id.clone();
    let mut callbacks = Callbacks::new()
        .with_cancellation(ctx.cancellation())
        .with_notify(move |notification| {
            if let Some(event) = translate(notification, &tid) {
                forward.emit(event);
            }
        });
    if let Some(resolvers) = resolvers {
        callbacks = callbacks.with_resolvers(resolvers);
    }

    let result = execute_plan(plan, &options, &callbacks, sandbox.as_ref()).await;
    (thread_id, result)
}

fn translate(notification: Notification, thread_id: &str) -> Option<EngineEvent> {
    match notification {
        Notification::JobStart { job_id } => Some(EngineEvent::JobStart {
            job_id,
            thread_id: thread_id.to_string(),
        }),
        Notification::JobComplete {
            job_id,
            duration,
            state,
            serialized,
            next,
            mem,
        } => Some(EngineEvent::JobComplete {
            job_id,
            thread_id: thread_id.to_string(),
            duration,
            state,
            serialized_state: serialized,
            next,
            mem,
        }),
        Notification::JobError {
            job_id,
            duration,
            error,
            state,
            next,
        } => Some(EngineEvent::JobError {
            job_id,
            thread_id: thread_id.to_string(),
            duration,
            error,
            state,
            next,
        }),
        Notification::Log(log) => Some(EngineEvent::Log(log)),
        Notification::InitStart { job_id } => {
            debug!(job_id = %job_id, "resolving job inputs");
            None
        }
        Notification::InitComplete { job_id, duration } => {
            debug!(job_id = %job_id, duration_ms = duration.as_millis() as u64, "job inputs ready");
            None
        }
        Notification::StateLoad { id, duration } => {
            debug!(dataclip_id = %id, duration_ms = duration.as_millis() as u64, "loaded initial state");
            None
        }
    }
}
