//! Drive one run through the engine and report its progress to the queue.
//!
//! Events are handled one at a time, and each push waits for the queue's
//! reply before the next event is looked at.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use engine::{ExecutionPlan, Lazy, MemorySnapshot, NextSpec};
use indexmap::IndexMap;
use pool::{EngineEvent, RunFailure, RunOptions, RuntimeEngine};
use sandbox::{JobLog, RuntimeError};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::channel::{self, Channel};
use crate::protocol::{
    ExitReason, RunCompletePayload, RunLogPayload, StepCompletePayload, StepStartPayload,
    RUN_COMPLETE, RUN_LOG, STEP_COMPLETE, STEP_START,
};
use crate::reasons::{calculate_job_exit_reason, calculate_run_exit_reason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOptions {
    /// Send each step's output body with `step:complete`.
    pub output_dataclips: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            output_dataclips: true,
        }
    }
}

/// What the reporter tracks about a run it is reporting on.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub last_dataclip_id: Option<String>,
    pub dataclips: HashMap<String, Value>,
    /// Input dataclip id of each job that has one.
    pub input_dataclips: HashMap<String, String>,
    /// Exit reason of each finished job, in finishing order.
    pub reasons: IndexMap<String, ExitReason>,
    pub active_step: Option<String>,
    pub active_job: Option<String>,
}

impl RunState {
    /// When the initial state is a dataclip reference, it is the input of the
    /// start job, or of every job a start trigger leads to.
    pub fn new(plan: &ExecutionPlan) -> Self {
        let mut state = Self::default();
        let Some(Lazy::Reference(dataclip_id)) = &plan.options.initial_state else {
            return state;
        };

        let start = match &plan.options.start {
            Some(start) => plan.jobs.iter().find(|j| j.id.as_ref() == Some(start)),
            None => plan.jobs.first(),
        };
        let Some(start) = start else {
            return state;
        };

        if start.expression.is_some() {
            if let Some(id) = &start.id {
                state.input_dataclips.insert(id.clone(), dataclip_id.clone());
            }
            return state;
        }
        match &start.next {
            Some(NextSpec::Target(target)) => {
                state.input_dataclips.insert(target.clone(), dataclip_id.clone());
            }
            Some(NextSpec::Edges(edges)) => {
                for target in edges.keys() {
                    state.input_dataclips.insert(target.clone(), dataclip_id.clone());
                }
            }
            None => {}
        }
        state
    }
}

/// A finished step, whichever way it ended.
pub struct StepOutcome<'a> {
    pub job_id: &'a str,
    pub state: &'a Value,
    /// Pre-serialized output, when the engine already produced it.
    pub serialized: Option<&'a str>,
    pub next: &'a [String],
    pub mem: MemorySnapshot,
    pub duration: Duration,
    pub thread_id: Option<&'a str>,
    pub error: Option<&'a RuntimeError>,
    /// Overrides the reason derived from `state` and `error`.
    pub exit: Option<ExitReason>,
}

/// Translates one run's engine events into queue events.
pub struct RunReporter {
    run_id: String,
    channel: Arc<dyn Channel>,
    options: ReportOptions,
    state: RunState,
}

impl RunReporter {
    pub fn new(run_id: impl Into<String>, channel: Arc<dyn Channel>, plan: &ExecutionPlan, options: ReportOptions) -> Self {
        Self {
            run_id: run_id.into(),
            channel,
            options,
            state: RunState::new(plan),
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Report one engine event. Returns the run's exit reason once the run
    /// is over.
    pub async fn handle(&mut self, event: EngineEvent) -> Option<ExitReason> {
        match event {
            EngineEvent::WorkflowStart { thread_id } => {
                debug!(run_id = %self.run_id, thread_id = %thread_id, "run started on worker");
                None
            }
            EngineEvent::JobStart { job_id, .. } => {
                self.step_start(&job_id).await;
                None
            }
            EngineEvent::JobComplete {
                job_id,
                thread_id,
                duration,
                state,
                serialized_state,
                next,
                mem,
            } => {
                self.step_complete(StepOutcome {
                    job_id: &job_id,
                    state: &state,
                    serialized: Some(serialized_state.as_str()),
                    next: &next,
                    mem,
                    duration,
                    thread_id: Some(thread_id.as_str()),
                    error: None,
                    exit: None,
                })
                .await;
                None
            }
            EngineEvent::JobError {
                job_id,
                thread_id,
                duration,
                error,
                state,
                next,
            } => {
                self.step_complete(StepOutcome {
                    job_id: &job_id,
                    state: &state,
                    serialized: None,
                    next: &next,
                    mem: MemorySnapshot::default(),
                    duration,
                    thread_id: Some(thread_id.as_str()),
                    error: Some(&error),
                    exit: None,
                })
                .await;
                None
            }
            EngineEvent::Log(log) => {
                self.run_log(log).await;
                None
            }
            EngineEvent::WorkflowComplete { duration, .. } => Some(self.run_complete(duration).await),
            EngineEvent::WorkflowError { error, duration } => Some(self.run_error(&error, duration).await),
        }
    }

    pub async fn step_start(&mut self, job_id: &str) {
        let step_id = Uuid::new_v4().to_string();
        self.state.active_step = Some(step_id.clone());
        self.state.active_job = Some(job_id.to_string());

        let payload = StepStartPayload {
            job_id: job_id.to_string(),
            step_id,
            input_dataclip_id: self.state.input_dataclips.get(job_id).cloned(),
        };
        self.send(STEP_START, &payload).await;
    }

    pub async fn step_complete(&mut self, outcome: StepOutcome<'_>) {
        let dataclip_id = Uuid::new_v4().to_string();
        let step_id = self
            .state
            .active_step
            .take()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.state.active_job = None;

        self.state
            .dataclips
            .insert(dataclip_id.clone(), outcome.state.clone());
        self.state.last_dataclip_id = Some(dataclip_id.clone());
        for next in outcome.next {
            self.state
                .input_dataclips
                .insert(next.clone(), dataclip_id.clone());
        }

        let exit = outcome.exit.unwrap_or_else(|| {
            calculate_job_exit_reason(outcome.job_id, outcome.state, outcome.error)
        });
        self.state
            .reasons
            .insert(outcome.job_id.to_string(), exit.clone());

        let output_dataclip = self.options.output_dataclips.then(|| match outcome.serialized {
            Some(serialized) => serialized.to_string(),
            None => outcome.state.to_string(),
        });

        let payload = StepCompletePayload {
            step_id,
            job_id: outcome.job_id.to_string(),
            output_dataclip_id: dataclip_id,
            output_dataclip,
            exit,
            mem: outcome.mem,
            duration: outcome.duration.as_millis() as u64,
            thread_id: outcome.thread_id.map(str::to_string),
        };
        self.send(STEP_COMPLETE, &payload).await;
    }

    pub async fn run_log(&mut self, log: JobLog) {
        let payload = RunLogPayload {
            run_id: self.run_id.clone(),
            job_id: log.job_id,
            step_id: self.state.active_step.clone(),
            level: log.level,
            message: log.message,
            source: "JOB".to_string(),
            timestamp: log.timestamp,
        };
        self.send(RUN_LOG, &payload).await;
    }

    pub async fn run_complete(&mut self, duration: Duration) -> ExitReason {
        let exit = calculate_run_exit_reason(&self.state.reasons);
        info!(
            run_id = %self.run_id,
            reason = ?exit.reason,
            duration_ms = duration.as_millis() as u64,
            "run complete"
        );
        let payload = RunCompletePayload {
            final_dataclip_id: self.state.last_dataclip_id.clone(),
            exit: exit.clone(),
        };
        self.send(RUN_COMPLETE, &payload).await;
        exit
    }

    /// A fatal error ended the run. The step that was running, if any, is
    /// closed with the same reason first.
    pub async fn run_error(&mut self, failure: &RunFailure, duration: Duration) -> ExitReason {
        let exit = ExitReason::from(failure);
        if let Some(job_id) = self.state.active_job.clone() {
            let state = self
                .state
                .last_dataclip_id
                .as_ref()
                .and_then(|id| self.state.dataclips.get(id))
                .cloned()
                .unwrap_or(Value::Null);
            self.step_complete(StepOutcome {
                job_id: &job_id,
                state: &state,
                serialized: None,
                next: &[],
                mem: MemorySnapshot::default(),
                duration,
                thread_id: None,
                error: None,
                exit: Some(exit.clone()),
            })
            .await;
        }

        warn!(
            run_id = %self.run_id,
            reason = ?exit.reason,
            error_type = ?exit.error_type,
            "run failed"
        );
        let payload = RunCompletePayload {
            final_dataclip_id: self.state.last_dataclip_id.clone(),
            exit: exit.clone(),
        };
        self.send(RUN_COMPLETE, &payload).await;
        exit
    }

    async fn send<P: Serialize>(&self, event: &str, payload: &P) {
        if let Err(e) = channel::send(self.channel.as_ref(), event, payload).await {
            warn!(run_id = %self.run_id, event, error = %e, "queue did not accept event");
        }
    }
}

/// Execute `plan` on `engine` and report everything it does on `channel`.
///
/// Always ends with a `workflow:complete` push, even when the engine refuses
/// the run.
#[instrument(skip_all, fields(run_id = plan.id.as_deref().unwrap_or_default()))]
pub async fn execute_run(
    engine: &RuntimeEngine,
    channel: Arc<dyn Channel>,
    plan: ExecutionPlan,
    options: RunOptions,
    report: ReportOptions,
) -> ExitReason {
    let run_id = plan.id.clone().unwrap_or_default();
    let mut reporter = RunReporter::new(run_id.clone(), channel, &plan, report);

    let mut handle = match engine.execute(plan, options) {
        Ok(handle) => handle,
        Err(e) => return reporter.run_error(&RunFailure::from(&e), Duration::ZERO).await,
    };

    let mut exit = None;
    while let Some(event) = handle.events.recv().await {
        if let Some(reason) = reporter.handle(event).await {
            exit = Some(reason);
        }
    }
    engine.remove(&handle.run_id);

    match exit {
        Some(exit) => exit,
        None => {
            let failure = RunFailure {
                severity: sandbox::Severity::Crash,
                error_type: "ExitError".to_string(),
                message: "run ended without reporting an outcome".to_string(),
            };
            reporter.run_error(&failure, Duration::ZERO).await
        }
    }
}
