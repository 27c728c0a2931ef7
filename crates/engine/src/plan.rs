//! Plan execution.
//!
//! [`execute_plan`] is the traversal:
//! 1. Compiles the plan; compilation problems abort before any job runs.
//! 2. Resolves the initial state.
//! 3. Walks jobs breadth-first from the start job, handing each the state
//!    produced by its `previous` job (or the initial state).
//! 4. Returns the state of the single leaf, or a map of leaf id to state.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use sandbox::{RuntimeError, Sandbox};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::compile::compile_plan;
use crate::events::{Callbacks, Notification};
use crate::job::{execute_job, ExecutionContext};
use crate::models::{ExecutionPlan, JobId, Lazy};
use crate::EngineError;

/// Tuning knobs for a single run.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Only `data`, `configuration`, `references` and `errors` flow between
    /// jobs when set.
    pub strict: bool,
    /// Wall-clock budget for each job's logic. `None` disables it.
    pub job_timeout: Option<Duration>,
    /// Top-level keys removed from every job's output.
    pub state_props_to_remove: Vec<String>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            strict: true,
            job_timeout: Some(Duration::from_secs(5 * 60)),
            state_props_to_remove: vec!["configuration".to_string()],
        }
    }
}

/// Compile and run `plan` to completion.
///
/// # Errors
/// - [`EngineError::Compile`] if the plan is invalid; no job runs.
/// - [`EngineError::Runtime`] if a job raised a crash or kill error.
/// - [`EngineError::Cancelled`] if the callbacks' token fired between jobs.
#[instrument(skip_all, fields(plan_id = plan.id.as_deref().unwrap_or("")))]
pub async fn execute_plan(
    plan: ExecutionPlan,
    options: &ExecutionOptions,
    callbacks: &Callbacks,
    sandbox: &dyn Sandbox,
) -> Result<Value, EngineError> {
    let compiled = compile_plan(plan).map_err(|err| {
        error!("Error validating execution plan");
        error!("{err}");
        error!("Aborting");
        err
    })?;

    let ctx = ExecutionContext {
        options,
        callbacks,
        sandbox,
    };

    let initial_state = load_initial_state(&ctx, compiled.initial_state.as_ref()).await?;

    let mut queue: VecDeque<JobId> = VecDeque::from([compiled.start.clone()]);
    let mut history: HashMap<JobId, Value> = HashMap::new();
    let mut leaves: IndexMap<JobId, Value> = IndexMap::new();

    info!(start = %compiled.start, jobs = compiled.jobs.len(), "Executing plan");

    while let Some(job_id) = queue.pop_front() {
        if history.contains_key(&job_id) {
            debug!(job_id = %job_id, "job already ran; skipping");
            continue;
        }
        if callbacks.is_cancelled() {
            warn!(job_id = %job_id, "run cancelled; remaining jobs will not run");
            return Err(EngineError::Cancelled { next: job_id });
        }
        let job = compiled.jobs.get(&job_id).ok_or_else(|| {
            RuntimeError::Validation(format!("job '{job_id}' is not part of the plan"))
        })?;

        let input = job
            .previous
            .as_ref()
            .and_then(|previous| history.get(previous))
            .cloned()
            .unwrap_or_else(|| initial_state.clone());

        let outcome = execute_job(&ctx, job, input).await?;

        if outcome.next.is_empty() {
            leaves.insert(job_id.clone(), outcome.state.clone());
        }
        queue.extend(outcome.next);
        history.insert(job_id, outcome.state);
    }

    info!(leaves = leaves.len(), "Plan complete");

    if leaves.len() > 1 {
        return Ok(Value::Object(leaves.into_iter().collect::<Map<_, _>>()));
    }
    Ok(leaves.into_values().next().unwrap_or(Value::Null))
}

async fn load_initial_state(
    ctx: &ExecutionContext<'_>,
    initial: Option<&Lazy<Value>>,
) -> Result<Value, RuntimeError> {
    match initial {
        None => Ok(json!({ "data": {}, "configuration": {} })),
        Some(Lazy::Inline(value)) => Ok(value.clone()),
        Some(Lazy::Reference(id)) => {
            let started = Instant::now();
            let resolvers = ctx.callbacks.resolvers().ok_or_else(|| {
                RuntimeError::Input(format!("no resolver available to load initial state '{id}'"))
            })?;
            let state = resolvers.resolve_state(id).await.map_err(|e| {
                RuntimeError::Input(format!("failed to load initial state '{id}': {e}"))
            })?;
            ctx.callbacks.notify(Notification::StateLoad {
                id: id.clone(),
                duration: started.elapsed(),
            });
            Ok(state)
        }
    }
}
