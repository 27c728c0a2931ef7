//! Executes a single compiled job: input assembly, job logic, next hops.

use std::time::{Duration, Instant};

use sandbox::{
    jexl, Expression, ExpressionFailure, OperationContext, RuntimeError, Sandbox, Severity,
};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::compile::{CompiledEdge, CompiledJob};
use crate::events::{Callbacks, Notification};
use crate::memory;
use crate::models::{JobId, Lazy};
use crate::plan::ExecutionOptions;

/// Everything a job needs from the run that hosts it.
pub struct ExecutionContext<'a> {
    pub options: &'a ExecutionOptions,
    pub callbacks: &'a Callbacks,
    pub sandbox: &'a dyn Sandbox,
}

impl ExecutionContext<'_> {
    fn notify(&self, notification: Notification) {
        self.callbacks.notify(notification);
    }
}

/// What a job hands back to the traversal.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub next: Vec<JobId>,
    pub state: Value,
}

#[derive(Clone, Copy)]
enum LazyKind {
    Credential,
    State,
}

/// Run one job against `input`.
///
/// Soft failures are recorded in the returned state under
/// `errors.<jobId>`. Crash and kill severity errors are returned as `Err`.
///
/// # Errors
/// Any [`RuntimeError`] whose severity aborts the run.
pub async fn execute_job(
    ctx: &ExecutionContext<'_>,
    job: &CompiledJob,
    input: Value,
) -> Result<JobOutcome, RuntimeError> {
    let job_id = job.id.as_str();
    let started = Instant::now();

    ctx.notify(Notification::InitStart {
        job_id: job_id.to_string(),
    });
    let configuration = load(ctx, job.configuration.as_ref(), LazyKind::Credential).await?;
    let globals = load(ctx, job.state.as_ref(), LazyKind::State).await?;
    let state = assemble_state(input, configuration, globals, ctx.options.strict)?;
    ctx.notify(Notification::InitComplete {
        job_id: job_id.to_string(),
        duration: started.elapsed(),
    });

    let Some(expression) = &job.expression else {
        // Triggers carry no logic; they only route.
        let next = calculate_next(job, &state)?;
        return Ok(JobOutcome { next, state });
    };

    info!(job_id, "Starting job");
    ctx.notify(Notification::JobStart {
        job_id: job_id.to_string(),
    });

    match run_expression(ctx, job_id, expression, state).await {
        Ok(mut result) => {
            strip_props(&mut result, &ctx.options.state_props_to_remove);
            let serialized = serde_json::to_string(&result).map_err(|e| RuntimeError::Crash {
                subtype: "SerializationError".into(),
                message: e.to_string(),
            })?;
            let mem = memory::snapshot();
            let duration = started.elapsed();
            info!(job_id, duration_ms = duration.as_millis() as u64, "Completed job");
            debug!(
                job_id,
                job_mb = mem.job_mb(),
                system_mb = mem.system_mb(),
                "Final memory usage"
            );

            let next = calculate_next(job, &result)?;
            if !next.is_empty() && is_empty_result(&result) {
                warn!(job_id, "job produced no result but has downstream jobs; they will receive empty input");
            }

            ctx.notify(Notification::JobComplete {
                job_id: job_id.to_string(),
                duration,
                state: result.clone(),
                serialized,
                next: next.clone(),
                mem,
            });
            Ok(JobOutcome {
                next,
                state: result,
            })
        }
        Err(ExpressionFailure {
            error: err,
            state: mut partial,
        }) => {
            let duration = started.elapsed();
            error!(job_id, duration_ms = duration.as_millis() as u64, "Failed job");
            strip_props(&mut partial, &ctx.options.state_props_to_remove);
            report_error(&mut partial, job_id, &err);

            let next = calculate_next(job, &partial)?;
            ctx.notify(Notification::JobError {
                job_id: job_id.to_string(),
                duration,
                error: err.clone(),
                state: partial.clone(),
                next: next.clone(),
            });

            if err.severity().is_fatal() {
                return Err(err);
            }
            Ok(JobOutcome {
                next,
                state: partial,
            })
        }
    }
}

async fn run_expression(
    ctx: &ExecutionContext<'_>,
    job_id: &str,
    expression: &Expression,
    state: Value,
) -> Result<Value, ExpressionFailure> {
    let mut op_ctx = OperationContext::new(job_id);
    if let Some(notify) = ctx.callbacks.notifier() {
        op_ctx = op_ctx.with_log_sink(std::sync::Arc::new(move |log| {
            notify(Notification::Log(log));
        }));
    }

    let Some(limit) = ctx.options.job_timeout else {
        return ctx.sandbox.execute(expression, state, &op_ctx).await;
    };

    let fallback = state.clone();
    match tokio::time::timeout(limit, ctx.sandbox.execute(expression, state, &op_ctx)).await {
        Ok(result) => result,
        Err(_) => Err(ExpressionFailure {
            error: RuntimeError::Timeout(millis(limit)),
            state: fallback,
        }),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

async fn load(
    ctx: &ExecutionContext<'_>,
    value: Option<&Lazy<Value>>,
    kind: LazyKind,
) -> Result<Option<Value>, RuntimeError> {
    let id = match value {
        None => return Ok(None),
        Some(Lazy::Inline(v)) => return Ok(Some(v.clone())),
        Some(Lazy::Reference(id)) => id,
    };

    let resolvers = ctx.callbacks.resolvers().ok_or_else(|| {
        RuntimeError::Input(format!("no resolver available to load reference '{id}'"))
    })?;
    let resolved = match kind {
        LazyKind::Credential => resolvers.resolve_credential(id).await,
        LazyKind::State => resolvers.resolve_state(id).await,
    };
    resolved
        .map(Some)
        .map_err(|e| RuntimeError::Input(format!("failed to resolve '{id}': {e}")))
}

fn as_object(value: Option<Value>, what: &str) -> Result<Map<String, Value>, RuntimeError> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(RuntimeError::Validation(format!(
            "{what} must be an object, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Build the state a job's logic will see.
///
/// # Errors
/// [`RuntimeError::Validation`] when the input or globals are not objects.
pub fn assemble_state(
    input: Value,
    configuration: Option<Value>,
    globals: Option<Value>,
    strict: bool,
) -> Result<Value, RuntimeError> {
    let mut input = as_object(Some(input), "job input state")?;
    let mut globals = as_object(globals, "job globals")?;

    let input_data = input.remove("data");
    let global_data = globals.remove("data");
    let input_configuration = input.remove("configuration");

    let mut state = Map::new();
    if strict {
        for key in ["references", "errors"] {
            if let Some(value) = input.remove(key) {
                state.insert(key.to_string(), value);
            }
        }
    } else {
        state.extend(globals);
        state.extend(input);
    }

    state.insert(
        "configuration".into(),
        merge(input_configuration, configuration),
    );
    state.insert("data".into(), assemble_data(input_data, global_data));
    Ok(Value::Object(state))
}

fn merge(base: Option<Value>, over: Option<Value>) -> Value {
    match (base, over) {
        (Some(Value::Object(mut base)), Some(Value::Object(over))) => {
            base.extend(over);
            Value::Object(base)
        }
        (_, Some(over)) if !over.is_null() => over,
        (Some(base), _) if !base.is_null() => base,
        _ => json!({}),
    }
}

fn assemble_data(initial: Option<Value>, defaults: Option<Value>) -> Value {
    match initial {
        // Arrays and primitives pass through verbatim.
        Some(data) if !data.is_object() && !data.is_null() => data,
        initial => {
            let mut merged = match defaults {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            if let Some(Value::Object(map)) = initial {
                merged.extend(map);
            }
            Value::Object(merged)
        }
    }
}

fn strip_props(state: &mut Value, props: &[String]) {
    if let Some(obj) = state.as_object_mut() {
        for prop in props {
            obj.remove(prop);
        }
    }
}

fn is_empty_result(state: &Value) -> bool {
    !jexl::truthy(state) || state.as_object().is_some_and(Map::is_empty)
}

/// Log `err` and, for soft failures, record it under `errors.<jobId>`.
fn report_error(state: &mut Value, job_id: &str, err: &RuntimeError) {
    let report = err.report(job_id);
    if err.severity() == Severity::Crash {
        error!(job_id, "CRITICAL ERROR! Aborting execution");
    }
    error!(job_id, error_type = %report.error_type, "{}", report.message);

    if err.severity() != Severity::Fail {
        return;
    }
    error!(job_id, "Check state.errors.{job_id} for details");

    if !state.is_object() {
        *state = json!({});
    }
    if let Some(obj) = state.as_object_mut() {
        let errors = obj.entry("errors").or_insert_with(|| json!({}));
        if !errors.is_object() {
            *errors = json!({});
        }
        if let Some(errors) = errors.as_object_mut() {
            errors.insert(
                job_id.to_string(),
                serde_json::to_value(&report).unwrap_or_else(|_| json!({ "message": report.message })),
            );
        }
    }
}

/// Evaluate `job`'s edges against `result`, in declaration order.
///
/// # Errors
/// [`RuntimeError::EdgeCondition`] when a condition fails to evaluate.
pub fn calculate_next(job: &CompiledJob, result: &Value) -> Result<Vec<JobId>, RuntimeError> {
    let mut next = Vec::new();
    for (target, edge) in &job.next {
        let follow = match edge {
            CompiledEdge::Flag(flag) => *flag,
            CompiledEdge::Conditional { disabled: true, .. }
            | CompiledEdge::Conditional { condition: None, .. } => false,
            CompiledEdge::Conditional {
                condition: Some(condition),
                ..
            } => {
                let pass = condition.evaluate(result)?;
                debug!(
                    job_id = %job.id,
                    target = %target,
                    condition = condition.source(),
                    pass,
                    "evaluated edge condition"
                );
                pass
            }
        };
        if follow {
            next.push(target.clone());
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_state_keeps_known_keys_only() {
        let input = json!({
            "data": { "x": 1 },
            "references": [1],
            "errors": { "a": {} },
            "configuration": { "user": "u" },
            "extra": true
        });
        let state = assemble_state(input, Some(json!({ "pass": "p" })), None, true).unwrap();
        assert_eq!(
            state,
            json!({
                "references": [1],
                "errors": { "a": {} },
                "configuration": { "user": "u", "pass": "p" },
                "data": { "x": 1 }
            })
        );
    }

    #[test]
    fn loose_state_keeps_input_over_globals() {
        let input = json!({ "data": { "x": 1 }, "extra": "input" });
        let globals = json!({ "data": { "x": 0, "y": 2 }, "extra": "globals", "g": 1 });
        let state = assemble_state(input, None, Some(globals), false).unwrap();
        assert_eq!(state["extra"], "input");
        assert_eq!(state["g"], 1);
        assert_eq!(state["data"], json!({ "x": 1, "y": 2 }));
        assert_eq!(state["configuration"], json!({}));
    }

    #[test]
    fn non_object_data_passes_through() {
        let state = assemble_state(json!({ "data": [1, 2] }), None, None, true).unwrap();
        assert_eq!(state["data"], json!([1, 2]));
    }

    #[test]
    fn non_object_input_is_a_validation_error() {
        let err = assemble_state(json!(42), None, None, true).unwrap_err();
        assert_eq!(err.name(), "ValidationError");
    }

    #[test]
    fn null_input_is_treated_as_empty() {
        let state = assemble_state(Value::Null, None, None, true).unwrap();
        assert_eq!(state, json!({ "configuration": {}, "data": {} }));
    }

    #[test]
    fn soft_failures_are_recorded_on_state() {
        let mut state = json!({ "data": {} });
        report_error(&mut state, "a", &RuntimeError::job("nope"));
        assert_eq!(state["errors"]["a"]["type"], "JobError");
        assert_eq!(state["errors"]["a"]["message"], "nope");
    }

    #[test]
    fn fatal_failures_are_not_recorded() {
        let mut state = json!({ "data": {} });
        report_error(&mut state, "a", &RuntimeError::Timeout(5));
        assert!(state.get("errors").is_none());
    }
}
