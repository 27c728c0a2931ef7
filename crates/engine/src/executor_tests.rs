//! End-to-end traversal tests for the plan executor.
//!
//! These tests drive `execute_plan` with `MockOperation` job bodies and an
//! in-memory resolver, so no worker pool or remote queue is involved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::mock::MockOperation;
use sandbox::{operation, Expression, Operation, RuntimeError, Severity, StandardSandbox};
use serde_json::{json, Value};

use crate::{
    execute_plan, Callbacks, EdgeSpec, EngineError, ExecutionOptions, ExecutionPlan, Job, Lazy,
    Notification, ResolveError, Resolvers,
};

type Calls = Arc<Mutex<Vec<Value>>>;

/// Wrap a mock as a job body, keeping a handle on its recorded calls.
fn body(mock: MockOperation) -> (Expression, Calls) {
    let calls = mock.recorder();
    let op: Arc<dyn Operation> = Arc::new(mock);
    (Expression::operations([op]), calls)
}

fn increment() -> Expression {
    Expression::operations([operation(|mut state| {
        let x = state["data"]["x"].as_i64().unwrap_or(0);
        state["data"]["x"] = json!(x + 1);
        Ok(state)
    })])
}

fn count(calls: &Calls) -> usize {
    calls.lock().unwrap().len()
}

/// Callbacks that record every notification.
fn recording() -> (Callbacks, Arc<Mutex<Vec<Notification>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callbacks = Callbacks::new().with_notify(move |n| sink.lock().unwrap().push(n));
    (callbacks, seen)
}

fn completed(seen: &Arc<Mutex<Vec<Notification>>>) -> Vec<String> {
    seen.lock()
        .unwrap()
        .iter()
        .filter_map(|n| match n {
            Notification::JobComplete { job_id, .. } => Some(job_id.clone()),
            _ => None,
        })
        .collect()
}

async fn run(plan: ExecutionPlan, callbacks: &Callbacks) -> Result<Value, EngineError> {
    execute_plan(plan, &ExecutionOptions::default(), callbacks, &StandardSandbox).await
}

struct StaticResolvers {
    credentials: HashMap<String, Value>,
    states: HashMap<String, Value>,
}

#[async_trait]
impl Resolvers for StaticResolvers {
    async fn resolve_credential(&self, id: &str) -> Result<Value, ResolveError> {
        self.credentials
            .get(id)
            .cloned()
            .ok_or_else(|| ResolveError(format!("no credential {id}")))
    }

    async fn resolve_state(&self, id: &str) -> Result<Value, ResolveError> {
        self.states
            .get(id)
            .cloned()
            .ok_or_else(|| ResolveError(format!("no dataclip {id}")))
    }
}

// ============================================================
// Traversal
// ============================================================

#[tokio::test]
async fn linear_plan_threads_state_through_every_job() {
    let plan = ExecutionPlan::new(vec![
        Job::new("a").with_expression(increment()).then("b"),
        Job::new("b").with_expression(increment()).then("c"),
        Job::new("c").with_expression(increment()),
    ])
    .with_initial_state(Lazy::Inline(json!({ "data": { "x": 0 } })));

    let (callbacks, seen) = recording();
    let result = run(plan, &callbacks).await.expect("plan should succeed");

    assert_eq!(result, json!({ "data": { "x": 3 } }));
    assert_eq!(completed(&seen), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn false_edge_is_never_followed() {
    let (b_body, b_calls) = body(MockOperation::merging("b", json!({ "b": true })));
    let plan = ExecutionPlan::new(vec![
        Job::new("a")
            .with_expression(increment())
            .with_edge("b", EdgeSpec::Always(false)),
        Job::new("b").with_expression(b_body),
    ]);

    let result = run(plan, &Callbacks::new()).await.unwrap();

    assert_eq!(count(&b_calls), 0);
    assert_eq!(result, json!({ "data": { "x": 1 } }));
}

#[tokio::test]
async fn disabled_edge_is_never_followed_even_when_true() {
    let (b_body, b_calls) = body(MockOperation::merging("b", json!({})));
    let (c_body, c_calls) = body(MockOperation::merging("c", json!({})));
    let plan = ExecutionPlan::new(vec![
        Job::new("a")
            .with_edge("b", EdgeSpec::when("true"))
            .with_edge(
                "c",
                EdgeSpec::Rule(crate::EdgeRule {
                    condition: Some("true".into()),
                    disabled: true,
                    label: None,
                }),
            ),
        Job::new("b").with_expression(b_body),
        Job::new("c").with_expression(c_body),
    ]);

    run(plan, &Callbacks::new()).await.unwrap();

    assert_eq!(count(&b_calls), 1);
    assert_eq!(count(&c_calls), 0);
}

#[tokio::test]
async fn several_leaves_are_keyed_by_job_id() {
    let plan = ExecutionPlan::new(vec![
        Job::new("a").with_expression(increment()).then("b").then("c"),
        Job::new("b").with_expression(increment()),
        Job::new("c").with_expression(increment()).then("d"),
        Job::new("d").with_expression(increment()),
    ]);

    let result = run(plan, &Callbacks::new()).await.unwrap();

    assert_eq!(
        result,
        json!({
            "b": { "data": { "x": 2 } },
            "d": { "data": { "x": 3 } }
        })
    );
}

#[tokio::test]
async fn diamond_runs_the_join_once() {
    let (d_body, d_calls) = body(MockOperation::merging("d", json!({})));
    let plan = ExecutionPlan::new(vec![
        Job::new("a").then("b").then("c"),
        Job::new("b").then("d"),
        Job::new("c").then("d"),
        Job::new("d").with_expression(d_body),
    ]);

    run(plan, &Callbacks::new()).await.unwrap();
    assert_eq!(count(&d_calls), 1);
}

#[tokio::test]
async fn source_expressions_and_conditions_from_json() {
    let plan: ExecutionPlan = serde_json::from_value(json!({
        "jobs": [
            {
                "id": "double",
                "expression": "{ data: { x: data.x * 2 } }",
                "next": { "big": "state.data.x > 5", "small": "state.data.x <= 5" }
            },
            { "id": "big", "expression": "{ data: { size: 'big' } }" },
            { "id": "small", "expression": "{ data: { size: 'small' } }" }
        ],
        "options": { "initial_state": { "data": { "x": 4 } } }
    }))
    .unwrap();

    let result = run(plan, &Callbacks::new()).await.unwrap();
    assert_eq!(result["data"]["size"], "big");
}

// ============================================================
// Errors
// ============================================================

#[tokio::test]
async fn soft_failure_is_recorded_and_traversal_continues() {
    let (a_body, _) = body(MockOperation::failing("a", RuntimeError::job("nope")));
    let (recover_body, recover_calls) = body(MockOperation::merging("recover", json!({})));
    let (happy_body, happy_calls) = body(MockOperation::merging("happy", json!({})));

    let plan = ExecutionPlan::new(vec![
        Job::new("a")
            .with_expression(a_body)
            .with_edge("recover", EdgeSpec::when("state|hasError('a')"))
            .with_edge("happy", EdgeSpec::when("state|hasError('a')|not")),
        Job::new("recover").with_expression(recover_body),
        Job::new("happy").with_expression(happy_body),
    ]);

    let (callbacks, seen) = recording();
    let result = run(plan, &callbacks).await.expect("soft failures do not abort");

    assert_eq!(count(&recover_calls), 1);
    assert_eq!(count(&happy_calls), 0);
    assert_eq!(result["errors"]["a"]["type"], "JobError");
    assert_eq!(result["errors"]["a"]["message"], "nope");

    let errored = seen.lock().unwrap().iter().any(|n| {
        matches!(n, Notification::JobError { job_id, error, .. }
            if job_id == "a" && error.severity() == Severity::Fail)
    });
    assert!(errored);
}

#[tokio::test]
async fn throwing_edge_condition_aborts_the_run() {
    let (b_body, b_calls) = body(MockOperation::merging("b", json!({})));
    let plan = ExecutionPlan::new(vec![
        Job::new("a")
            .with_expression(increment())
            .with_edge("b", EdgeSpec::when("state|explode")),
        Job::new("b").with_expression(b_body),
    ]);

    let err = run(plan, &Callbacks::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::Runtime(RuntimeError::EdgeCondition(_))));
    assert_eq!(err.severity(), Severity::Crash);
    assert_eq!(count(&b_calls), 0);
}

#[tokio::test]
async fn empty_result_with_next_jobs_does_not_abort() {
    let (a_body, _) = body(MockOperation::returning("a", Value::Null));
    let (b_body, b_calls) = body(MockOperation::merging("b", json!({ "ran": true })));
    let plan = ExecutionPlan::new(vec![
        Job::new("a").with_expression(a_body).then("b"),
        Job::new("b").with_expression(b_body),
    ]);

    let result = run(plan, &Callbacks::new()).await.expect("should not abort");

    assert_eq!(count(&b_calls), 1);
    assert_eq!(result["data"]["ran"], true);
}

#[tokio::test]
async fn fatal_job_error_stops_the_run() {
    let (boom_body, _) = body(MockOperation::failing(
        "boom",
        RuntimeError::Security("dynamic evaluation is not allowed".into()),
    ));
    let (never_body, never_calls) = body(MockOperation::merging("never", json!({})));
    let plan = ExecutionPlan::new(vec![
        Job::new("boom").with_expression(boom_body).then("never"),
        Job::new("never").with_expression(never_body),
    ]);

    let err = run(plan, &Callbacks::new()).await.unwrap_err();

    assert_eq!(err.severity(), Severity::Kill);
    assert_eq!(err.error_type(), "SecurityError");
    assert_eq!(count(&never_calls), 0);
}

#[tokio::test]
async fn job_timeout_is_a_kill() {
    let (slow_body, _) = body(MockOperation::sleeping("slow", Duration::from_secs(30)));
    let plan = ExecutionPlan::new(vec![Job::new("slow").with_expression(slow_body)]);
    let options = ExecutionOptions {
        job_timeout: Some(Duration::from_millis(50)),
        ..ExecutionOptions::default()
    };

    let err = execute_plan(plan, &options, &Callbacks::new(), &StandardSandbox)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Runtime(RuntimeError::Timeout(50))));
    assert_eq!(err.severity(), Severity::Kill);
}

#[tokio::test]
async fn compile_errors_abort_before_any_job_runs() {
    let (a_body, a_calls) = body(MockOperation::merging("a", json!({})));
    let plan = ExecutionPlan::new(vec![Job::new("a").with_expression(a_body).then("ghost")]);

    let err = run(plan, &Callbacks::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::Compile(_)));
    assert!(err.to_string().contains("a->ghost"));
    assert_eq!(count(&a_calls), 0);
}

// ============================================================
// Inputs
// ============================================================

#[tokio::test]
async fn references_are_resolved_and_configuration_is_stripped() {
    let seen_config = Arc::new(Mutex::new(Value::Null));
    let capture = Arc::clone(&seen_config);
    let job_body = Expression::operations([operation(move |state| {
        *capture.lock().unwrap() = state["configuration"].clone();
        Ok(state)
    })]);

    let plan = ExecutionPlan::new(vec![Job::new("a")
        .with_expression(job_body)
        .with_configuration(Lazy::Reference("cred-1".into()))])
    .with_initial_state(Lazy::Reference("clip-1".into()));

    let resolvers = StaticResolvers {
        credentials: HashMap::from([("cred-1".to_string(), json!({ "user": "u" }))]),
        states: HashMap::from([("clip-1".to_string(), json!({ "data": { "n": 1 } }))]),
    };
    let (callbacks, seen) = recording();
    let callbacks = callbacks.with_resolvers(Arc::new(resolvers));

    let result = run(plan, &callbacks).await.unwrap();

    assert_eq!(*seen_config.lock().unwrap(), json!({ "user": "u" }));
    assert_eq!(result, json!({ "data": { "n": 1 } }));
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .any(|n| matches!(n, Notification::StateLoad { id, .. } if id == "clip-1")));
}

#[tokio::test]
async fn unresolvable_reference_is_an_input_error() {
    let plan = ExecutionPlan::new(vec![Job::new("a")
        .with_expression(increment())
        .with_configuration(Lazy::Reference("missing".into()))]);

    let err = run(plan, &Callbacks::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::Runtime(RuntimeError::Input(_))));
    assert_eq!(err.severity(), Severity::Crash);
}

#[tokio::test]
async fn job_logs_are_forwarded_as_notifications() {
    let (a_body, _) = body(MockOperation::merging("a", json!({})));
    let plan = ExecutionPlan::new(vec![Job::new("a").with_expression(a_body)]);

    let (callbacks, seen) = recording();
    run(plan, &callbacks).await.unwrap();

    let logged = seen.lock().unwrap().iter().any(|n| {
        matches!(n, Notification::Log(log) if log.job_id == "a" && log.message.contains("mock 'a'"))
    });
    assert!(logged);
}

#[tokio::test]
async fn cancelled_run_starts_no_further_jobs() {
    let cancel = tokio_util::sync::CancellationToken::new();
    let trip = cancel.clone();
    let first = Expression::operations([operation(move |state| {
        trip.cancel();
        Ok(state)
    })]);
    let (second, second_calls) = body(MockOperation::merging("b", json!({ "ran": true })));
    let plan = ExecutionPlan::new(vec![
        Job::new("a").with_expression(first).then("b"),
        Job::new("b").with_expression(second),
    ]);
    let callbacks = Callbacks::new().with_cancellation(cancel);

    let err = run(plan, &callbacks).await.unwrap_err();

    assert!(matches!(&err, EngineError::Cancelled { next } if next == "b"));
    assert_eq!(err.severity(), Severity::Kill);
    assert_eq!(count(&second_calls), 0);
}
