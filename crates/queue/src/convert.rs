//! Map a run descriptor from the queue onto an execution plan.

use engine::{EdgeRule, EdgeSpec, ExecutionPlan, Job, Lazy, NextSpec};
use indexmap::IndexMap;
use sandbox::Expression;
use uuid::Uuid;

use crate::protocol::{RunDescriptor, RunEdge, RunSettings};

/// Predicate source for the named edge conditions, or `None` for `always`.
fn named_condition(name: &str, upstream: &str) -> Option<Option<String>> {
    match name {
        "on_job_success" => Some(Some(format!("state|hasError('{upstream}')|not"))),
        "on_job_failure" => Some(Some(format!("state|hasError('{upstream}')"))),
        "always" => Some(None),
        _ => None,
    }
}

fn job_edge_condition(edge: &RunEdge) -> Option<String> {
    let condition = edge.condition.as_deref()?;
    let upstream = edge
        .source_job_id
        .as_deref()
        .or(edge.source_trigger_id.as_deref())
        .unwrap_or_default();
    match named_condition(condition, upstream) {
        Some(mapped) => mapped,
        None => Some(condition.to_string()),
    }
}

fn trigger_edge(edge: &RunEdge) -> EdgeSpec {
    match edge.condition.as_deref() {
        None | Some("always") => EdgeSpec::Always(true),
        Some(condition) => EdgeSpec::when(condition),
    }
}

fn job_edge(edge: &RunEdge) -> EdgeSpec {
    let condition = job_edge_condition(edge);
    let disabled = edge.enabled == Some(false);
    if condition.is_none() && !disabled {
        return EdgeSpec::Always(true);
    }
    EdgeSpec::Rule(EdgeRule {
        condition,
        disabled,
        label: None,
    })
}

/// Build a plan from `run`, along with the run's settings.
///
/// Triggers become empty jobs whose edges lead into the workflow; disabled
/// trigger edges are dropped. Named edge conditions become predicates over
/// `state.errors`.
pub fn convert_run(run: RunDescriptor) -> (ExecutionPlan, RunSettings) {
    let mut jobs = Vec::with_capacity(run.triggers.len() + run.jobs.len());

    for trigger in &run.triggers {
        let id = trigger.id.clone().unwrap_or_else(|| "trigger".to_string());
        let next: IndexMap<String, EdgeSpec> = run
            .edges
            .iter()
            .filter(|e| e.source_trigger_id.as_deref() == Some(id.as_str()))
            .filter(|e| e.enabled != Some(false))
            .map(|e| (e.target_job_id.clone(), trigger_edge(e)))
            .collect();

        let mut job = Job::new(id);
        if !next.is_empty() {
            job.next = Some(NextSpec::Edges(next));
        }
        jobs.push(job);
    }

    for source in run.jobs {
        let id = source
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let next: IndexMap<String, EdgeSpec> = run
            .edges
            .iter()
            .filter(|e| e.source_job_id.as_deref() == Some(id.as_str()))
            .map(|e| (e.target_job_id.clone(), job_edge(e)))
            .collect();

        let mut job = Job::new(id);
        job.expression = source.body.map(Expression::from);
        job.configuration = source
            .credential
            .or_else(|| source.credential_id.map(Lazy::Reference));
        job.state = source.state.map(Lazy::Inline);
        job.adaptor = source.adaptor;
        if !next.is_empty() {
            job.next = Some(NextSpec::Edges(next));
        }
        jobs.push(job);
    }

    let mut plan = ExecutionPlan::new(jobs).with_id(run.id);
    if let Some(dataclip_id) = run.dataclip_id {
        plan = plan.with_initial_state(Lazy::Reference(dataclip_id));
    }
    if let Some(start) = run.starting_node_id {
        plan = plan.with_start(start);
    }

    (plan, run.options.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(value: serde_json::Value) -> RunDescriptor {
        serde_json::from_value(value).unwrap()
    }

    fn edges(job: &Job) -> &IndexMap<String, EdgeSpec> {
        match job.next.as_ref() {
            Some(NextSpec::Edges(edges)) => edges,
            other => panic!("expected edges, got {other:?}"),
        }
    }

    #[test]
    fn maps_ids_start_and_initial_state() {
        let (plan, settings) = convert_run(descriptor(json!({
            "id": "run-1",
            "dataclip_id": "clip-1",
            "starting_node_id": "a",
            "jobs": [{ "id": "a", "body": "{ data: data }", "credential_id": "cred-1" }]
        })));

        assert_eq!(plan.id.as_deref(), Some("run-1"));
        assert_eq!(plan.options.start.as_deref(), Some("a"));
        assert_eq!(plan.options.initial_state, Some(Lazy::Reference("clip-1".into())));
        assert_eq!(plan.jobs[0].configuration, Some(Lazy::Reference("cred-1".into())));
        assert_eq!(
            plan.jobs[0].expression.as_ref().and_then(|e| e.source()),
            Some("{ data: data }")
        );
        assert_eq!(settings, RunSettings::default());
    }

    #[test]
    fn trigger_edges_are_always_true_unless_conditional() {
        let (plan, _) = convert_run(descriptor(json!({
            "id": "run-1",
            "triggers": [{ "id": "t" }],
            "jobs": [{ "id": "a" }, { "id": "b" }, { "id": "c" }],
            "edges": [
                { "source_trigger_id": "t", "target_job_id": "a" },
                { "source_trigger_id": "t", "target_job_id": "b", "condition": "always" },
                { "source_trigger_id": "t", "target_job_id": "c", "enabled": false }
            ]
        })));

        assert_eq!(plan.jobs[0].id.as_deref(), Some("t"));
        let next = edges(&plan.jobs[0]);
        assert_eq!(next.len(), 2);
        assert_eq!(next["a"], EdgeSpec::Always(true));
        assert_eq!(next["b"], EdgeSpec::Always(true));
    }

    #[test]
    fn named_job_conditions_check_the_upstream_error() {
        let (plan, _) = convert_run(descriptor(json!({
            "id": "run-1",
            "jobs": [{ "id": "a" }, { "id": "b" }, { "id": "c" }, { "id": "d" }, { "id": "e" }],
            "edges": [
                { "source_job_id": "a", "target_job_id": "b", "condition": "on_job_success" },
                { "source_job_id": "a", "target_job_id": "c", "condition": "on_job_failure" },
                { "source_job_id": "a", "target_job_id": "d", "condition": "always", "enabled": false },
                { "source_job_id": "a", "target_job_id": "e", "condition": "state.data.ok" }
            ]
        })));

        let next = edges(&plan.jobs[0]);
        assert_eq!(next["b"], EdgeSpec::Rule(EdgeRule {
            condition: Some("state|hasError('a')|not".into()),
            ..EdgeRule::default()
        }));
        assert_eq!(next["c"], EdgeSpec::Rule(EdgeRule {
            condition: Some("state|hasError('a')".into()),
            ..EdgeRule::default()
        }));
        assert_eq!(next["d"], EdgeSpec::disabled());
        assert_eq!(next["e"], EdgeSpec::Rule(EdgeRule {
            condition: Some("state.data.ok".into()),
            ..EdgeRule::default()
        }));
        assert!(plan.jobs[1].next.is_none());
    }

    #[test]
    fn jobs_without_ids_get_one() {
        let (plan, _) = convert_run(descriptor(json!({ "id": "run-1", "jobs": [{ "body": "{}" }] })));
        assert!(plan.jobs[0].id.as_deref().is_some_and(|id| !id.is_empty()));
    }

    #[test]
    fn converted_plans_compile() {
        let (plan, _) = convert_run(descriptor(json!({
            "id": "run-1",
            "triggers": [{ "id": "t" }],
            "jobs": [{ "id": "a", "body": "{}" }, { "id": "b", "body": "{}" }],
            "edges": [
                { "source_trigger_id": "t", "target_job_id": "a" },
                { "source_job_id": "a", "target_job_id": "b", "condition": "on_job_success" }
            ]
        })));
        let compiled = engine::compile_plan(plan).unwrap();
        assert_eq!(compiled.start, "t");
    }
}
