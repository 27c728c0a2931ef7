//! Plan compilation — run this once before executing a plan.
//!
//! Rules enforced:
//! 1. The plan has at least one job, and job ids are unique.
//! 2. Every edge targets a declared job and the start job exists.
//! 3. Every condition string parses.
//! 4. The directed graph is acyclic (topological sort must succeed).
//!
//! All problems are collected and returned together.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexMap;
use sandbox::Expression;
use serde_json::Value;
use tracing::warn;

use crate::conditions::EdgeCondition;
use crate::error::{CompileError, CompileProblem};
use crate::models::{EdgeSpec, ExecutionPlan, Job, JobId, Lazy, NextSpec};

#[derive(Debug, Clone)]
pub enum CompiledEdge {
    Flag(bool),
    Conditional {
        condition: Option<EdgeCondition>,
        disabled: bool,
    },
}

#[derive(Debug, Clone)]
pub struct CompiledJob {
    pub id: JobId,
    pub expression: Option<Expression>,
    pub configuration: Option<Lazy<Value>>,
    pub state: Option<Lazy<Value>>,
    /// Outgoing edges in declaration order.
    pub next: IndexMap<JobId, CompiledEdge>,
    /// The job whose output becomes this job's input.
    pub previous: Option<JobId>,
}

#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub id: Option<String>,
    pub start: JobId,
    pub jobs: IndexMap<JobId, CompiledJob>,
    pub initial_state: Option<Lazy<Value>>,
}

/// Validate `plan` and turn it into a traversable graph.
///
/// # Errors
/// A [`CompileError`] listing every problem found.
pub fn compile_plan(plan: ExecutionPlan) -> Result<CompiledPlan, CompileError> {
    let ExecutionPlan { id, jobs, options } = plan;

    if jobs.is_empty() {
        return Err(CompileError {
            problems: vec![CompileProblem::EmptyPlan],
        });
    }

    let jobs = assign_ids(jobs);
    let mut problems = Vec::new();

    let mut seen: HashSet<&str> = HashSet::new();
    for (job_id, _) in &jobs {
        if !seen.insert(job_id.as_str()) {
            problems.push(CompileProblem::DuplicateJobId(job_id.clone()));
        }
    }

    let start = match options.start {
        Some(start) => start,
        None => jobs[0].0.clone(),
    };
    if !seen.contains(start.as_str()) {
        problems.push(CompileProblem::UnknownStart(start.clone()));
    }

    let mut edges: Vec<(JobId, IndexMap<JobId, CompiledEdge>)> = Vec::with_capacity(jobs.len());
    for (job_id, job) in &jobs {
        let mut compiled = IndexMap::new();
        for (target, spec) in next_edges(job.next.as_ref()) {
            if !seen.contains(target.as_str()) {
                problems.push(CompileProblem::UnknownTarget {
                    from: job_id.clone(),
                    to: target.clone(),
                });
            }
            match compile_edge(spec) {
                Ok(edge) => {
                    compiled.insert(target, edge);
                }
                Err(message) => problems.push(CompileProblem::Condition {
                    from: job_id.clone(),
                    to: target,
                    message,
                }),
            }
        }
        edges.push((job_id.clone(), compiled));
    }

    if problems.is_empty() && has_cycle(&edges) {
        problems.push(CompileProblem::CycleDetected);
    }

    if !problems.is_empty() {
        return Err(CompileError { problems });
    }

    let mut compiled_jobs = IndexMap::with_capacity(jobs.len());
    for ((job_id, job), (_, next)) in jobs.into_iter().zip(edges.iter()) {
        let previous = find_upstream(&edges, &job_id);
        compiled_jobs.insert(
            job_id.clone(),
            CompiledJob {
                id: job_id,
                expression: job.expression,
                configuration: job.configuration,
                state: job.state,
                next: next.clone(),
                previous,
            },
        );
    }

    Ok(CompiledPlan {
        id,
        start,
        jobs: compiled_jobs,
        initial_state: options.initial_state,
    })
}

/// Give every job an id, generating `job-<n>` for the ones without.
fn assign_ids(jobs: Vec<Job>) -> Vec<(JobId, Job)> {
    let mut generated = 0usize;
    jobs.into_iter()
        .map(|job| {
            let id = match &job.id {
                Some(id) => id.clone(),
                None => {
                    generated += 1;
                    format!("job-{generated}")
                }
            };
            (id, job)
        })
        .collect()
}

fn next_edges(next: Option<&NextSpec>) -> Vec<(JobId, EdgeSpec)> {
    match next {
        None => Vec::new(),
        Some(NextSpec::Target(target)) => vec![(target.clone(), EdgeSpec::Always(true))],
        Some(NextSpec::Edges(edges)) => edges
            .iter()
            .map(|(target, spec)| (target.clone(), spec.clone()))
            .collect(),
    }
}

fn compile_edge(spec: EdgeSpec) -> Result<CompiledEdge, String> {
    match spec {
        EdgeSpec::Always(flag) => Ok(CompiledEdge::Flag(flag)),
        EdgeSpec::Condition(source) => Ok(CompiledEdge::Conditional {
            condition: Some(EdgeCondition::compile(&source)?),
            disabled: false,
        }),
        EdgeSpec::Rule(rule) => {
            let condition = rule
                .condition
                .as_deref()
                .map(EdgeCondition::compile)
                .transpose()?;
            Ok(CompiledEdge::Conditional {
                condition,
                disabled: rule.disabled,
            })
        }
    }
}

/// The first job, in declaration order, with an edge to `job_id`.
///
/// `false` edges can never be followed, so they do not make a parent.
fn find_upstream(edges: &[(JobId, IndexMap<JobId, CompiledEdge>)], job_id: &str) -> Option<JobId> {
    let mut parents = edges
        .iter()
        .filter(|(_, next)| {
            next.get(job_id)
                .is_some_and(|edge| !matches!(edge, CompiledEdge::Flag(false)))
        })
        .map(|(id, _)| id);

    let first = parents.next()?.clone();
    let others: Vec<&JobId> = parents.collect();
    if !others.is_empty() {
        warn!(
            job_id,
            previous = %first,
            ignored = ?others,
            "job has more than one upstream; only the first is used as its input"
        );
    }
    Some(first)
}

fn has_cycle(edges: &[(JobId, IndexMap<JobId, CompiledEdge>)]) -> bool {
    let mut in_degree: HashMap<&str, usize> = edges.iter().map(|(id, _)| (id.as_str(), 0)).collect();
    for (_, next) in edges {
        for target in next.keys() {
            *in_degree.entry(target.as_str()).or_insert(0) += 1;
        }
    }

    // Seed the queue with jobs that have no incoming edges.
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();

    let adjacency: HashMap<&str, &IndexMap<JobId, CompiledEdge>> =
        edges.iter().map(|(id, next)| (id.as_str(), next)).collect();

    let mut visited = 0usize;
    while let Some(job_id) = queue.pop_front() {
        visited += 1;
        if let Some(next) = adjacency.get(job_id) {
            for target in next.keys() {
                let deg = in_degree.entry(target.as_str()).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(target.as_str());
                }
            }
        }
    }

    // If we didn't visit every job the graph contains a cycle.
    visited != edges.len()
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EdgeRule;

    #[test]
    fn missing_ids_are_generated_in_order() {
        let plan = ExecutionPlan::new(vec![
            Job::default().then("b"),
            Job::new("b"),
            Job::default(),
        ]);
        let compiled = compile_plan(plan).expect("should compile");
        let ids: Vec<&str> = compiled.jobs.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["job-1", "b", "job-2"]);
        assert_eq!(compiled.start, "job-1");
    }

    #[test]
    fn previous_is_first_declared_upstream() {
        //   a
        //  / \
        // b   c
        //  \ /
        //   d
        let plan = ExecutionPlan::new(vec![
            Job::new("a").then("b").then("c"),
            Job::new("b").then("d"),
            Job::new("c").then("d"),
            Job::new("d"),
        ]);
        let compiled = compile_plan(plan).expect("should compile");
        assert_eq!(compiled.jobs["a"].previous, None);
        assert_eq!(compiled.jobs["c"].previous.as_deref(), Some("a"));
        assert_eq!(compiled.jobs["d"].previous.as_deref(), Some("b"));
    }

    #[test]
    fn false_edges_do_not_make_a_parent() {
        // a -(false)-> b <- c
        let plan = ExecutionPlan::new(vec![
            Job::new("a").with_edge("b", EdgeSpec::Always(false)),
            Job::new("c").then("b"),
            Job::new("b"),
        ]);
        let compiled = compile_plan(plan).expect("should compile");
        assert_eq!(compiled.jobs["b"].previous.as_deref(), Some("c"));
    }

    #[test]
    fn disabled_edges_still_make_a_parent() {
        let plan = ExecutionPlan::new(vec![
            Job::new("a").with_edge("b", EdgeSpec::disabled()),
            Job::new("c").then("b"),
            Job::new("b"),
        ]);
        let compiled = compile_plan(plan).expect("should compile");
        assert_eq!(compiled.jobs["b"].previous.as_deref(), Some("a"));
    }

    #[test]
    fn dangling_targets_are_all_reported() {
        let plan = ExecutionPlan::new(vec![
            Job::new("a").then("ghost"),
            Job::new("b").then("phantom"),
        ]);
        let err = compile_plan(plan).unwrap_err();
        assert_eq!(
            err.problems,
            vec![
                CompileProblem::UnknownTarget { from: "a".into(), to: "ghost".into() },
                CompileProblem::UnknownTarget { from: "b".into(), to: "phantom".into() },
            ]
        );
        let message = err.to_string();
        assert!(message.contains("a->ghost"));
        assert!(message.contains("b->phantom"));
    }

    #[test]
    fn bad_conditions_are_aggregated() {
        let plan = ExecutionPlan::new(vec![
            Job::new("a")
                .with_edge("b", EdgeSpec::when("state.x >"))
                .with_edge(
                    "c",
                    EdgeSpec::Rule(EdgeRule {
                        condition: Some("((".into()),
                        ..EdgeRule::default()
                    }),
                ),
            Job::new("b"),
            Job::new("c"),
        ]);
        let err = compile_plan(plan).unwrap_err();
        assert_eq!(err.problems.len(), 2);
        assert!(err.to_string().contains("a->b"));
        assert!(err.to_string().contains("a->c"));
    }

    #[test]
    fn duplicate_job_id_is_rejected() {
        let plan = ExecutionPlan::new(vec![Job::new("a"), Job::new("a")]);
        assert!(matches!(
            compile_plan(plan),
            Err(CompileError { problems }) if problems == vec![CompileProblem::DuplicateJobId("a".into())]
        ));
    }

    #[test]
    fn unknown_start_is_rejected() {
        let plan = ExecutionPlan::new(vec![Job::new("a")]).with_start("z");
        let err = compile_plan(plan).unwrap_err();
        assert_eq!(err.problems, vec![CompileProblem::UnknownStart("z".into())]);
    }

    #[test]
    fn cycle_is_detected() {
        // a → b → c → a  (cycle!)
        let plan = ExecutionPlan::new(vec![
            Job::new("a").then("b"),
            Job::new("b").then("c"),
            Job::new("c").then("a"),
        ]);
        let err = compile_plan(plan).unwrap_err();
        assert_eq!(err.problems, vec![CompileProblem::CycleDetected]);
    }

    #[test]
    fn empty_plan_is_rejected() {
        let err = compile_plan(ExecutionPlan::new(vec![])).unwrap_err();
        assert_eq!(err.problems, vec![CompileProblem::EmptyPlan]);
    }

    #[test]
    fn edge_shapes_compile() {
        let plan = ExecutionPlan::new(vec![
            Job::new("a")
                .with_edge("b", EdgeSpec::Always(false))
                .with_edge("c", EdgeSpec::disabled())
                .with_edge("d", EdgeSpec::when("true")),
            Job::new("b"),
            Job::new("c"),
            Job::new("d"),
        ]);
        let compiled = compile_plan(plan).expect("should compile");
        let next = &compiled.jobs["a"].next;
        assert!(matches!(next["b"], CompiledEdge::Flag(false)));
        assert!(matches!(
            next["c"],
            CompiledEdge::Conditional { condition: None, disabled: true }
        ));
        assert!(matches!(
            &next["d"],
            CompiledEdge::Conditional { condition: Some(c), disabled: false } if c.source() == "true"
        ));
    }
}
