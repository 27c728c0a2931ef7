//! Core domain models for execution plans.
//!
//! These types are the source of truth for what a plan looks like before it
//! is compiled. They round-trip through the JSON plan format accepted by the
//! CLI and produced by the run mapper.

use indexmap::IndexMap;
use sandbox::Expression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type JobId = String;

/// A value that is either given inline or fetched on demand by id.
///
/// In JSON, a bare string is a reference; anything else is inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Lazy<T> {
    Reference(String),
    Inline(T),
}

impl<T> Lazy<T> {
    pub fn reference(&self) -> Option<&str> {
        match self {
            Lazy::Reference(id) => Some(id),
            Lazy::Inline(_) => None,
        }
    }
}

/// Structured edge with an optional condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// How one job leads to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EdgeSpec {
    /// `true` always follows the edge, `false` never does.
    Always(bool),
    /// A condition source string.
    Condition(String),
    Rule(EdgeRule),
}

impl EdgeSpec {
    pub fn when(condition: impl Into<String>) -> Self {
        EdgeSpec::Condition(condition.into())
    }

    pub fn disabled() -> Self {
        EdgeSpec::Rule(EdgeRule {
            disabled: true,
            ..EdgeRule::default()
        })
    }
}

/// The `next` field of a job: a single target id or a map of edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextSpec {
    Target(JobId),
    Edges(IndexMap<JobId, EdgeSpec>),
}

/// A single step in the plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    /// Unique within the plan. Generated as `job-<n>` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    /// Job logic. A job without one passes its state straight through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<Expression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Lazy<Value>>,
    /// Globals merged under the job's input state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Lazy<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NextSpec>,
    /// Informational; the runtime does not install adaptors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptor: Option<String>,
}

impl Job {
    pub fn new(id: impl Into<JobId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with_expression(mut self, expression: impl Into<Expression>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn with_configuration(mut self, configuration: Lazy<Value>) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub fn with_state(mut self, state: Lazy<Value>) -> Self {
        self.state = Some(state);
        self
    }

    /// Add an edge to `target`, keeping declaration order.
    pub fn with_edge(mut self, target: impl Into<JobId>, edge: EdgeSpec) -> Self {
        let mut edges = match self.next.take() {
            Some(NextSpec::Edges(edges)) => edges,
            Some(NextSpec::Target(id)) => IndexMap::from([(id, EdgeSpec::Always(true))]),
            None => IndexMap::new(),
        };
        edges.insert(target.into(), edge);
        self.next = Some(NextSpec::Edges(edges));
        self
    }

    /// Shorthand for an unconditional edge to `target`.
    pub fn then(self, target: impl Into<JobId>) -> Self {
        self.with_edge(target, EdgeSpec::Always(true))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Job to start from. Defaults to the first declared job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<Lazy<Value>>,
}

/// A complete, uncompiled plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub options: PlanOptions,
}

impl ExecutionPlan {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self {
            id: None,
            jobs,
            options: PlanOptions::default(),
        }
    }

    /// A one-job plan running `expression`.
    pub fn from_expression(expression: impl Into<Expression>) -> Self {
        Self::new(vec![Job::default().with_expression(expression)])
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_start(mut self, start: impl Into<JobId>) -> Self {
        self.options.start = Some(start.into());
        self
    }

    pub fn with_initial_state(mut self, state: Lazy<Value>) -> Self {
        self.options.initial_state = Some(state);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plan_parses_every_edge_shape() {
        let plan: ExecutionPlan = serde_json::from_value(json!({
            "jobs": [
                { "id": "a", "expression": "data", "next": "b" },
                { "id": "b", "next": {
                    "c": true,
                    "d": "state.data.x > 1",
                    "e": { "condition": "true", "disabled": true }
                } },
                { "id": "c" }, { "id": "d" }, { "id": "e" }
            ],
            "options": { "start": "a", "initial_state": "clip-1" }
        }))
        .unwrap();

        assert_eq!(plan.jobs[0].next, Some(NextSpec::Target("b".into())));
        let Some(NextSpec::Edges(edges)) = &plan.jobs[1].next else {
            panic!("expected an edge map");
        };
        assert_eq!(edges["c"], EdgeSpec::Always(true));
        assert_eq!(edges["d"], EdgeSpec::when("state.data.x > 1"));
        assert!(matches!(&edges["e"], EdgeSpec::Rule(r) if r.disabled));
        assert_eq!(
            plan.options.initial_state,
            Some(Lazy::Reference("clip-1".into()))
        );
    }

    #[test]
    fn inline_configuration_is_not_a_reference() {
        let job: Job = serde_json::from_value(json!({
            "configuration": { "user": "x" },
            "state": "globals-1"
        }))
        .unwrap();
        assert!(matches!(job.configuration, Some(Lazy::Inline(_))));
        assert_eq!(job.state.as_ref().and_then(Lazy::reference), Some("globals-1"));
    }
}
