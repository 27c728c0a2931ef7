//! The default sandbox: runs operation lists and JEXL job bodies.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::jexl;
use crate::{Expression, ExpressionFailure, Operation, OperationContext, RuntimeError, Sandbox};

/// Runs job logic in-process.
///
/// A source body is a list of JEXL statements, one per non-empty line. Each
/// statement is evaluated with the current state as its context and its value
/// becomes the new state. Lines starting with `//` are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardSandbox;

impl StandardSandbox {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sandbox for StandardSandbox {
    async fn execute(
        &self,
        expression: &Expression,
        state: Value,
        ctx: &OperationContext,
    ) -> Result<Value, ExpressionFailure> {
        match expression {
            Expression::Operations(ops) => run_operations(ops, state, ctx).await,
            Expression::Source(source) => run_source(source, state, ctx),
        }
    }
}

async fn run_operations(
    ops: &[Arc<dyn Operation>],
    mut state: Value,
    ctx: &OperationContext,
) -> Result<Value, ExpressionFailure> {
    for (index, op) in ops.iter().enumerate() {
        debug!(job_id = ctx.job_id(), operation = index, "running operation");
        match op.execute(state.clone(), ctx).await {
            Ok(next) => state = next,
            Err(error) => return Err(ExpressionFailure { error, state }),
        }
    }
    Ok(state)
}

fn statements(source: &str) -> Vec<&str> {
    source
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("//"))
        .collect()
}

fn run_source(
    source: &str,
    state: Value,
    ctx: &OperationContext,
) -> Result<Value, ExpressionFailure> {
    let statements = statements(source);

    // A body that does not parse never starts.
    for statement in &statements {
        if let Err(message) = jexl::check_syntax(statement) {
            return Err(ExpressionFailure {
                error: RuntimeError::Crash {
                    subtype: "SyntaxError".into(),
                    message,
                },
                state,
            });
        }
    }

    let evaluator = jexl::evaluator();
    let mut state = state;
    for (index, statement) in statements.iter().enumerate() {
        debug!(job_id = ctx.job_id(), statement = index, "evaluating statement");
        let result = evaluator
            .eval_in_context(statement, &state)
            .map_err(|e| e.to_string());
        match result {
            Ok(value) => state = value,
            Err(message) => {
                return Err(ExpressionFailure {
                    error: RuntimeError::Runtime {
                        subtype: "EvaluationError".into(),
                        message,
                    },
                    state,
                })
            }
        }
    }
    Ok(state)
}
