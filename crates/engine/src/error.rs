//! Engine-level error types.

use std::fmt;

use sandbox::{RuntimeError, Severity};
use thiserror::Error;

/// One reason a plan failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileProblem {
    #[error("plan contains no jobs")]
    EmptyPlan,

    /// Two or more jobs share the same id.
    #[error("duplicate job id: '{0}'")]
    DuplicateJobId(String),

    /// An edge points at a job that does not exist.
    #[error("edge {from}->{to} references unknown job '{to}'")]
    UnknownTarget { from: String, to: String },

    #[error("start job '{0}' does not exist")]
    UnknownStart(String),

    #[error("Failed to compile edge condition {from}->{to} ({message})")]
    Condition {
        from: String,
        to: String,
        message: String,
    },

    /// Topological sort detected a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,
}

/// Every problem found while compiling one plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub problems: Vec<CompileProblem>,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, problem) in self.problems.iter().enumerate() {
            if i > 0 {
                f.write_str("\n\n")?;
            }
            write!(f, "{problem}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Errors that abort a run.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The plan never started.
    #[error("plan failed to compile: {0}")]
    Compile(#[from] CompileError),

    /// A job raised a crash or kill severity error.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The host stopped the run before `next` could start.
    #[error("run cancelled before job '{next}' started")]
    Cancelled { next: String },
}

impl EngineError {
    pub fn severity(&self) -> Severity {
        match self {
            EngineError::Compile(_) => Severity::Crash,
            EngineError::Runtime(err) => err.severity(),
            EngineError::Cancelled { .. } => Severity::Kill,
        }
    }

    pub fn error_type(&self) -> &str {
        match self {
            EngineError::Compile(_) => "CompileError",
            EngineError::Runtime(err) => err.error_type(),
            EngineError::Cancelled { .. } => "CancelledError",
        }
    }
}
