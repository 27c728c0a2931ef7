//! `engine` crate — plan models, compilation, and the single-run traversal.
//!
//! A plan is compiled once by [`compile_plan`] and walked by
//! [`execute_plan`], which runs each job through a [`sandbox::Sandbox`].

pub mod compile;
pub mod conditions;
pub mod error;
pub mod events;
pub mod job;
pub mod memory;
pub mod models;
pub mod plan;

pub use compile::{compile_plan, CompiledPlan};
pub use error::{CompileError, CompileProblem, EngineError};
pub use events::{Callbacks, Notification, ResolveError, Resolvers};
pub use memory::MemorySnapshot;
pub use models::{EdgeRule, EdgeSpec, ExecutionPlan, Job, JobId, Lazy, NextSpec, PlanOptions};
pub use plan::{execute_plan, ExecutionOptions};

#[cfg(test)]
mod executor_tests;
