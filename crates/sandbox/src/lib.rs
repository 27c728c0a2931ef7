//! `sandbox` crate — job logic, the error taxonomy, and the capability that
//! runs one against the other.
//!
//! The runtime dispatches job bodies through the [`Sandbox`] trait object and
//! classifies every failure with [`RuntimeError`].

pub mod error;
pub mod expression;
pub mod jexl;
pub mod mock;
pub mod runner;
pub mod traits;

pub use error::{ErrorReport, RuntimeError, Severity};
pub use expression::Expression;
pub use runner::StandardSandbox;
pub use traits::{
    operation, ExpressionFailure, JobLog, LogLevel, LogSink, Operation, OperationContext, Sandbox,
};
