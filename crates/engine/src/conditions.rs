//! Compiled edge conditions.

use std::fmt;
use std::sync::Arc;

use sandbox::{jexl, RuntimeError};
use serde_json::{json, Value};

/// A syntax-checked JEXL predicate over an upstream job's result.
///
/// The result is bound to `state` when the condition is evaluated, so
/// `state.data.count > 0` and `state|hasError('fetch')` both work.
#[derive(Clone)]
pub struct EdgeCondition {
    source: Arc<str>,
}

impl EdgeCondition {
    /// Parse `source` and keep it ready for evaluation.
    ///
    /// # Errors
    /// Returns the parser's message when `source` is not valid JEXL.
    pub fn compile(source: &str) -> Result<Self, String> {
        jexl::check_syntax(source)?;
        Ok(Self {
            source: Arc::from(source),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `state` with JavaScript truthiness.
    ///
    /// # Errors
    /// [`RuntimeError::EdgeCondition`] when evaluation fails.
    pub fn evaluate(&self, state: &Value) -> Result<bool, RuntimeError> {
        let context = json!({ "state": state });
        jexl::evaluator()
            .eval_in_context(&self.source, &context)
            .map(|value| jexl::truthy(&value))
            .map_err(|e| {
                RuntimeError::EdgeCondition(format!(
                    "edge condition `{}` failed: {e}",
                    self.source
                ))
            })
    }
}

impl fmt::Debug for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EdgeCondition").field(&self.source).finish()
    }
}
