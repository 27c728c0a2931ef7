//! Job logic as carried by a plan.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Operation;

/// The body of a job.
///
/// Plans loaded from JSON carry [`Expression::Source`]; code that builds
/// plans directly can hand over ready-made operations instead.
#[derive(Clone)]
pub enum Expression {
    /// Newline-separated JEXL statements, each one mapping state to state.
    Source(String),
    /// Operations run in order, each receiving the previous one's output.
    Operations(Vec<Arc<dyn Operation>>),
}

impl Expression {
    pub fn operations(ops: impl IntoIterator<Item = Arc<dyn Operation>>) -> Self {
        Expression::Operations(ops.into_iter().collect())
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            Expression::Source(src) => Some(src),
            Expression::Operations(_) => None,
        }
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Source(src) => f.debug_tuple("Source").field(src).finish(),
            Expression::Operations(ops) => write!(f, "Operations(<{} ops>)", ops.len()),
        }
    }
}

impl From<&str> for Expression {
    fn from(src: &str) -> Self {
        Expression::Source(src.to_string())
    }
}

impl From<String> for Expression {
    fn from(src: String) -> Self {
        Expression::Source(src)
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Expression::Source(src) => serializer.serialize_str(src),
            // Operations are in-process values and have no wire form.
            Expression::Operations(_) => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Expression::Source)
    }
}
