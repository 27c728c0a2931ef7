//! Error taxonomy shared by every layer of the executor.
//!
//! Every failure that can happen while a job runs is one of the closed
//! [`RuntimeError`] variants. Each variant maps to exactly one [`Severity`],
//! and the severity alone decides whether a run keeps going.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// How bad an error is for the run that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The job failed; the run continues.
    Fail,
    /// The run is aborted.
    Crash,
    /// The run is aborted for a security or resource reason.
    Kill,
}

impl Severity {
    /// `true` for severities that abort the run.
    pub fn is_fatal(self) -> bool {
        !matches!(self, Severity::Fail)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Fail => "fail",
            Severity::Crash => "crash",
            Severity::Kill => "kill",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every error a job can raise while it is being executed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    // fail

    /// The job logic itself reported a failure.
    #[error("{message}")]
    Job { message: String },

    /// An operation supplied by an adaptor failed.
    #[error("{message}")]
    Adaptor {
        message: String,
        details: Option<Value>,
    },

    /// A runtime failure inside job logic, such as a type error.
    #[error("{subtype}: {message}")]
    Runtime { subtype: String, message: String },

    // crash

    /// Job logic could not even start, e.g. a syntax error in its source.
    #[error("{subtype}: {message}")]
    Crash { subtype: String, message: String },

    /// A module required by the job could not be loaded.
    #[error("{0}")]
    Import(String),

    /// An edge condition threw while deciding which jobs run next.
    #[error("{0}")]
    EdgeCondition(String),

    /// The plan or the state handed to a job is malformed.
    #[error("{0}")]
    Validation(String),

    /// A lazily-referenced input could not be resolved.
    #[error("{0}")]
    Input(String),

    // kill

    /// Job logic tried to do something it is not allowed to do.
    #[error("{0}")]
    Security(String),

    /// Job logic ran past its wall-clock budget (milliseconds).
    #[error("Job took longer than {0}ms to complete")]
    Timeout(u64),
}

impl RuntimeError {
    /// Convenience constructor for the most common failure.
    pub fn job(message: impl Into<String>) -> Self {
        RuntimeError::Job {
            message: message.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            RuntimeError::Job { .. }
            | RuntimeError::Adaptor { .. }
            | RuntimeError::Runtime { .. } => Severity::Fail,
            RuntimeError::Crash { .. }
            | RuntimeError::Import(_)
            | RuntimeError::EdgeCondition(_)
            | RuntimeError::Validation(_)
            | RuntimeError::Input(_) => Severity::Crash,
            RuntimeError::Security(_) | RuntimeError::Timeout(_) => Severity::Kill,
        }
    }

    /// Stable name of the error class.
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeError::Job { .. } => "JobError",
            RuntimeError::Adaptor { .. } => "AdaptorError",
            RuntimeError::Runtime { .. } => "RuntimeError",
            RuntimeError::Crash { .. } => "RuntimeCrash",
            RuntimeError::Import(_) => "ImportError",
            RuntimeError::EdgeCondition(_) => "EdgeConditionError",
            RuntimeError::Validation(_) => "ValidationError",
            RuntimeError::Input(_) => "InputError",
            RuntimeError::Security(_) => "SecurityError",
            RuntimeError::Timeout(_) => "TimeoutError",
        }
    }

    /// The underlying error kind, when the class wraps one.
    pub fn subtype(&self) -> Option<&str> {
        match self {
            RuntimeError::Runtime { subtype, .. } | RuntimeError::Crash { subtype, .. } => {
                Some(subtype)
            }
            _ => None,
        }
    }

    /// The type reported to observers: the subtype when present, else the name.
    pub fn error_type(&self) -> &str {
        self.subtype().unwrap_or_else(|| self.name())
    }

    /// The message without the subtype prefix.
    pub fn message(&self) -> String {
        match self {
            RuntimeError::Runtime { message, .. } | RuntimeError::Crash { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }

    /// JSON rendering used inside error reports and on the wire.
    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "name": self.name(),
            "severity": self.severity(),
            "message": self.message(),
        });
        if let Some(subtype) = self.subtype() {
            value["subtype"] = json!(subtype);
        }
        if let RuntimeError::Adaptor {
            details: Some(details),
            ..
        } = self
        {
            value["details"] = details.clone();
        }
        value
    }

    /// Build the serializable report for an error raised by `job_id`.
    pub fn report(&self, job_id: &str) -> ErrorReport {
        ErrorReport {
            error_type: self.error_type().to_string(),
            job_id: job_id.to_string(),
            step_id: job_id.to_string(),
            message: self.message(),
            code: None,
            stack: None,
            error: self.to_value(),
        }
    }
}

/// Serializable description of a job error.
///
/// Soft failures are written into the job's output state under
/// `errors.<jobId>` using this shape, so downstream edge conditions can
/// inspect them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub error_type: String,
    pub job_id: String,
    pub step_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub error: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_fixed_per_class() {
        assert_eq!(RuntimeError::job("x").severity(), Severity::Fail);
        assert_eq!(
            RuntimeError::EdgeCondition("boom".into()).severity(),
            Severity::Crash
        );
        assert_eq!(RuntimeError::Validation("bad".into()).severity(), Severity::Crash);
        assert_eq!(RuntimeError::Timeout(10).severity(), Severity::Kill);
        assert_eq!(RuntimeError::Security("eval".into()).severity(), Severity::Kill);
    }

    #[test]
    fn error_type_prefers_subtype() {
        let err = RuntimeError::Runtime {
            subtype: "TypeError".into(),
            message: "x is not a function".into(),
        };
        assert_eq!(err.error_type(), "TypeError");
        assert_eq!(err.message(), "x is not a function");
        assert_eq!(RuntimeError::job("nope").error_type(), "JobError");
    }

    #[test]
    fn report_serializes_with_camel_case_keys() {
        let report = RuntimeError::job("nope").report("a");
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["type"], "JobError");
        assert_eq!(value["jobId"], "a");
        assert_eq!(value["message"], "nope");
        assert_eq!(value["error"]["severity"], "fail");
        assert!(value.get("code").is_none());
    }
}
