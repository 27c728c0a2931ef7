//! Exit reasons for steps and runs.

use indexmap::IndexMap;
use pool::RunFailure;
use sandbox::RuntimeError;
use serde_json::Value;

use crate::protocol::{ExitReason, Reason};

/// Why a step ended.
///
/// An error raised by the step wins. Otherwise a report under
/// `state.errors[job_id]` means the job failed softly.
pub fn calculate_job_exit_reason(job_id: &str, state: &Value, error: Option<&RuntimeError>) -> ExitReason {
    if let Some(error) = error {
        return ExitReason {
            reason: error.severity().into(),
            error_type: Some(error.error_type().to_string()),
            error_message: Some(error.message()),
        };
    }

    match state.get("errors").and_then(|errors| errors.get(job_id)) {
        Some(report) if !report.is_null() => ExitReason {
            reason: Reason::Fail,
            error_type: Some(
                report
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("Error")
                    .to_string(),
            ),
            error_message: report
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        _ => ExitReason::success(),
    }
}

/// Why a run ended: the first step that did not succeed, in the order the
/// steps finished.
pub fn calculate_run_exit_reason(reasons: &IndexMap<String, ExitReason>) -> ExitReason {
    reasons
        .values()
        .find(|r| !r.is_success())
        .cloned()
        .unwrap_or_else(ExitReason::success)
}

impl From<&RunFailure> for ExitReason {
    fn from(failure: &RunFailure) -> Self {
        Self {
            reason: failure.severity.into(),
            error_type: Some(failure.error_type.clone()),
            error_message: Some(failure.message.clone()),
        }
    }
}
