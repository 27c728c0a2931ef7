//! Event names and payload shapes of the remote queue protocol.

use chrono::{DateTime, Utc};
use engine::{Lazy, MemorySnapshot};
use sandbox::{LogLevel, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control topic every worker joins.
pub const WORKER_QUEUE: &str = "worker:queue";
pub const CLAIM: &str = "runs:claim";

pub const GET_PLAN: &str = "fetch:plan";
pub const GET_CREDENTIAL: &str = "fetch:credential";
pub const GET_DATACLIP: &str = "fetch:dataclip";
pub const STEP_START: &str = "step:start";
pub const STEP_COMPLETE: &str = "step:complete";
pub const RUN_LOG: &str = "workflow:log";
pub const RUN_COMPLETE: &str = "workflow:complete";

/// Topic of a single run's channel.
pub fn run_topic(run_id: &str) -> String {
    format!("run:{run_id}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClaimPayload {
    pub demand: usize,
}

/// A run handed to this worker, with the token that lets it join the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedRun {
    pub id: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimReply {
    #[serde(default)]
    pub runs: Vec<ClaimedRun>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunDescriptor {
    pub id: String,
    #[serde(default)]
    pub jobs: Vec<RunJob>,
    #[serde(default)]
    pub triggers: Vec<RunTrigger>,
    #[serde(default)]
    pub edges: Vec<RunEdge>,
    #[serde(default)]
    pub starting_node_id: Option<String>,
    #[serde(default)]
    pub dataclip_id: Option<String>,
    #[serde(default)]
    pub options: Option<RunSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunJob {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub adaptor: Option<String>,
    /// Inline credential, or the id of one when given as a string.
    #[serde(default)]
    pub credential: Option<Lazy<Value>>,
    #[serde(default)]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub state: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunTrigger {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunEdge {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub source_job_id: Option<String>,
    #[serde(default)]
    pub source_trigger_id: Option<String>,
    pub target_job_id: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Per-run settings sent with the descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSettings {
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
    #[serde(default)]
    pub job_timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    /// Send each step's output body with `step:complete`. Defaults to true.
    #[serde(default)]
    pub output_dataclips: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reason {
    Success,
    Fail,
    Crash,
    Kill,
}

impl From<Severity> for Reason {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Fail => Reason::Fail,
            Severity::Crash => Reason::Crash,
            Severity::Kill => Reason::Kill,
        }
    }
}

/// Why a step or a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReason {
    pub reason: Reason,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl ExitReason {
    pub fn success() -> Self {
        Self {
            reason: Reason::Success,
            error_type: None,
            error_message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.reason == Reason::Success
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStartPayload {
    pub job_id: String,
    pub step_id: String,
    pub input_dataclip_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompletePayload {
    pub step_id: String,
    pub job_id: String,
    pub output_dataclip_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dataclip: Option<String>,
    #[serde(flatten)]
    pub exit: ExitReason,
    pub mem: MemorySnapshot,
    /// Milliseconds.
    pub duration: u64,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogPayload {
    pub run_id: String,
    pub job_id: String,
    pub step_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletePayload {
    pub final_dataclip_id: Option<String>,
    #[serde(flatten)]
    pub exit: ExitReason,
}
