use crate::{AttractorError, RuntimeContext};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    PartialSuccess,
    Retry,
    Fail,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Retry => "retry",
            Self::Fail => "fail",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_success_like(self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }
}

impl TryFrom<&str> for NodeStatus {
    type Error = AttractorError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "success" => Ok(Self::Success),
            "partial_success" => Ok(Self::PartialSuccess),
            "retry" => Ok(Self::Retry),
            "fail" => Ok(Self::Fail),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AttractorError::Runtime(format!(
                "unknown node status '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    EmptyResponse,
    MissingStatusMarker,
    ToolResultSkipped,
    LlmError,
    ExitNonzero,
    Timeout,
    Killed,
    StageError,
    Cancelled,
    GoalGateUnmet,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmptyResponse => "empty_response",
            Self::MissingStatusMarker => "missing_status_marker",
            Self::ToolResultSkipped => "tool_result_skipped",
            Self::LlmError => "llm_error",
            Self::ExitNonzero => "exit_nonzero",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
            Self::StageError => "stage_error",
            Self::Cancelled => "cancelled",
            Self::GoalGateUnmet => "goal_gate_unmet",
        }
    }
}

/// Structured record of a failed tool invocation, attached to the outcome so
/// the failure summary can point at the exact command and artifacts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub command: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration_ms: u64,
    pub failure_class: FailureClass,
    pub digest: String,
    pub stderr_tail: Vec<String>,
    pub stdout_tail: Vec<String>,
    pub first_failing_check: Option<String>,
    pub artifact_paths: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeOutcome {
    pub status: NodeStatus,
    pub notes: Option<String>,
    pub failure_reason: Option<String>,
    pub failure_class: Option<FailureClass>,
    pub context_updates: RuntimeContext,
    pub logs: Vec<String>,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
    pub tool_failure: Option<ToolFailure>,
}

impl NodeOutcome {
    pub fn with_status(status: NodeStatus) -> Self {
        Self {
            status,
            notes: None,
            failure_reason: None,
            failure_class: None,
            context_updates: RuntimeContext::new(),
            logs: Vec::new(),
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            tool_failure: None,
        }
    }

    pub fn success() -> Self {
        Self::with_status(NodeStatus::Success)
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        let mut outcome = Self::with_status(NodeStatus::Retry);
        outcome.notes = Some(reason.into());
        outcome
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        let mut outcome = Self::with_status(NodeStatus::Fail);
        outcome.failure_reason = Some(reason.into());
        outcome
    }

    pub fn failure_with_class(reason: impl Into<String>, class: FailureClass) -> Self {
        let mut outcome = Self::failure(reason);
        outcome.failure_class = Some(class);
        outcome
    }

    pub fn cancelled() -> Self {
        let mut outcome = Self::with_status(NodeStatus::Cancelled);
        outcome.failure_class = Some(FailureClass::Cancelled);
        outcome
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes = Some(note.into());
        self
    }
}
