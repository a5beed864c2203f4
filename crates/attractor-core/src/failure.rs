use crate::{FailureClass, NodeOutcome, stage_dir};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What a failed run shows the user: the first failed stage, its failure
/// class, a one-line digest, and where the logs live.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineFailureSummary {
    pub failed_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failing_check: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerun_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

pub fn derive_failure_summary(
    node_id: &str,
    outcome: &NodeOutcome,
    logs_root: Option<&Path>,
) -> PipelineFailureSummary {
    let tool = outcome.tool_failure.as_ref();

    let digest = tool
        .map(|tool| tool.digest.clone())
        .or_else(|| outcome.failure_reason.clone())
        .or_else(|| outcome.notes.clone())
        .unwrap_or_else(|| format!("stage '{node_id}' failed"));

    // Tool failures point at the exact attempt directory; everything else at
    // the stage directory.
    let logs_path = logs_root.map(|root| {
        tool.and_then(|tool| tool.artifact_paths.first().cloned())
            .and_then(|artifact| {
                Path::new(&artifact)
                    .parent()
                    .map(|dir| dir.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| stage_dir(root, node_id).to_string_lossy().to_string())
    });

    PipelineFailureSummary {
        failed_node: node_id.to_string(),
        failure_class: outcome.failure_class.or(tool.map(|tool| tool.failure_class)),
        digest,
        first_failing_check: tool.and_then(|tool| tool.first_failing_check.clone()),
        rerun_command: tool.map(|tool| tool.command.clone()),
        logs_path,
        failure_reason: outcome.failure_reason.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolFailure;

    #[test]
    fn derive_failure_summary_tool_failure_expected_attempt_dir() {
        let mut outcome = NodeOutcome::failure_with_class("exit 1", FailureClass::ExitNonzero);
        outcome.tool_failure = Some(ToolFailure {
            command: "cargo test".to_string(),
            exit_code: Some(1),
            signal: None,
            duration_ms: 900,
            failure_class: FailureClass::ExitNonzero,
            digest: "test suite failed".to_string(),
            stderr_tail: vec!["error: failed".to_string()],
            stdout_tail: Vec::new(),
            first_failing_check: Some("tests::retry_budget".to_string()),
            artifact_paths: vec!["/logs/build/attempt-2/stderr.log".to_string()],
        });

        let summary = derive_failure_summary("build", &outcome, Some(Path::new("/logs")));
        assert_eq!(summary.digest, "test suite failed");
        assert_eq!(summary.rerun_command.as_deref(), Some("cargo test"));
        assert_eq!(summary.logs_path.as_deref(), Some("/logs/build/attempt-2"));
        assert_eq!(
            summary.first_failing_check.as_deref(),
            Some("tests::retry_budget")
        );
    }

    #[test]
    fn derive_failure_summary_plain_failure_expected_stage_dir() {
        let outcome = NodeOutcome::failure("model not found");
        let summary = derive_failure_summary("plan", &outcome, Some(Path::new("/logs")));
        assert_eq!(summary.digest, "model not found");
        assert_eq!(summary.logs_path.as_deref(), Some("/logs/plan"));
        assert_eq!(summary.rerun_command, None);
    }
}
