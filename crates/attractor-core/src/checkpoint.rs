use crate::{AttractorError, NodeOutcome, NodeStatus, PipelineStatus, RuntimeContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointNodeOutcome {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_next_ids: Vec<String>,
}

impl CheckpointNodeOutcome {
    pub fn from_runtime(outcome: &NodeOutcome) -> Self {
        Self {
            status: outcome.status.as_str().to_string(),
            notes: outcome.notes.clone(),
            failure_reason: outcome.failure_reason.clone(),
            preferred_label: outcome.preferred_label.clone(),
            suggested_next_ids: outcome.suggested_next_ids.clone(),
        }
    }

    pub fn to_runtime(&self) -> Result<NodeOutcome, AttractorError> {
        let mut outcome = NodeOutcome::with_status(NodeStatus::try_from(self.status.as_str())?);
        outcome.notes = self.notes.clone();
        outcome.failure_reason = self.failure_reason.clone();
        outcome.preferred_label = self.preferred_label.clone();
        outcome.suggested_next_ids = self.suggested_next_ids.clone();
        Ok(outcome)
    }
}

/// Serialized run state, written at `<logs_root>/checkpoint.json` after
/// every stage and on cancellation. `resume_at` names the node a resumed run
/// re-executes. Writes are not atomic; a torn file just means resume replays
/// the previous stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub timestamp: String,
    pub run_id: String,
    pub current_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<String>,
    pub completed_nodes: Vec<String>,
    pub node_retries: BTreeMap<String, u32>,
    pub node_outcomes: BTreeMap<String, CheckpointNodeOutcome>,
    pub context_values: RuntimeContext,
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_failure_reason: Option<String>,
}

impl CheckpointState {
    pub fn save_to_path(&self, path: &Path) -> Result<(), AttractorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                AttractorError::Runtime(format!(
                    "failed to create checkpoint parent directory '{}': {}",
                    parent.display(),
                    error
                ))
            })?;
        }

        let bytes = serde_json::to_vec_pretty(self).map_err(|error| {
            AttractorError::Runtime(format!("failed to serialize checkpoint: {error}"))
        })?;
        fs::write(path, bytes).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed writing checkpoint file '{}': {}",
                path.display(),
                error
            ))
        })?;
        tracing::debug!(path = %path.display(), "checkpoint saved");
        Ok(())
    }

    pub fn load_from_path(path: &Path) -> Result<Self, AttractorError> {
        let bytes = fs::read(path).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed reading checkpoint file '{}': {}",
                path.display(),
                error
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed deserializing checkpoint file '{}': {}",
                path.display(),
                error
            ))
        })
    }

    pub fn terminal_pipeline_status(&self) -> Result<Option<PipelineStatus>, AttractorError> {
        match self.terminal_status.as_deref() {
            Some("success") => Ok(Some(PipelineStatus::Success)),
            Some("fail") => Ok(Some(PipelineStatus::Fail)),
            Some("cancelled") => Ok(Some(PipelineStatus::Cancelled)),
            Some(other) => Err(AttractorError::Runtime(format!(
                "checkpoint has unknown terminal status '{other}'"
            ))),
            None => Ok(None),
        }
    }
}

pub fn checkpoint_file_path(logs_root: &Path) -> PathBuf {
    logs_root.join(CHECKPOINT_FILE_NAME)
}
