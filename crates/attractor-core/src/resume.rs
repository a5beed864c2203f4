use crate::{
    AttractorError, CheckpointState, ContextStore, Graph, JjRunner, NodeOutcome, PipelineStatus,
    RuntimeContext, checkpoint_file_path, jj,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Restored run state. `resume_node` is re-executed, not skipped; a
/// checkpoint with a terminal status resumes as a no-op.
#[derive(Clone, Debug)]
pub struct ResumeRuntimeState {
    pub checkpoint_run_id: String,
    pub context: RuntimeContext,
    pub logs: Vec<String>,
    pub completed_nodes: Vec<String>,
    pub node_retries: BTreeMap<String, u32>,
    pub node_outcomes: BTreeMap<String, NodeOutcome>,
    pub resume_node: Option<String>,
    pub terminal_status: Option<PipelineStatus>,
    pub terminal_failure_reason: Option<String>,
}

pub fn build_resume_state(
    graph: &Graph,
    checkpoint_path: &Path,
) -> Result<ResumeRuntimeState, AttractorError> {
    let checkpoint = CheckpointState::load_from_path(checkpoint_path)?;
    let terminal_status = checkpoint.terminal_pipeline_status()?;

    let resume_node = if terminal_status.is_some() {
        None
    } else {
        let target = checkpoint
            .resume_at
            .clone()
            .unwrap_or_else(|| checkpoint.current_node.clone());
        if !graph.nodes.contains_key(&target) {
            return Err(AttractorError::Runtime(format!(
                "resume checkpoint points to unknown node '{target}'"
            )));
        }
        Some(target)
    };

    let mut node_outcomes = BTreeMap::new();
    for (node_id, stored) in &checkpoint.node_outcomes {
        node_outcomes.insert(node_id.clone(), stored.to_runtime()?);
    }

    Ok(ResumeRuntimeState {
        checkpoint_run_id: checkpoint.run_id.clone(),
        context: checkpoint.context_values.clone(),
        logs: checkpoint.logs.clone(),
        completed_nodes: checkpoint.completed_nodes.clone(),
        node_retries: checkpoint.node_retries.clone(),
        node_outcomes,
        resume_node,
        terminal_status,
        terminal_failure_reason: checkpoint.terminal_failure_reason.clone(),
    })
}

pub fn checkpoint_path_for_run(
    logs_root: Option<&Path>,
    explicit_checkpoint_path: Option<&Path>,
) -> Option<PathBuf> {
    explicit_checkpoint_path
        .map(Path::to_path_buf)
        .or_else(|| logs_root.map(checkpoint_file_path))
}

/// A checkpoint can reference a jj workspace whose directory is gone (the
/// user interrupted a run after `workspace_create`). Re-add the workspace
/// and, when a tip commit was captured, edit back onto it. Returns whether a
/// recovery happened.
pub async fn recover_workspace(
    runner: &dyn JjRunner,
    context: &ContextStore,
) -> Result<bool, AttractorError> {
    let string_key = |key: &str| -> Result<Option<String>, AttractorError> {
        Ok(context.get(key)?.and_then(|value| match value {
            Value::String(inner) => Some(inner),
            _ => None,
        }))
    };

    let Some(path) = string_key("workspace.path")? else {
        return Ok(false);
    };
    if context
        .get("workspace.cleaned_up")?
        .and_then(|value| value.as_bool())
        .unwrap_or(false)
    {
        return Ok(false);
    }
    if Path::new(&path).is_dir() {
        return Ok(false);
    }
    let (Some(name), Some(repo_root)) =
        (string_key("workspace.name")?, string_key("workspace.repo_root")?)
    else {
        return Ok(false);
    };

    tracing::info!(workspace = %name, path = %path, "recovering missing jj workspace");
    jj::workspace_add(runner, Path::new(&repo_root), Path::new(&path), &name).await?;
    if let Some(tip) = string_key("workspace.tip_commit")? {
        if !tip.is_empty() {
            jj::edit_commit(runner, Path::new(&path), &tip).await?;
        }
    }
    Ok(true)
}
