use crate::handlers::{NodeHandler, StageEnv};
use crate::{
    AttractorError, Graph, JjRunner, Node, NodeOutcome, RuntimeContext, WorkspaceInfo, jj,
    stage_dir, write_json_file,
};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Workspace stages drive the external `jj` runner. Create carves a fresh
/// workspace off the repository, merge rebases its tip back onto the base
/// revision, cleanup forgets the workspace and removes the directory. State
/// lives under the `workspace.*` context keys.
pub struct WorkspaceCreateHandler {
    runner: Arc<dyn JjRunner>,
}

pub struct WorkspaceMergeHandler {
    runner: Arc<dyn JjRunner>,
}

pub struct WorkspaceCleanupHandler {
    runner: Arc<dyn JjRunner>,
}

impl WorkspaceCreateHandler {
    pub fn new(runner: Arc<dyn JjRunner>) -> Self {
        Self { runner }
    }
}

impl WorkspaceMergeHandler {
    pub fn new(runner: Arc<dyn JjRunner>) -> Self {
        Self { runner }
    }
}

impl WorkspaceCleanupHandler {
    pub fn new(runner: Arc<dyn JjRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl NodeHandler for WorkspaceCreateHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        _graph: &Graph,
        env: &StageEnv,
    ) -> Result<NodeOutcome, AttractorError> {
        let repo_root = match jj::repo_root(self.runner.as_ref(), None).await {
            Ok(root) => root,
            Err(error) => return Ok(NodeOutcome::failure(error.to_string())),
        };

        let name = node
            .attrs
            .get_str("workspace_name")
            .filter(|value| !value.trim().is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| format!("{}-{}", env.run_id, node.id));
        let path = workspace_path(node, &repo_root, &name, context);

        if let Err(error) =
            jj::workspace_add(self.runner.as_ref(), Path::new(&repo_root), &path, &name).await
        {
            return Ok(NodeOutcome::failure(error.to_string()));
        }
        let base_commit = jj::tip_commit(self.runner.as_ref(), &path).await.ok();

        let info = WorkspaceInfo {
            name,
            path: path.to_string_lossy().to_string(),
            repo_root,
            base_commit,
            tip_commit: None,
            merged: false,
            cleaned_up: false,
        };
        write_workspace_artifact(node, env, &info)?;

        let mut outcome = NodeOutcome::success()
            .with_note(format!("workspace '{}' created", info.name));
        outcome.context_updates = workspace_updates(&info);
        Ok(outcome)
    }
}

#[async_trait]
impl NodeHandler for WorkspaceMergeHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        _graph: &Graph,
        env: &StageEnv,
    ) -> Result<NodeOutcome, AttractorError> {
        let Some(mut info) = workspace_from_context(context) else {
            return Ok(NodeOutcome::failure("no workspace recorded in context"));
        };

        let workspace = PathBuf::from(&info.path);
        let tip = match jj::tip_commit(self.runner.as_ref(), &workspace).await {
            Ok(tip) => tip,
            Err(error) => return Ok(NodeOutcome::failure(error.to_string())),
        };
        let destination = node
            .attrs
            .get_str("merge_destination")
            .unwrap_or("trunk()")
            .to_string();
        if let Err(error) =
            jj::rebase_onto(self.runner.as_ref(), &workspace, &tip, &destination).await
        {
            return Ok(NodeOutcome::failure(error.to_string()));
        }

        info.tip_commit = Some(tip);
        info.merged = true;
        write_workspace_artifact(node, env, &info)?;

        let mut outcome = NodeOutcome::success()
            .with_note(format!("workspace '{}' merged", info.name));
        outcome.context_updates = workspace_updates(&info);
        Ok(outcome)
    }
}

#[async_trait]
impl NodeHandler for WorkspaceCleanupHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        _graph: &Graph,
        env: &StageEnv,
    ) -> Result<NodeOutcome, AttractorError> {
        let Some(mut info) = workspace_from_context(context) else {
            return Ok(NodeOutcome::failure("no workspace recorded in context"));
        };

        if let Err(error) = jj::workspace_forget(
            self.runner.as_ref(),
            Path::new(&info.repo_root),
            &info.name,
        )
        .await
        {
            return Ok(NodeOutcome::failure(error.to_string()));
        }
        let _ = std::fs::remove_dir_all(&info.path);

        info.cleaned_up = true;
        write_workspace_artifact(node, env, &info)?;

        let mut outcome = NodeOutcome::success()
            .with_note(format!("workspace '{}' cleaned up", info.name));
        outcome.context_updates = workspace_updates(&info);
        Ok(outcome)
    }
}

fn workspace_path(
    node: &Node,
    repo_root: &str,
    name: &str,
    context: &RuntimeContext,
) -> PathBuf {
    if let Some(path) = node.attrs.get_str("workspace_path") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Some(Value::String(path)) = context.get("workspace.path") {
        return PathBuf::from(path);
    }
    Path::new(repo_root)
        .join(".attractor-workspaces")
        .join(name)
}

pub fn workspace_from_context(context: &RuntimeContext) -> Option<WorkspaceInfo> {
    let string_key = |key: &str| {
        context
            .get(key)
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    };
    Some(WorkspaceInfo {
        name: string_key("workspace.name")?,
        path: string_key("workspace.path")?,
        repo_root: string_key("workspace.repo_root")?,
        base_commit: string_key("workspace.base_commit"),
        tip_commit: string_key("workspace.tip_commit"),
        merged: context
            .get("workspace.merged")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        cleaned_up: context
            .get("workspace.cleaned_up")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

pub fn workspace_updates(info: &WorkspaceInfo) -> RuntimeContext {
    let mut updates = RuntimeContext::new();
    updates.insert("workspace.name".to_string(), Value::String(info.name.clone()));
    updates.insert("workspace.path".to_string(), Value::String(info.path.clone()));
    updates.insert(
        "workspace.repo_root".to_string(),
        Value::String(info.repo_root.clone()),
    );
    if let Some(base) = &info.base_commit {
        updates.insert(
            "workspace.base_commit".to_string(),
            Value::String(base.clone()),
        );
    }
    if let Some(tip) = &info.tip_commit {
        updates.insert(
            "workspace.tip_commit".to_string(),
            Value::String(tip.clone()),
        );
    }
    updates.insert("workspace.merged".to_string(), Value::Bool(info.merged));
    updates.insert(
        "workspace.cleaned_up".to_string(),
        Value::Bool(info.cleaned_up),
    );
    updates
}

fn write_workspace_artifact(
    node: &Node,
    env: &StageEnv,
    info: &WorkspaceInfo,
) -> Result<(), AttractorError> {
    let Some(logs_root) = env.logs_root.as_ref() else {
        return Ok(());
    };
    write_json_file(
        &stage_dir(logs_root, &node.id).join("workspace.json"),
        &serde_json::to_value(info).map_err(|error| {
            AttractorError::Runtime(format!("failed to serialize workspace info: {error}"))
        })?,
    )
}
