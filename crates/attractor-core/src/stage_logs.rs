use crate::{AttractorError, Node, NodeOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Directories a logs root must never resolve into.
const BLOCKED_LOG_ROOTS: &[&str] = &[
    "/etc", "/usr", "/bin", "/sbin", "/boot", "/dev", "/proc", "/sys",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageStatusRecord {
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub duration_ms: u64,
}

/// Lexically resolve `..`/`.` segments, reject blocked system prefixes, and
/// create the directory.
pub fn ensure_logs_root(path: &Path) -> Result<PathBuf, AttractorError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|error| {
                AttractorError::Runtime(format!("failed to resolve working directory: {error}"))
            })?
            .join(path)
    };

    let resolved = normalize_lexically(&absolute);
    if resolved == Path::new("/") {
        return Err(AttractorError::Runtime(
            "logs root must not be the filesystem root".to_string(),
        ));
    }
    for blocked in BLOCKED_LOG_ROOTS.iter().copied() {
        if resolved.starts_with(blocked) {
            return Err(AttractorError::Runtime(format!(
                "logs root '{}' resolves into blocked directory '{}'",
                resolved.display(),
                blocked
            )));
        }
    }

    fs::create_dir_all(&resolved).map_err(|error| {
        AttractorError::Runtime(format!(
            "failed to create logs root '{}': {}",
            resolved.display(),
            error
        ))
    })?;
    Ok(resolved)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    resolved
}

pub fn stage_dir(logs_root: &Path, node_id: &str) -> PathBuf {
    logs_root.join(node_id)
}

pub fn attempt_dir(logs_root: &Path, node_id: &str, attempt: u32) -> PathBuf {
    stage_dir(logs_root, node_id).join(format!("attempt-{attempt}"))
}

pub fn write_json_file(path: &Path, value: &Value) -> Result<(), AttractorError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed to create directory '{}': {}",
                parent.display(),
                error
            ))
        })?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|error| {
        AttractorError::Runtime(format!("failed to serialize '{}': {}", path.display(), error))
    })?;
    fs::write(path, bytes).map_err(|error| {
        AttractorError::Runtime(format!("failed writing '{}': {}", path.display(), error))
    })
}

pub fn write_text_file(path: &Path, contents: &str) -> Result<(), AttractorError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed to create directory '{}': {}",
                parent.display(),
                error
            ))
        })?;
    }
    fs::write(path, contents).map_err(|error| {
        AttractorError::Runtime(format!("failed writing '{}': {}", path.display(), error))
    })
}

/// Write the `prompt.md` / `response.md` / `status.json` set every stage
/// leaves behind. Prompt and response come from the stage's own context
/// updates (`<keybase>._prompt`, `<keybase>._full_response`) with the node
/// `prompt` attr as a fallback.
pub fn write_stage_artifacts(
    logs_root: Option<&Path>,
    node: &Node,
    key_base: &str,
    outcome: &NodeOutcome,
    duration_ms: u64,
) -> Result<(), AttractorError> {
    let Some(logs_root) = logs_root else {
        return Ok(());
    };
    let dir = stage_dir(logs_root, &node.id);

    let prompt = outcome
        .context_updates
        .get(&format!("{key_base}._prompt"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .or_else(|| node.attrs.get_str("prompt").map(ToOwned::to_owned))
        .unwrap_or_default();
    let response = outcome
        .context_updates
        .get(&format!("{key_base}._full_response"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    write_text_file(&dir.join("prompt.md"), &prompt)?;
    write_text_file(&dir.join("response.md"), response)?;

    let status = StageStatusRecord {
        outcome: outcome.status.as_str().to_string(),
        failure_reason: outcome.failure_reason.clone(),
        failure_class: outcome.failure_class.map(|class| class.as_str().to_string()),
        notes: outcome.notes.clone(),
        duration_ms,
    };
    write_json_file(
        &dir.join("status.json"),
        &serde_json::to_value(&status).map_err(|error| {
            AttractorError::Runtime(format!("failed to serialize stage status: {error}"))
        })?,
    )
}
