use crate::AttractorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Thin process boundary around the `jj` VCS. Errors carry the command line
/// and stderr; callers decide whether a failure is fatal.
#[async_trait]
pub trait JjRunner: Send + Sync {
    async fn run(&self, args: &[&str], cwd: Option<&Path>) -> Result<String, AttractorError>;
}

#[derive(Clone, Debug)]
pub struct CommandJjRunner {
    binary: String,
}

impl Default for CommandJjRunner {
    fn default() -> Self {
        Self {
            binary: "jj".to_string(),
        }
    }
}

impl CommandJjRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl JjRunner for CommandJjRunner {
    async fn run(&self, args: &[&str], cwd: Option<&Path>) -> Result<String, AttractorError> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|error| {
            AttractorError::Runtime(format!(
                "failed to spawn 'jj {}': {}",
                args.join(" "),
                error
            ))
        })?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            let _ = pipe.read_to_string(&mut stdout).await;
        }
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        let status = child.wait().await.map_err(|error| {
            AttractorError::Runtime(format!(
                "failed waiting for 'jj {}': {}",
                args.join(" "),
                error
            ))
        })?;

        if !status.success() {
            return Err(AttractorError::Runtime(format!(
                "'jj {}' exited with {}: {}",
                args.join(" "),
                status.code().map_or("signal".to_string(), |c| c.to_string()),
                stderr.trim()
            )));
        }

        Ok(stdout)
    }
}

/// Context keys the workspace handlers maintain.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub name: String,
    pub path: String,
    pub repo_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip_commit: Option<String>,
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub cleaned_up: bool,
}

pub async fn repo_root(runner: &dyn JjRunner, cwd: Option<&Path>) -> Result<String, AttractorError> {
    Ok(runner.run(&["root"], cwd).await?.trim().to_string())
}

pub async fn tip_commit(runner: &dyn JjRunner, cwd: &Path) -> Result<String, AttractorError> {
    let output = runner
        .run(
            &["log", "-r", "@", "--no-graph", "-T", "commit_id"],
            Some(cwd),
        )
        .await?;
    Ok(output.trim().to_string())
}

pub async fn workspace_add(
    runner: &dyn JjRunner,
    repo_root: &Path,
    workspace_path: &Path,
    name: &str,
) -> Result<(), AttractorError> {
    let path = workspace_path.to_string_lossy().to_string();
    runner
        .run(
            &["workspace", "add", "--name", name, path.as_str()],
            Some(repo_root),
        )
        .await?;
    Ok(())
}

pub async fn workspace_forget(
    runner: &dyn JjRunner,
    repo_root: &Path,
    name: &str,
) -> Result<(), AttractorError> {
    runner
        .run(&["workspace", "forget", name], Some(repo_root))
        .await?;
    Ok(())
}

pub async fn edit_commit(
    runner: &dyn JjRunner,
    cwd: &Path,
    commit: &str,
) -> Result<(), AttractorError> {
    runner.run(&["edit", commit], Some(cwd)).await?;
    Ok(())
}

pub async fn rebase_onto(
    runner: &dyn JjRunner,
    cwd: &Path,
    source: &str,
    destination: &str,
) -> Result<(), AttractorError> {
    runner
        .run(&["rebase", "-s", source, "-d", destination], Some(cwd))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct ScriptedJjRunner {
        pub calls: Mutex<Vec<Vec<String>>>,
        pub replies: Mutex<Vec<Result<String, String>>>,
    }

    #[async_trait]
    impl JjRunner for ScriptedJjRunner {
        async fn run(&self, args: &[&str], _cwd: Option<&Path>) -> Result<String, AttractorError> {
            self.calls
                .lock()
                .expect("calls mutex should lock")
                .push(args.iter().map(ToString::to_string).collect());
            match self
                .replies
                .lock()
                .expect("replies mutex should lock")
                .pop()
            {
                Some(Ok(output)) => Ok(output),
                Some(Err(message)) => Err(AttractorError::Runtime(message)),
                None => Ok(String::new()),
            }
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tip_commit_trims_output() {
        let runner = ScriptedJjRunner::default();
        runner
            .replies
            .lock()
            .expect("replies mutex should lock")
            .push(Ok("abc123\n".to_string()));

        let commit = tip_commit(&runner, Path::new("/ws")).await.expect("tip resolves");
        assert_eq!(commit, "abc123");
        let calls = runner.calls.lock().expect("calls mutex should lock");
        assert_eq!(calls[0][0], "log");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn workspace_add_passes_name_and_path() {
        let runner = ScriptedJjRunner::default();
        workspace_add(&runner, Path::new("/repo"), Path::new("/repo/ws"), "build")
            .await
            .expect("workspace add succeeds");
        let calls = runner.calls.lock().expect("calls mutex should lock");
        assert_eq!(
            calls[0],
            vec!["workspace", "add", "--name", "build", "/repo/ws"]
        );
    }
}
