use crate::handlers::{NodeHandler, StageEnv};
use crate::{
    AttractorError, FailureClass, Graph, Node, NodeOutcome, RuntimeContext, ToolFailure,
    attempt_dir, expand_context_refs, response_key_base, write_json_file, write_text_file,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

const STREAM_TAIL_LINES: usize = 20;
const TOOL_OUTPUT_CONTEXT_CAP: usize = 10_000;

/// Runs the node's `tool_command` through the system shell. Context values
/// substitute for `$key` references; stdout/stderr land in per-attempt
/// artifacts; failures carry a structured `ToolFailure`.
#[derive(Debug, Default)]
pub struct ToolHandler;

#[async_trait]
impl NodeHandler for ToolHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        graph: &Graph,
        env: &StageEnv,
    ) -> Result<NodeOutcome, AttractorError> {
        let raw_command = node.attrs.get_str("tool_command").unwrap_or_default().trim();
        if raw_command.is_empty() {
            return Ok(NodeOutcome::failure_with_class(
                "no tool_command specified",
                FailureClass::StageError,
            ));
        }
        let command = expand_context_refs(raw_command, context);
        let timeout_ms = node
            .attrs
            .get_millis("timeout")
            .or_else(|| graph.attrs.get_millis("default_tool_timeout"));

        tracing::info!(node = %node.id, command = %command, "executing tool command");
        let started = Instant::now();
        let execution = run_shell_command(&command, timeout_ms, env).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let artifact_paths = write_attempt_artifacts(node, env, &command, &execution, duration_ms)?;

        let key_base = response_key_base(node);
        let mut outcome = match classify(&execution) {
            None => {
                let mut outcome = NodeOutcome::success()
                    .with_note(format!("Tool completed: {command}"));
                outcome.context_updates.insert(
                    "tool.output".to_string(),
                    Value::String(truncate_chars(&execution.stdout, TOOL_OUTPUT_CONTEXT_CAP)),
                );
                outcome
            }
            Some(FailureClass::Cancelled) => NodeOutcome::cancelled(),
            Some(class) => {
                let stderr_tail = tail_lines(&execution.stderr, STREAM_TAIL_LINES);
                let stdout_tail = tail_lines(&execution.stdout, STREAM_TAIL_LINES);
                let digest = failure_digest(&execution, class);
                let mut outcome = NodeOutcome::failure_with_class(digest.clone(), class);
                outcome.tool_failure = Some(ToolFailure {
                    command: command.clone(),
                    exit_code: execution.exit_code,
                    signal: execution.signal,
                    duration_ms,
                    failure_class: class,
                    digest,
                    stderr_tail,
                    stdout_tail,
                    first_failing_check: first_failing_check(&execution),
                    artifact_paths: artifact_paths.clone(),
                });
                outcome
            }
        };

        outcome
            .context_updates
            .insert(format!("{key_base}._prompt"), Value::String(command));
        outcome.context_updates.insert(
            format!("{key_base}._full_response"),
            Value::String(truncate_chars(&execution.stdout, TOOL_OUTPUT_CONTEXT_CAP)),
        );
        Ok(outcome)
    }
}

struct ShellExecution {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    signal: Option<i32>,
    timed_out: bool,
    cancelled: bool,
}

async fn run_shell_command(
    command: &str,
    timeout_ms: Option<u64>,
    env: &StageEnv,
) -> Result<ShellExecution, AttractorError> {
    let mut shell = Command::new("sh");
    shell
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        shell.process_group(0);
    }

    let mut child = shell.spawn().map_err(|error| {
        AttractorError::Runtime(format!("failed to spawn command '{command}': {error}"))
    })?;

    let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
    let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

    // arm bodies stay trivial so the child is free to borrow again below
    let waited = tokio::select! {
        result = async {
            match timeout_ms {
                Some(limit) => {
                    tokio::time::timeout(Duration::from_millis(limit), child.wait()).await
                }
                None => Ok(child.wait().await),
            }
        } => Some(result),
        _ = env.cancel.cancelled() => None,
    };

    let mut timed_out = false;
    let mut cancelled = false;
    let status = match waited {
        Some(Ok(wait_result)) => Some(wait_result.map_err(|error| {
            AttractorError::Runtime(format!("failed to wait for command '{command}': {error}"))
        })?),
        Some(Err(_)) => {
            timed_out = true;
            kill_child(&mut child).await;
            None
        }
        None => {
            cancelled = true;
            kill_child(&mut child).await;
            None
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let (exit_code, signal) = match status {
        Some(status) => (status.code(), unix_signal(&status)),
        None => (None, None),
    };

    Ok(ShellExecution {
        stdout,
        stderr,
        exit_code,
        signal,
        timed_out,
        cancelled,
    })
}

async fn kill_child(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn read_pipe<R>(pipe: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buffer = Vec::new();
    let _ = pipe.read_to_end(&mut buffer).await;
    String::from_utf8_lossy(&buffer).to_string()
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

fn classify(execution: &ShellExecution) -> Option<FailureClass> {
    if execution.cancelled {
        return Some(FailureClass::Cancelled);
    }
    if execution.timed_out {
        return Some(FailureClass::Timeout);
    }
    match execution.exit_code {
        Some(0) => None,
        Some(_) => Some(FailureClass::ExitNonzero),
        None => Some(FailureClass::Killed),
    }
}

fn failure_digest(execution: &ShellExecution, class: FailureClass) -> String {
    if class == FailureClass::Timeout {
        return "command timed out".to_string();
    }
    execution
        .stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .or_else(|| {
            execution
                .stdout
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
        })
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| match execution.exit_code {
            Some(code) => format!("command exited with status {code}"),
            None => "command was killed".to_string(),
        })
}

/// Best-effort scan for the first failing test/check in the combined output.
fn first_failing_check(execution: &ShellExecution) -> Option<String> {
    let patterns = ["FAILED", "FAIL:", "error[", "assertion", "panicked at"];
    execution
        .stdout
        .lines()
        .chain(execution.stderr.lines())
        .find(|line| patterns.iter().any(|pattern| line.contains(pattern)))
        .map(|line| line.trim().to_string())
}

fn write_attempt_artifacts(
    node: &Node,
    env: &StageEnv,
    command: &str,
    execution: &ShellExecution,
    duration_ms: u64,
) -> Result<Vec<String>, AttractorError> {
    let Some(logs_root) = env.logs_root.as_ref() else {
        return Ok(Vec::new());
    };
    let dir = attempt_dir(logs_root, &node.id, env.attempt);
    write_text_file(&dir.join("stdout.log"), &execution.stdout)?;
    write_text_file(&dir.join("stderr.log"), &execution.stderr)?;
    write_json_file(
        &dir.join("meta.json"),
        &json!({
            "command": command,
            "exit_code": execution.exit_code,
            "signal": execution.signal,
            "duration_ms": duration_ms,
            "timed_out": execution.timed_out,
        }),
    )?;
    Ok(vec![
        dir.join("stdout.log").to_string_lossy().to_string(),
        dir.join("stderr.log").to_string_lossy().to_string(),
        dir.join("meta.json").to_string_lossy().to_string(),
    ])
}

fn tail_lines(text: &str, count: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    lines
        .iter()
        .skip(lines.len().saturating_sub(count))
        .map(ToString::to_string)
        .collect()
}

fn truncate_chars(input: &str, max_len: usize) -> String {
    input.chars().take(max_len).collect()
}
