use crate::backends::session::{
    AgentEvent, AgentRole, AgentSession, MUTATING_TOOLS, SessionOverrides, TOOL_RESULT_SKIPPED_MARKER,
    ToolMode,
};
use crate::handlers::StageEnv;
use crate::handlers::codergen::CodergenBackend;
use crate::{
    AttractorError, FailureClass, ModelRegistry, Node, NodeOutcome, PipelineEvent, RuntimeContext,
    parse_status_markers, resolve_model, response_key_base, usage_updates,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEFAULT_COMPLETION_LATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct BackendOptions {
    pub tool_mode: ToolMode,
    pub completion_latch_timeout: Duration,
    pub models: ModelRegistry,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            tool_mode: ToolMode::Coding,
            completion_latch_timeout: DEFAULT_COMPLETION_LATCH_TIMEOUT,
            models: ModelRegistry::new(),
        }
    }
}

/// Backend that drives an [`AgentSession`] through the single-turn protocol:
/// await idle, dispatch the prompt as a follow-up, await idle again, then
/// hold a bounded completion latch for the session's end event. Structural
/// failures (empty response, missing status marker, skipped tool results)
/// get exactly one automatic retry per stage attempt; the retry is refused
/// when a mutating tool already ran.
pub struct AgentSessionBackend {
    session: Mutex<Box<dyn AgentSession>>,
    options: BackendOptions,
    disposed: AtomicBool,
}

impl AgentSessionBackend {
    pub fn new(session: Box<dyn AgentSession>) -> Self {
        Self::with_options(session, BackendOptions::default())
    }

    pub fn with_options(session: Box<dyn AgentSession>, options: BackendOptions) -> Self {
        Self {
            session: Mutex::new(session),
            options,
            disposed: AtomicBool::new(false),
        }
    }

    async fn dispose_once(&self, session: &mut dyn AgentSession) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            session.dispose().await;
        }
    }

    async fn drive_protocol(
        &self,
        session: &mut dyn AgentSession,
        node: &Node,
        prompt: &str,
        env: &StageEnv,
    ) -> NodeOutcome {
        let key_base = response_key_base(node);
        let honored = honors_status_markers(node);
        let mut protocol_retries: u32 = 1;
        let mut logs: Vec<String> = Vec::new();

        loop {
            // reset the per-attempt event subscription before dispatch so a
            // previous attempt's events cannot leak into this one
            let mut receiver = session.subscribe();

            if let Err(error) = session.wait_idle().await {
                return llm_failure(error, &key_base, prompt, logs);
            }
            if env.cancel.is_cancelled() {
                self.dispose_once(session).await;
                return NodeOutcome::cancelled();
            }
            if let Err(error) = session.send_followup(prompt.to_string()).await {
                return llm_failure(error, &key_base, prompt, logs);
            }
            if env.cancel.is_cancelled() {
                self.dispose_once(session).await;
                return NodeOutcome::cancelled();
            }
            if let Err(error) = session.wait_idle().await {
                return llm_failure(error, &key_base, prompt, logs);
            }

            let mut texts: Vec<String> = Vec::new();
            let mut saw_end = false;
            while let Ok(event) = receiver.try_recv() {
                saw_end |= forward_event(&event, &mut texts, node, env);
            }

            if !saw_end {
                let latch = async {
                    while let Some(event) = receiver.recv().await {
                        if forward_event(&event, &mut texts, node, env) {
                            return true;
                        }
                    }
                    false
                };
                let latched = tokio::select! {
                    _ = env.cancel.cancelled() => None,
                    result = tokio::time::timeout(self.options.completion_latch_timeout, latch) => {
                        Some(result.unwrap_or(false))
                    }
                };
                match latched {
                    None => {
                        self.dispose_once(session).await;
                        return NodeOutcome::cancelled();
                    }
                    Some(value) => saw_end = value,
                }
            }
            if !saw_end {
                // latch timed out; the response does not count
                texts.clear();
            }

            let response_text = texts.join("\n\n");
            let trace = session.message_trace();
            let results_skipped = trace
                .iter()
                .any(|message| message.text.contains(TOOL_RESULT_SKIPPED_MARKER));
            let mutating_tool_ran = trace.iter().any(|message| {
                message.role == AgentRole::Assistant
                    && message
                        .tool_name
                        .as_deref()
                        .is_some_and(|tool| MUTATING_TOOLS.contains(&tool))
            });
            let markers = parse_status_markers(&response_text);

            let protocol_failure = if results_skipped {
                Some(FailureClass::ToolResultSkipped)
            } else if response_text.trim().is_empty() {
                Some(FailureClass::EmptyResponse)
            } else if honored && markers.status.is_none() {
                Some(FailureClass::MissingStatusMarker)
            } else {
                None
            };

            if let Some(class) = protocol_failure {
                if mutating_tool_ran {
                    // replaying would double-apply whatever bash/edit/write
                    // already did
                    logs.push(format!(
                        "protocol failure {} with mutating tool side effects; retry refused",
                        class.as_str()
                    ));
                    let mut outcome = NodeOutcome::failure_with_class(
                        format!(
                            "{}; mutating tool side effects may have landed, refusing automatic retry",
                            describe_protocol_failure(class)
                        ),
                        FailureClass::ToolResultSkipped,
                    );
                    attach_response(&mut outcome, &key_base, prompt, &response_text, session);
                    outcome.logs = logs;
                    return outcome;
                }
                if protocol_retries > 0 {
                    protocol_retries -= 1;
                    logs.push(format!("protocol retry triggered by {}", class.as_str()));
                    tracing::debug!(node = %node.id, class = class.as_str(), "protocol retry");
                    continue;
                }
                let mut outcome =
                    NodeOutcome::failure_with_class(describe_protocol_failure(class), class);
                attach_response(&mut outcome, &key_base, prompt, &response_text, session);
                outcome.logs = logs;
                return outcome;
            }

            let mut outcome = if honored {
                let status = markers.status.expect("protocol failure checked above");
                let mut outcome = NodeOutcome::with_status(status);
                if status == crate::NodeStatus::Fail {
                    outcome.failure_reason = markers
                        .failure_reason
                        .or_else(|| Some("stage reported failure".to_string()));
                }
                outcome.preferred_label = markers.preferred_label;
                outcome.suggested_next_ids = markers.next_ids;
                outcome
            } else {
                NodeOutcome::success()
            };
            if outcome.status.is_success_like() {
                outcome.notes = Some(format!("Stage completed: {}", node.id));
            }
            attach_response(&mut outcome, &key_base, prompt, &response_text, session);
            outcome.logs = logs;
            return outcome;
        }
    }
}

#[async_trait]
impl CodergenBackend for AgentSessionBackend {
    async fn run(
        &self,
        node: &Node,
        prompt: &str,
        _context: &RuntimeContext,
        env: &StageEnv,
    ) -> Result<NodeOutcome, AttractorError> {
        if env.cancel.is_cancelled() {
            return Ok(NodeOutcome::cancelled());
        }

        let mut session = self.session.lock().await;
        let saved = session.overrides();
        let overrides = match build_overrides(node, &self.options) {
            Ok(overrides) => overrides,
            Err(reason) => {
                return Ok(NodeOutcome::failure_with_class(reason, FailureClass::LlmError));
            }
        };
        session.apply_overrides(&overrides);

        let outcome = self.drive_protocol(session.as_mut(), node, prompt, env).await;

        // restore the saved session state on every path
        session.apply_overrides(&saved);
        Ok(outcome)
    }
}

/// Whether `[STATUS: ...]` markers decide the stage outcome. Box-shaped
/// codergen nodes are pure implementation stages and ignore markers unless
/// the node opts in; every other shape honors them.
pub fn honors_status_markers(node: &Node) -> bool {
    if let Some(explicit) = node.attrs.get_bool("auto_status") {
        return explicit;
    }
    node.attrs.get_str("shape").unwrap_or("box") != "box"
}

fn build_overrides(node: &Node, options: &BackendOptions) -> Result<SessionOverrides, String> {
    let mut overrides = SessionOverrides {
        tool_mode: Some(options.tool_mode),
        ..SessionOverrides::default()
    };

    if let Some(model_name) = node.attrs.get_str("llm_model").map(str::trim) {
        if !model_name.is_empty() {
            let model = resolve_model(&options.models, model_name).ok_or_else(|| {
                format!("model '{model_name}' not found in registry or builtin catalog")
            })?;
            overrides.provider = Some(model.provider);
            overrides.model = Some(model.id);
        }
    }
    if let Some(provider) = node.attrs.get_str("llm_provider").map(str::trim) {
        if !provider.is_empty() {
            overrides.provider = Some(provider.to_string());
        }
    }
    if let Some(effort) = node.attrs.get_str("reasoning_effort").map(str::trim) {
        if !effort.is_empty() {
            overrides.reasoning_effort = Some(effort.to_ascii_lowercase());
        }
    }

    Ok(overrides)
}

/// Returns true when the event is the terminal end event.
fn forward_event(event: &AgentEvent, texts: &mut Vec<String>, node: &Node, env: &StageEnv) -> bool {
    match event {
        AgentEvent::BeforeStart => false,
        AgentEvent::Text { text } => {
            texts.push(text.clone());
            env.events.emit(PipelineEvent::AgentText {
                run_id: env.run_id.clone(),
                name: node.id.clone(),
                text: text.clone(),
            });
            false
        }
        AgentEvent::ToolStart { tool } => {
            env.events.emit(PipelineEvent::AgentToolStart {
                run_id: env.run_id.clone(),
                name: node.id.clone(),
                tool: tool.clone(),
            });
            false
        }
        AgentEvent::ToolEnd { tool } => {
            env.events.emit(PipelineEvent::AgentToolEnd {
                run_id: env.run_id.clone(),
                name: node.id.clone(),
                tool: tool.clone(),
            });
            false
        }
        AgentEvent::End => true,
    }
}

fn describe_protocol_failure(class: FailureClass) -> String {
    match class {
        FailureClass::EmptyResponse => "agent returned an empty response".to_string(),
        FailureClass::MissingStatusMarker => {
            "agent response did not include a status marker".to_string()
        }
        FailureClass::ToolResultSkipped => {
            "agent tool results were skipped by a queued message".to_string()
        }
        other => other.as_str().to_string(),
    }
}

fn attach_response(
    outcome: &mut NodeOutcome,
    key_base: &str,
    prompt: &str,
    response_text: &str,
    session: &dyn AgentSession,
) {
    outcome.context_updates.insert(
        format!("{key_base}._full_response"),
        Value::String(response_text.to_string()),
    );
    outcome.context_updates.insert(
        format!("{key_base}._prompt"),
        Value::String(prompt.to_string()),
    );
    if let Some(usage) = session.last_usage() {
        outcome.context_updates.extend(usage_updates(key_base, &usage));
    }
}

fn llm_failure(
    error: AttractorError,
    key_base: &str,
    prompt: &str,
    logs: Vec<String>,
) -> NodeOutcome {
    let mut outcome = NodeOutcome::failure_with_class(error.to_string(), FailureClass::LlmError);
    outcome.context_updates.insert(
        format!("{key_base}._prompt"),
        Value::String(prompt.to_string()),
    );
    outcome.logs = logs;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::session::{AgentMessage, ScriptedSession, ScriptedTurn};
    use crate::{NodeStatus, UsageMetrics, parse_dot};

    fn auto_status_node() -> (crate::Graph, String) {
        let graph = parse_dot("digraph G { review [shape=box, auto_status=true] }")
            .expect("graph should parse");
        (graph, "review".to_string())
    }

    async fn run_backend(
        backend: &AgentSessionBackend,
        graph: &crate::Graph,
        node_id: &str,
    ) -> NodeOutcome {
        let node = graph.nodes.get(node_id).expect("node should exist");
        backend
            .run(node, "do the thing", &RuntimeContext::new(), &StageEnv::for_tests())
            .await
            .expect("backend run should succeed")
    }

    #[tokio::test(flavor = "current_thread")]
    async fn marker_status_decides_outcome_when_honored() {
        let (graph, node_id) = auto_status_node();
        let session = ScriptedSession::new([ScriptedTurn::text(
            "done\n[STATUS: partial_success]\n[PREFERRED_LABEL: Retry later]",
        )]);
        let backend = AgentSessionBackend::new(Box::new(session));

        let outcome = run_backend(&backend, &graph, &node_id).await;
        assert_eq!(outcome.status, NodeStatus::PartialSuccess);
        assert_eq!(outcome.preferred_label.as_deref(), Some("Retry later"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn box_shape_ignores_markers_by_default() {
        let graph = parse_dot("digraph G { work [shape=box] }").expect("graph should parse");
        let session = ScriptedSession::new([ScriptedTurn::text("no markers at all")]);
        let backend = AgentSessionBackend::new(Box::new(session));

        let outcome = run_backend(&backend, &graph, "work").await;
        assert_eq!(outcome.status, NodeStatus::Success);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_response_retries_once_then_succeeds() {
        let (graph, node_id) = auto_status_node();
        let session = ScriptedSession::new([
            ScriptedTurn::empty(),
            ScriptedTurn::text("[STATUS: success]"),
        ]);
        let handle = session.handle();
        let backend = AgentSessionBackend::new(Box::new(session));

        let outcome = run_backend(&backend, &graph, &node_id).await;
        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(handle.submit_count(), 2);
        assert!(outcome.logs.iter().any(|log| log.contains("empty_response")));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_response_twice_expected_fail_with_class() {
        let (graph, node_id) = auto_status_node();
        let session = ScriptedSession::new([ScriptedTurn::empty(), ScriptedTurn::empty()]);
        let handle = session.handle();
        let backend = AgentSessionBackend::new(Box::new(session));

        let outcome = run_backend(&backend, &graph, &node_id).await;
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert_eq!(outcome.failure_class, Some(FailureClass::EmptyResponse));
        assert_eq!(handle.submit_count(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn mutating_tool_with_skip_marker_expected_no_retry() {
        let (graph, node_id) = auto_status_node();
        let turn = ScriptedTurn::text("partial work").with_trace(vec![
            AgentMessage::assistant_tool("bash"),
            AgentMessage::user(format!("note: {TOOL_RESULT_SKIPPED_MARKER}")),
        ]);
        let session = ScriptedSession::new([turn]);
        let handle = session.handle();
        let backend = AgentSessionBackend::new(Box::new(session));

        let outcome = run_backend(&backend, &graph, &node_id).await;
        assert_eq!(handle.submit_count(), 1);
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert_eq!(outcome.failure_class, Some(FailureClass::ToolResultSkipped));
        assert!(
            outcome
                .failure_reason
                .as_deref()
                .unwrap_or_default()
                .contains("mutating tool side effects")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn skip_marker_without_mutating_tools_expected_retry() {
        let (graph, node_id) = auto_status_node();
        let first = ScriptedTurn::text("hm").with_trace(vec![AgentMessage::user(format!(
            "note: {TOOL_RESULT_SKIPPED_MARKER}"
        ))]);
        let session = ScriptedSession::new([first, ScriptedTurn::text("[STATUS: success]")]);
        let handle = session.handle();
        let backend = AgentSessionBackend::new(Box::new(session));

        let outcome = run_backend(&backend, &graph, &node_id).await;
        assert_eq!(handle.submit_count(), 2);
        assert_eq!(outcome.status, NodeStatus::Success);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn semantic_fail_marker_expected_no_retry() {
        let (graph, node_id) = auto_status_node();
        let session = ScriptedSession::new([ScriptedTurn::text(
            "[STATUS: fail]\n[FAILURE_REASON: tests are red]",
        )]);
        let handle = session.handle();
        let backend = AgentSessionBackend::new(Box::new(session));

        let outcome = run_backend(&backend, &graph, &node_id).await;
        assert_eq!(handle.submit_count(), 1);
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert_eq!(outcome.failure_reason.as_deref(), Some("tests are red"));
        assert_eq!(outcome.failure_class, None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn completion_latch_timeout_expected_empty_response() {
        let (graph, node_id) = auto_status_node();
        let session = ScriptedSession::new([
            ScriptedTurn::without_end("text that never completes"),
            ScriptedTurn::without_end("again"),
        ]);
        let options = BackendOptions {
            completion_latch_timeout: Duration::from_millis(20),
            ..BackendOptions::default()
        };
        let backend = AgentSessionBackend::with_options(Box::new(session), options);

        let outcome = run_backend(&backend, &graph, &node_id).await;
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert_eq!(outcome.failure_class, Some(FailureClass::EmptyResponse));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn usage_lands_under_response_key_base() {
        let graph = parse_dot("digraph G { work [shape=box, response_key_base=\"impl\"] }")
            .expect("graph should parse");
        let usage = UsageMetrics {
            input_tokens: 100,
            output_tokens: 40,
            total_tokens: 140,
            cost: 0.01,
            ..UsageMetrics::default()
        };
        let session = ScriptedSession::new([ScriptedTurn::text("done").with_usage(usage)]);
        let backend = AgentSessionBackend::new(Box::new(session));

        let outcome = run_backend(&backend, &graph, "work").await;
        assert_eq!(
            outcome.context_updates.get("impl.usage.total_tokens"),
            Some(&serde_json::json!(140))
        );
        assert!(outcome.context_updates.contains_key("impl._full_response"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn model_override_resolved_and_restored() {
        let graph = parse_dot(
            "digraph G { work [shape=box, llm_model=\"sonnet\", reasoning_effort=\"High\"] }",
        )
        .expect("graph should parse");
        let session = ScriptedSession::new([ScriptedTurn::text("done")]);
        let handle = session.handle();
        let backend = AgentSessionBackend::new(Box::new(session));

        let outcome = run_backend(&backend, &graph, "work").await;
        assert_eq!(outcome.status, NodeStatus::Success);

        let log = handle.overrides_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(log[0].provider.as_deref(), Some("anthropic"));
        assert_eq!(log[0].reasoning_effort.as_deref(), Some("high"));
        // restore pass puts the original (default) state back
        assert_eq!(log[1], SessionOverrides::default());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_model_expected_llm_error_and_restore_skipped_apply() {
        let graph = parse_dot("digraph G { work [shape=box, llm_model=\"made-up\"] }")
            .expect("graph should parse");
        let session = ScriptedSession::new([ScriptedTurn::text("done")]);
        let handle = session.handle();
        let backend = AgentSessionBackend::new(Box::new(session));

        let outcome = run_backend(&backend, &graph, "work").await;
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert_eq!(outcome.failure_class, Some(FailureClass::LlmError));
        assert!(
            outcome
                .failure_reason
                .as_deref()
                .unwrap_or_default()
                .contains("made-up")
        );
        assert_eq!(handle.submit_count(), 0);
        assert!(handle.overrides_log().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancellation_before_dispatch_expected_cancelled_outcome() {
        let (graph, node_id) = auto_status_node();
        let session = ScriptedSession::new([ScriptedTurn::text("[STATUS: success]")]);
        let handle = session.handle();
        let backend = AgentSessionBackend::new(Box::new(session));

        let node = graph.nodes.get(&node_id).expect("node should exist");
        let env = StageEnv::for_tests();
        env.cancel.cancel();
        let outcome = backend
            .run(node, "prompt", &RuntimeContext::new(), &env)
            .await
            .expect("backend run should succeed");

        assert_eq!(outcome.status, NodeStatus::Cancelled);
        assert_eq!(handle.submit_count(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancellation_during_latch_disposes_session_once() {
        let (graph, node_id) = auto_status_node();
        let session = ScriptedSession::new([ScriptedTurn::without_end("never ends")]);
        let handle = session.handle();
        let options = BackendOptions {
            completion_latch_timeout: Duration::from_secs(30),
            ..BackendOptions::default()
        };
        let backend = AgentSessionBackend::with_options(Box::new(session), options);

        let node = graph.nodes.get(&node_id).expect("node should exist");
        let env = StageEnv::for_tests();
        let trip = env.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trip.cancel();
        });

        let outcome = backend
            .run(node, "prompt", &RuntimeContext::new(), &env)
            .await
            .expect("backend run should succeed");
        assert_eq!(outcome.status, NodeStatus::Cancelled);
        assert_eq!(handle.disposal_count(), 1);
    }
}
