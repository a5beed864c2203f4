use crate::handlers::registry::HandlerRegistry;
use crate::handlers::wait_human::approval_target;
use crate::handlers::{
    NodeKind, SharedNodeHandler, StageEnv, codergen, conditional, exit, start, tool, wait_human,
    workspace,
};
use crate::{
    AttemptDisposition, AttractorError, CheckpointNodeOutcome, CheckpointState, ContextStore,
    FailureClass, Graph, JjRunner, Node, NodeOutcome, NodeStatus, PipelineEvent,
    PipelineRunResult, PipelineStatus, RetryPolicy, RunConfig, RunUsageSummary, RuntimeContext,
    RuntimeEventSink, StageAttemptUsage, build_resume_state, checkpoint_path_for_run,
    derive_failure_summary, ensure_logs_root, extract_attempt_metrics, jj, recover_workspace,
    response_key_base, select_failure_edge, select_next_edge, sleep_cancellable,
    stage_jitter_seed, write_stage_artifacts,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Default)]
pub struct PipelineRunner;

impl PipelineRunner {
    pub async fn run(
        &self,
        graph: &Graph,
        mut config: RunConfig,
    ) -> Result<PipelineRunResult, AttractorError> {
        crate::validate_or_raise(graph, &[])?;

        let run_id = config
            .run_id
            .take()
            .unwrap_or_else(|| format!("{}-run", graph.id));
        let logs_root = match config.logs_root.as_ref() {
            Some(path) => Some(ensure_logs_root(path)?),
            None => None,
        };
        let checkpoint_path = checkpoint_path_for_run(logs_root.as_deref(), None)
            .or_else(|| config.resume_from_checkpoint.clone());

        let registry = build_registry(&config);
        let events = config.events.clone();
        let cancel = config.cancel.clone();

        let mut context = ContextStore::new();
        seed_graph_context(&context, graph)?;

        let mut completed_nodes: Vec<String> = Vec::new();
        let mut node_outcomes: BTreeMap<String, NodeOutcome> = BTreeMap::new();
        let mut node_retries: BTreeMap<String, u32> = BTreeMap::new();
        let mut goal_outcomes: BTreeMap<String, NodeStatus> = BTreeMap::new();
        // gate id -> approval target; a populated entry redirects control
        // back to the gate after the revision stage completes
        let mut pending_reviews: BTreeMap<String, Option<String>> = BTreeMap::new();
        let mut usage = RunUsageSummary::default();
        let mut restarts = 0u32;

        let mut current_node_id = resolve_start_node(graph)?.id.clone();

        if let Some(resume_path) = config.resume_from_checkpoint.clone() {
            let resume = build_resume_state(graph, &resume_path)?;
            if let Some(status) = resume.terminal_status {
                // resuming a finished run is a no-op
                return Ok(PipelineRunResult {
                    run_id,
                    status,
                    failure_reason: resume.terminal_failure_reason,
                    failure_summary: None,
                    completed_nodes: resume.completed_nodes,
                    node_outcomes: resume.node_outcomes,
                    context: resume.context,
                    logs: resume.logs,
                    usage,
                });
            }

            context = ContextStore::from_values(resume.context.clone());
            seed_graph_context(&context, graph)?;
            for line in &resume.logs {
                context.append_log(line.clone())?;
            }
            completed_nodes = resume.completed_nodes;
            node_retries = resume.node_retries;
            node_outcomes = resume.node_outcomes;
            for (node_id, outcome) in &node_outcomes {
                if graph
                    .node(node_id)
                    .is_some_and(|node| node.attrs.get_bool("goal_gate") == Some(true))
                {
                    goal_outcomes.insert(node_id.clone(), outcome.status);
                }
            }
            if let Some(runner) = config.jj.as_ref() {
                recover_workspace(runner.as_ref(), &context).await?;
            }
            current_node_id = resume
                .resume_node
                .expect("non-terminal resume always carries a target");
            events.emit(PipelineEvent::PipelineResumed {
                run_id: run_id.clone(),
                name: graph.id.clone(),
                resume_node: current_node_id.clone(),
            });
        } else {
            events.emit(PipelineEvent::PipelineStarted {
                run_id: run_id.clone(),
                name: graph.id.clone(),
                node_count: graph.nodes.len(),
                stage_count: stage_count(graph),
            });
        }

        loop {
            if cancel.is_cancelled() {
                return finish_cancelled(FinishArgs {
                    run_id: &run_id,
                    at_node: &current_node_id,
                    checkpoint_path: checkpoint_path.as_deref(),
                    events: &events,
                    context: &context,
                    completed_nodes: &completed_nodes,
                    node_retries: &node_retries,
                    node_outcomes: &node_outcomes,
                    usage,
                });
            }

            let node = graph.nodes.get(&current_node_id).ok_or_else(|| {
                AttractorError::InvalidGraph(format!(
                    "runtime traversal reached unknown node '{current_node_id}'"
                ))
            })?;
            let kind = NodeKind::of(node);

            if kind == NodeKind::Exit {
                let outcome = execute_single(
                    &registry, node, graph, &context, &run_id, &logs_root, &cancel, &events,
                )
                .await?;
                completed_nodes.push(node.id.clone());
                node_outcomes.insert(node.id.clone(), outcome.clone());
                events.emit(PipelineEvent::StageCompleted {
                    run_id: run_id.clone(),
                    name: node.id.clone(),
                    attempt: 1,
                    status: outcome.status.as_str().to_string(),
                    notes: outcome.notes.clone(),
                });

                if let Some(gate_id) = first_unmet_goal_gate(&goal_outcomes) {
                    if let Some(target) = resolve_retry_target(graph, &gate_id) {
                        tracing::info!(gate = %gate_id, target = %target, "goal gate unmet; following retry target");
                        save_checkpoint(
                            checkpoint_path.as_deref(),
                            &events,
                            &run_id,
                            &node.id,
                            Some(target.clone()),
                            &completed_nodes,
                            &node_retries,
                            &node_outcomes,
                            &context,
                            None,
                            None,
                        )?;
                        current_node_id = target;
                        continue;
                    }

                    let reason = format!(
                        "goal gate '{gate_id}' did not reach success and no retry target is configured"
                    );
                    let gate_outcome = node_outcomes.get(&gate_id).cloned().unwrap_or_else(|| {
                        NodeOutcome::failure_with_class(reason.clone(), FailureClass::GoalGateUnmet)
                    });
                    let mut summary =
                        derive_failure_summary(&gate_id, &gate_outcome, logs_root.as_deref());
                    summary.failure_class = Some(FailureClass::GoalGateUnmet);
                    save_checkpoint(
                        checkpoint_path.as_deref(),
                        &events,
                        &run_id,
                        &node.id,
                        None,
                        &completed_nodes,
                        &node_retries,
                        &node_outcomes,
                        &context,
                        Some("fail"),
                        Some(reason.clone()),
                    )?;
                    if config.emergency_cleanup {
                        if let Some(runner) = config.jj.as_ref() {
                            emergency_workspace_cleanup(runner.as_ref(), &context).await;
                        }
                    }
                    events.emit(PipelineEvent::PipelineFailed {
                        run_id: run_id.clone(),
                        reason: reason.clone(),
                    });
                    let snapshot = context.snapshot()?;
                    return Ok(PipelineRunResult {
                        run_id,
                        status: PipelineStatus::Fail,
                        failure_reason: Some(reason),
                        failure_summary: Some(summary),
                        completed_nodes,
                        node_outcomes,
                        context: snapshot.values,
                        logs: snapshot.logs,
                        usage,
                    });
                }

                save_checkpoint(
                    checkpoint_path.as_deref(),
                    &events,
                    &run_id,
                    &node.id,
                    None,
                    &completed_nodes,
                    &node_retries,
                    &node_outcomes,
                    &context,
                    Some("success"),
                    None,
                )?;
                events.emit(PipelineEvent::PipelineCompleted {
                    run_id: run_id.clone(),
                });
                let snapshot = context.snapshot()?;
                return Ok(PipelineRunResult {
                    run_id,
                    status: PipelineStatus::Success,
                    failure_reason: None,
                    failure_summary: None,
                    completed_nodes,
                    node_outcomes,
                    context: snapshot.values,
                    logs: snapshot.logs,
                    usage,
                });
            }

            // ---- regular stage: attempt loop ----
            let policy = RetryPolicy::for_node(
                node,
                graph,
                config.retry_backoff.clone(),
                stage_jitter_seed(&run_id, &node.id),
            );
            let key_base = response_key_base(node);
            let mut final_outcome: Option<NodeOutcome> = None;
            let mut attempts_used = 0u32;

            events.emit(PipelineEvent::StageStarted {
                run_id: run_id.clone(),
                name: node.id.clone(),
                attempt: 1,
            });

            for attempt in 1..=policy.max_attempts() {
                attempts_used = attempt;
                let env = StageEnv {
                    run_id: run_id.clone(),
                    attempt,
                    logs_root: logs_root.clone(),
                    cancel: cancel.clone(),
                    events: events.clone(),
                };
                let snapshot = context.snapshot()?;
                let handler = registry.resolve(node).ok_or_else(|| {
                    AttractorError::Runtime(format!(
                        "no handler registered for kind '{}'",
                        kind.as_str()
                    ))
                })?;
                let started = Instant::now();
                let outcome = match handler.execute(node, &snapshot.values, graph, &env).await {
                    Ok(outcome) => outcome,
                    Err(_) if cancel.is_cancelled() => NodeOutcome::cancelled(),
                    Err(error) => {
                        NodeOutcome::failure_with_class(error.to_string(), FailureClass::StageError)
                    }
                };
                let duration_ms = started.elapsed().as_millis() as u64;

                // updates land before the cancellation check so usage from a
                // cancelled attempt is still captured
                context.apply_updates(&outcome.context_updates)?;
                for line in &outcome.logs {
                    context.append_log(line.clone())?;
                }
                let metrics = extract_attempt_metrics(&outcome.context_updates, &key_base);
                if !metrics.is_zero() {
                    usage.push(StageAttemptUsage {
                        stage_id: node.id.clone(),
                        attempt,
                        metrics,
                    });
                    events.emit(PipelineEvent::UsageUpdate {
                        run_id: run_id.clone(),
                        name: node.id.clone(),
                        attempt,
                        metrics,
                        totals: usage.totals,
                    });
                }
                write_stage_artifacts(logs_root.as_deref(), node, &key_base, &outcome, duration_ms)?;

                if outcome.status == NodeStatus::Cancelled || cancel.is_cancelled() {
                    return finish_cancelled(FinishArgs {
                        run_id: &run_id,
                        at_node: &node.id,
                        checkpoint_path: checkpoint_path.as_deref(),
                        events: &events,
                        context: &context,
                        completed_nodes: &completed_nodes,
                        node_retries: &node_retries,
                        node_outcomes: &node_outcomes,
                        usage,
                    });
                }

                match policy.disposition(&outcome, attempt) {
                    AttemptDisposition::RetryAfter(delay) => {
                        *node_retries.entry(node.id.clone()).or_insert(0) += 1;
                        let delay_ms = delay.as_millis() as u64;
                        events.emit(PipelineEvent::StageRetrying {
                            run_id: run_id.clone(),
                            name: node.id.clone(),
                            attempt,
                            next_attempt: attempt + 1,
                            delay_ms,
                        });
                        tracing::info!(node = %node.id, attempt, delay_ms, "stage retrying");
                        if !sleep_cancellable(delay, &cancel).await {
                            return finish_cancelled(FinishArgs {
                                run_id: &run_id,
                                at_node: &node.id,
                                checkpoint_path: checkpoint_path.as_deref(),
                                events: &events,
                                context: &context,
                                completed_nodes: &completed_nodes,
                                node_retries: &node_retries,
                                node_outcomes: &node_outcomes,
                                usage,
                            });
                        }
                    }
                    AttemptDisposition::Exhausted(replacement) => {
                        final_outcome = Some(replacement);
                        break;
                    }
                    AttemptDisposition::Settled => {
                        if outcome.status.is_success_like() {
                            node_retries.insert(node.id.clone(), 0);
                        }
                        final_outcome = Some(outcome);
                        break;
                    }
                }
            }

            let outcome = final_outcome.expect("attempt loop always produces an outcome");

            completed_nodes.push(node.id.clone());
            node_outcomes.insert(node.id.clone(), outcome.clone());
            if node.attrs.get_bool("goal_gate") == Some(true) {
                goal_outcomes.insert(node.id.clone(), outcome.status);
            }

            let is_conditional = kind == NodeKind::Conditional;
            if !is_conditional {
                context.set("outcome", Value::String(outcome.status.as_str().to_string()))?;
                if let Some(label) = &outcome.preferred_label {
                    context.set("preferred_label", Value::String(label.clone()))?;
                }
                context.set("last_stage", Value::String(node.id.clone()))?;
            }

            if is_conditional || outcome.status.is_success_like() {
                events.emit(PipelineEvent::StageCompleted {
                    run_id: run_id.clone(),
                    name: node.id.clone(),
                    attempt: attempts_used,
                    status: outcome.status.as_str().to_string(),
                    notes: outcome.notes.clone(),
                });
            } else {
                events.emit(PipelineEvent::StageFailed {
                    run_id: run_id.clone(),
                    name: node.id.clone(),
                    attempt: attempts_used,
                    status: outcome.status.as_str().to_string(),
                    failure_reason: outcome.failure_reason.clone(),
                    failure_class: outcome.failure_class.map(|class| class.as_str().to_string()),
                    will_retry: false,
                });
            }

            if let Some(runner) = config.jj.as_ref() {
                capture_workspace_tip(runner.as_ref(), &context).await;
            }

            // ---- routing ----
            let snapshot = context.snapshot()?;
            let routing_outcome = if is_conditional {
                upstream_routing_outcome(&snapshot.values, &outcome)
            } else {
                outcome.clone()
            };
            let selected = if routing_outcome.status == NodeStatus::Fail {
                select_failure_edge(graph, &node.id, &routing_outcome, &snapshot.values)
            } else {
                select_next_edge(graph, &node.id, &routing_outcome, &snapshot.values)
            };
            let mut next: Option<(String, bool)> = selected.map(|edge| {
                (
                    edge.to.clone(),
                    edge.attrs.get_bool("loop_restart") == Some(true),
                )
            });
            if next.is_none() && routing_outcome.status == NodeStatus::Fail {
                if let Some(target) = node_failure_target(graph, node) {
                    tracing::info!(node = %node.id, target = %target, "failure with no edge; following retry target");
                    next = Some((target, false));
                }
            }

            // ---- human-gate re-review ----
            if kind == NodeKind::Human {
                if node.attrs.get_bool("re_review").unwrap_or(true) {
                    let approval = approval_target(node, graph);
                    match next.as_ref() {
                        Some((target, _)) if approval.as_deref() != Some(target.as_str()) => {
                            pending_reviews.insert(node.id.clone(), approval);
                        }
                        _ => {
                            pending_reviews.remove(&node.id);
                        }
                    }
                }
            } else if !is_conditional && routing_outcome.status.is_success_like() {
                // the revision stage just finished; a populated pending
                // entry pulls control back to its gate
                if let Some((target, _)) = next.clone() {
                    let gate_id = pending_reviews.iter().find_map(|(gate, approval)| {
                        (gate != &target && approval.as_deref() != Some(target.as_str()))
                            .then(|| gate.clone())
                    });
                    if let Some(gate_id) = gate_id {
                        tracing::debug!(gate = %gate_id, "revision complete; re-entering human gate");
                        pending_reviews.remove(&gate_id);
                        next = Some((gate_id, false));
                    }
                }
            }

            save_checkpoint(
                checkpoint_path.as_deref(),
                &events,
                &run_id,
                &node.id,
                next.as_ref().map(|(target, _)| target.clone()),
                &completed_nodes,
                &node_retries,
                &node_outcomes,
                &context,
                None,
                None,
            )?;

            match next {
                Some((target, true)) => {
                    restarts += 1;
                    if restarts > config.max_loop_restarts {
                        return Err(AttractorError::Runtime(format!(
                            "loop_restart exceeded max_loop_restarts={}",
                            config.max_loop_restarts
                        )));
                    }
                    completed_nodes.clear();
                    node_outcomes.clear();
                    node_retries.clear();
                    goal_outcomes.clear();
                    pending_reviews.clear();
                    events.emit(PipelineEvent::PipelineStarted {
                        run_id: run_id.clone(),
                        name: graph.id.clone(),
                        node_count: graph.nodes.len(),
                        stage_count: stage_count(graph),
                    });
                    current_node_id = target;
                }
                Some((target, false)) => {
                    current_node_id = target;
                }
                None => {
                    let reason = outcome
                        .failure_reason
                        .clone()
                        .or_else(|| outcome.notes.clone())
                        .unwrap_or_else(|| {
                            format!("stage '{}' ended with no outgoing edge", node.id)
                        });
                    let summary = derive_failure_summary(&node.id, &outcome, logs_root.as_deref());
                    save_checkpoint(
                        checkpoint_path.as_deref(),
                        &events,
                        &run_id,
                        &node.id,
                        None,
                        &completed_nodes,
                        &node_retries,
                        &node_outcomes,
                        &context,
                        Some("fail"),
                        Some(reason.clone()),
                    )?;
                    if config.emergency_cleanup {
                        if let Some(runner) = config.jj.as_ref() {
                            emergency_workspace_cleanup(runner.as_ref(), &context).await;
                        }
                    }
                    events.emit(PipelineEvent::PipelineFailed {
                        run_id: run_id.clone(),
                        reason: reason.clone(),
                    });
                    let snapshot = context.snapshot()?;
                    return Ok(PipelineRunResult {
                        run_id,
                        status: PipelineStatus::Fail,
                        failure_reason: Some(reason),
                        failure_summary: Some(summary),
                        completed_nodes,
                        node_outcomes,
                        context: snapshot.values,
                        logs: snapshot.logs,
                        usage,
                    });
                }
            }
        }
    }
}

pub fn build_registry(config: &RunConfig) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(NodeKind::Start, Arc::new(start::StartHandler));
    registry.register(NodeKind::Exit, Arc::new(exit::ExitHandler));
    registry.register(NodeKind::Conditional, Arc::new(conditional::ConditionalHandler));
    registry.register(NodeKind::Tool, Arc::new(tool::ToolHandler));
    registry.register(
        NodeKind::Human,
        Arc::new(wait_human::WaitHumanHandler::new(config.interviewer.clone())),
    );
    if let Some(runner) = config.jj.as_ref() {
        registry.register(
            NodeKind::WorkspaceCreate,
            Arc::new(workspace::WorkspaceCreateHandler::new(runner.clone())),
        );
        registry.register(
            NodeKind::WorkspaceMerge,
            Arc::new(workspace::WorkspaceMergeHandler::new(runner.clone())),
        );
        registry.register(
            NodeKind::WorkspaceCleanup,
            Arc::new(workspace::WorkspaceCleanupHandler::new(runner.clone())),
        );
    }

    // codergen doubles as the fallback so custom kinds degrade to an LLM
    // stage instead of failing resolution
    let codergen: SharedNodeHandler =
        Arc::new(codergen::CodergenHandler::new(config.backend.clone()));
    registry.register(NodeKind::Codergen, codergen.clone());
    registry.set_fallback(codergen);
    registry
}

fn resolve_start_node(graph: &Graph) -> Result<&Node, AttractorError> {
    graph
        .start_candidates()
        .into_iter()
        .next()
        .ok_or_else(|| AttractorError::InvalidGraph("graph does not have a start node".to_string()))
}

fn stage_count(graph: &Graph) -> usize {
    graph
        .nodes
        .values()
        .filter(|node| !NodeKind::of(node).is_marker())
        .count()
}

fn seed_graph_context(context: &ContextStore, graph: &Graph) -> Result<(), AttractorError> {
    for (key, value) in graph.attrs.values() {
        context.set(
            format!("graph.{key}"),
            Value::String(value.to_string_value()),
        )?;
    }
    if context.get("graph.label")?.is_none() {
        context.set("graph.label", Value::String(graph.id.clone()))?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn execute_single(
    registry: &HandlerRegistry,
    node: &Node,
    graph: &Graph,
    context: &ContextStore,
    run_id: &str,
    logs_root: &Option<PathBuf>,
    cancel: &crate::CancellationToken,
    events: &RuntimeEventSink,
) -> Result<NodeOutcome, AttractorError> {
    events.emit(PipelineEvent::StageStarted {
        run_id: run_id.to_string(),
        name: node.id.clone(),
        attempt: 1,
    });
    let env = StageEnv {
        run_id: run_id.to_string(),
        attempt: 1,
        logs_root: logs_root.clone(),
        cancel: cancel.clone(),
        events: events.clone(),
    };
    let snapshot = context.snapshot()?;
    let handler = registry.resolve(node).ok_or_else(|| {
        AttractorError::Runtime(format!("no handler registered for node '{}'", node.id))
    })?;
    let started = Instant::now();
    let outcome = match handler.execute(node, &snapshot.values, graph, &env).await {
        Ok(outcome) => outcome,
        Err(error) => NodeOutcome::failure_with_class(error.to_string(), FailureClass::StageError),
    };
    context.apply_updates(&outcome.context_updates)?;
    for line in &outcome.logs {
        context.append_log(line.clone())?;
    }
    write_stage_artifacts(
        logs_root.as_deref(),
        node,
        &response_key_base(node),
        &outcome,
        started.elapsed().as_millis() as u64,
    )?;
    Ok(outcome)
}

fn first_unmet_goal_gate(goal_outcomes: &BTreeMap<String, NodeStatus>) -> Option<String> {
    goal_outcomes
        .iter()
        .find(|(_, status)| !status.is_success_like())
        .map(|(node_id, _)| node_id.clone())
}

fn resolve_retry_target(graph: &Graph, node_id: &str) -> Option<String> {
    if let Some(node) = graph.node(node_id) {
        if let Some(target) = node_failure_target(graph, node) {
            return Some(target);
        }
    }
    for key in ["retry_target", "fallback_retry_target"] {
        let target = graph.attrs.get_str(key).unwrap_or_default();
        if !target.is_empty() && graph.nodes.contains_key(target) {
            return Some(target.to_string());
        }
    }
    None
}

fn node_failure_target(graph: &Graph, node: &Node) -> Option<String> {
    for key in ["retry_target", "fallback_retry_target"] {
        let target = node.attrs.get_str(key).unwrap_or_default();
        if !target.is_empty() && graph.nodes.contains_key(target) {
            return Some(target.to_string());
        }
    }
    None
}

/// Conditional nodes route on the upstream outcome, not their own success.
fn upstream_routing_outcome(context: &RuntimeContext, own: &NodeOutcome) -> NodeOutcome {
    let status = context
        .get("outcome")
        .and_then(Value::as_str)
        .and_then(|raw| NodeStatus::try_from(raw).ok())
        .unwrap_or(NodeStatus::Success);
    let mut outcome = NodeOutcome::with_status(status);
    outcome.preferred_label = own.preferred_label.clone().or_else(|| {
        context
            .get("preferred_label")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    });
    outcome.suggested_next_ids = own.suggested_next_ids.clone();
    outcome
}

async fn capture_workspace_tip(runner: &dyn JjRunner, context: &ContextStore) {
    let Ok(Some(Value::String(path))) = context.get("workspace.path") else {
        return;
    };
    let cleaned_up = context
        .get("workspace.cleaned_up")
        .ok()
        .flatten()
        .and_then(|value| value.as_bool())
        .unwrap_or(false);
    if cleaned_up || !Path::new(&path).is_dir() {
        return;
    }
    if let Ok(tip) = jj::tip_commit(runner, Path::new(&path)).await {
        let _ = context.set("workspace.tip_commit", Value::String(tip));
    }
}

async fn emergency_workspace_cleanup(runner: &dyn JjRunner, context: &ContextStore) {
    let Some(info) = context
        .snapshot()
        .ok()
        .and_then(|snapshot| workspace::workspace_from_context(&snapshot.values))
    else {
        return;
    };
    if info.cleaned_up {
        return;
    }
    tracing::warn!(workspace = %info.name, "emergency workspace cleanup after failure");
    let _ = jj::workspace_forget(runner, Path::new(&info.repo_root), &info.name).await;
    let _ = std::fs::remove_dir_all(&info.path);
    let _ = context.set("workspace.cleaned_up", Value::Bool(true));
}

#[allow(clippy::too_many_arguments)]
fn save_checkpoint(
    checkpoint_path: Option<&Path>,
    events: &RuntimeEventSink,
    run_id: &str,
    current_node: &str,
    resume_at: Option<String>,
    completed_nodes: &[String],
    node_retries: &BTreeMap<String, u32>,
    node_outcomes: &BTreeMap<String, NodeOutcome>,
    context: &ContextStore,
    terminal_status: Option<&str>,
    terminal_failure_reason: Option<String>,
) -> Result<(), AttractorError> {
    let Some(path) = checkpoint_path else {
        return Ok(());
    };
    let snapshot = context.snapshot()?;
    let checkpoint = CheckpointState {
        timestamp: chrono::Utc::now().to_rfc3339(),
        run_id: run_id.to_string(),
        current_node: current_node.to_string(),
        resume_at,
        completed_nodes: completed_nodes.to_vec(),
        node_retries: node_retries.clone(),
        node_outcomes: node_outcomes
            .iter()
            .map(|(node_id, outcome)| {
                (node_id.clone(), CheckpointNodeOutcome::from_runtime(outcome))
            })
            .collect(),
        context_values: snapshot.values,
        logs: snapshot.logs,
        terminal_status: terminal_status.map(ToOwned::to_owned),
        terminal_failure_reason,
    };
    checkpoint.save_to_path(path)?;
    events.emit(PipelineEvent::CheckpointSaved {
        run_id: run_id.to_string(),
        name: current_node.to_string(),
        path: path.to_string_lossy().to_string(),
    });
    Ok(())
}

struct FinishArgs<'a> {
    run_id: &'a str,
    at_node: &'a str,
    checkpoint_path: Option<&'a Path>,
    events: &'a RuntimeEventSink,
    context: &'a ContextStore,
    completed_nodes: &'a [String],
    node_retries: &'a BTreeMap<String, u32>,
    node_outcomes: &'a BTreeMap<String, NodeOutcome>,
    usage: RunUsageSummary,
}

/// Cancellation path: persist a checkpoint that re-executes the interrupted
/// node on resume, announce, and return the cancelled result. The workspace
/// is left alone so the run can pick up where it stopped.
fn finish_cancelled(args: FinishArgs<'_>) -> Result<PipelineRunResult, AttractorError> {
    save_checkpoint(
        args.checkpoint_path,
        args.events,
        args.run_id,
        args.at_node,
        Some(args.at_node.to_string()),
        args.completed_nodes,
        args.node_retries,
        args.node_outcomes,
        args.context,
        None,
        None,
    )?;
    args.events.emit(PipelineEvent::PipelineCancelled {
        run_id: args.run_id.to_string(),
        at_node: args.at_node.to_string(),
    });
    let snapshot = args.context.snapshot()?;
    Ok(PipelineRunResult {
        run_id: args.run_id.to_string(),
        status: PipelineStatus::Cancelled,
        failure_reason: None,
        failure_summary: None,
        completed_nodes: args.completed_nodes.to_vec(),
        node_outcomes: args.node_outcomes.clone(),
        context: snapshot.values,
        logs: snapshot.logs,
        usage: args.usage,
    })
}
