mod support;

use attractor_core::{
    AgentMessage, AgentSessionBackend, FailureClass, PipelineRunner, PipelineStatus, RunConfig,
    ScriptedSession, ScriptedTurn, TOOL_RESULT_SKIPPED_MARKER,
};
use std::sync::Arc;
use support::parse;

fn auto_status_graph() -> attractor_core::Graph {
    parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            work [shape=box, auto_status=true, prompt="w"]
            exit [shape=Msquare]
            start -> work -> exit
        }
        "#,
    )
}

#[tokio::test(flavor = "current_thread")]
async fn empty_response_then_success_expected_one_protocol_retry() {
    let graph = auto_status_graph();
    let session = ScriptedSession::new([
        ScriptedTurn::empty(),
        ScriptedTurn::text("fixed\n[STATUS: success]"),
    ]);
    let handle = session.handle();
    let config = RunConfig {
        backend: Some(Arc::new(AgentSessionBackend::new(Box::new(session)))),
        ..RunConfig::default()
    };

    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    // two dispatches for a single stage attempt
    assert_eq!(handle.submit_count(), 2);
    assert!(
        result
            .logs
            .iter()
            .any(|line| line.contains("empty_response")),
        "context log should mention the protocol retry: {:?}",
        result.logs
    );
}

#[tokio::test(flavor = "current_thread")]
async fn mutating_tool_skip_expected_refused_retry() {
    let graph = auto_status_graph();
    let turn = ScriptedTurn::text("half-applied change").with_trace(vec![
        AgentMessage::assistant_tool("bash"),
        AgentMessage::user(format!("system: {TOOL_RESULT_SKIPPED_MARKER}")),
    ]);
    let session = ScriptedSession::new([turn, ScriptedTurn::text("[STATUS: success]")]);
    let handle = session.handle();
    let config = RunConfig {
        backend: Some(Arc::new(AgentSessionBackend::new(Box::new(session)))),
        ..RunConfig::default()
    };

    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should return");

    // exactly one invocation: replaying after side effects is refused
    assert_eq!(handle.submit_count(), 1);
    assert_eq!(result.status, PipelineStatus::Fail);
    let outcome = result.node_outcomes.get("work").expect("work outcome recorded");
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
async fn missing_status_marker_retries_then_fails() {
    let graph = auto_status_graph();
    let session = ScriptedSession::new([
        ScriptedTurn::text("did things, forgot the marker"),
        ScriptedTurn::text("still no marker"),
    ]);
    let handle = session.handle();
    let config = RunConfig {
        backend: Some(Arc::new(AgentSessionBackend::new(Box::new(session)))),
        ..RunConfig::default()
    };

    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should return");

    assert_eq!(handle.submit_count(), 2);
    assert_eq!(result.status, PipelineStatus::Fail);
    let outcome = result.node_outcomes.get("work").expect("work outcome recorded");
    assert_eq!(outcome.failure_class, Some(FailureClass::MissingStatusMarker));
}

#[tokio::test(flavor = "current_thread")]
async fn protocol_retry_budget_fresh_per_stage_attempt() {
    // two stage attempts via max_retries=1; each attempt gets its own
    // protocol retry, so four dispatches in total
    let graph = parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            work [shape=box, auto_status=true, prompt="w", max_retries=1]
            exit [shape=Msquare]
            start -> work -> exit
        }
        "#,
    );
    let session = ScriptedSession::new([
        ScriptedTurn::empty(),
        ScriptedTurn::empty(),
        ScriptedTurn::empty(),
        ScriptedTurn::text("[STATUS: success]"),
    ]);
    let handle = session.handle();
    let config = RunConfig {
        backend: Some(Arc::new(AgentSessionBackend::new(Box::new(session)))),
        retry_backoff: attractor_core::RetryBackoffConfig {
            initial_delay_ms: 1,
            backoff_factor: 1.0,
            max_delay_ms: 2,
            jitter: false,
        },
        ..RunConfig::default()
    };

    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(handle.submit_count(), 4);
}

#[tokio::test(flavor = "current_thread")]
async fn marker_routing_hints_flow_into_edge_selection() {
    let graph = parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            triage [shape=box, auto_status=true, prompt="t"]
            easy [prompt="e"]
            hard [prompt="h"]
            exit [shape=Msquare]
            start -> triage
            triage -> easy [label="Easy"]
            triage -> hard [label="Hard"]
            easy -> exit
            hard -> exit
        }
        "#,
    );
    let session = ScriptedSession::new([
        ScriptedTurn::text("triaged\n[STATUS: success]\n[PREFERRED_LABEL: Hard]"),
        ScriptedTurn::text("hard path done"),
    ]);
    let config = RunConfig {
        backend: Some(Arc::new(AgentSessionBackend::new(Box::new(session)))),
        ..RunConfig::default()
    };

    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert!(result.completed_nodes.contains(&"hard".to_string()));
    assert!(!result.completed_nodes.contains(&"easy".to_string()));
}
