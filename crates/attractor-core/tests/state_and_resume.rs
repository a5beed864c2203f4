mod support;

use attractor_core::{
    CheckpointState, ContextStore, NodeOutcome, PipelineRunner, PipelineStatus, RunConfig,
    checkpoint_file_path,
};
use serde_json::json;
use std::sync::Arc;
use support::{EventLog, ScriptedBackend, config_with_backend, parse};

fn three_stage_graph() -> attractor_core::Graph {
    parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            a [prompt="a"]
            b [prompt="b"]
            exit [shape=Msquare]
            start -> a -> b -> exit
        }
        "#,
    )
}

#[tokio::test(flavor = "current_thread")]
async fn checkpoint_written_after_every_stage() {
    let graph = three_stage_graph();
    let temp = tempfile::tempdir().expect("temp dir should create");
    let config = RunConfig {
        logs_root: Some(temp.path().to_path_buf()),
        ..config_with_backend(Arc::new(ScriptedBackend::new()))
    };

    PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should succeed");

    let checkpoint = CheckpointState::load_from_path(&checkpoint_file_path(temp.path()))
        .expect("checkpoint should load");
    assert_eq!(checkpoint.completed_nodes, vec!["start", "a", "b", "exit"]);
    assert_eq!(checkpoint.terminal_status.as_deref(), Some("success"));
    assert_eq!(checkpoint.resume_at, None);
}

#[tokio::test(flavor = "current_thread")]
async fn resume_final_checkpoint_expected_noop_success() {
    let graph = three_stage_graph();
    let temp = tempfile::tempdir().expect("temp dir should create");
    let first_backend = Arc::new(ScriptedBackend::new());
    let config = RunConfig {
        logs_root: Some(temp.path().to_path_buf()),
        ..config_with_backend(first_backend)
    };
    let first = PipelineRunner
        .run(&graph, config)
        .await
        .expect("first run should succeed");

    // resuming a completed run executes nothing
    let second_backend = Arc::new(ScriptedBackend::new());
    let resume_config = RunConfig {
        resume_from_checkpoint: Some(checkpoint_file_path(temp.path())),
        ..config_with_backend(second_backend.clone())
    };
    let second = PipelineRunner
        .run(&graph, resume_config)
        .await
        .expect("resume should succeed");

    assert_eq!(second.status, PipelineStatus::Success);
    assert_eq!(second.completed_nodes, first.completed_nodes);
    assert!(second_backend.invocations().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn cancel_then_resume_expected_interrupted_stage_re_executed_once() {
    use async_trait::async_trait;
    use attractor_core::handlers::StageEnv;
    use attractor_core::handlers::codergen::CodergenBackend;
    use attractor_core::{AttractorError, CancellationToken, Node, RuntimeContext};

    // stage b parks on the cancellation token; a is already done when the
    // token trips
    struct BlockOnB {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl CodergenBackend for BlockOnB {
        async fn run(
            &self,
            node: &Node,
            _prompt: &str,
            _context: &RuntimeContext,
            _env: &StageEnv,
        ) -> Result<NodeOutcome, AttractorError> {
            if node.id == "b" {
                self.cancel.cancelled().await;
                return Ok(NodeOutcome::cancelled());
            }
            Ok(NodeOutcome::success())
        }
    }

    let graph = three_stage_graph();
    let temp = tempfile::tempdir().expect("temp dir should create");
    let cancel = CancellationToken::new();
    let config = RunConfig {
        logs_root: Some(temp.path().to_path_buf()),
        cancel: cancel.clone(),
        backend: Some(Arc::new(BlockOnB {
            cancel: cancel.clone(),
        })),
        ..RunConfig::default()
    };

    let trip = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        trip.cancel();
    });
    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should return");

    assert_eq!(result.status, PipelineStatus::Cancelled);
    let checkpoint = CheckpointState::load_from_path(&checkpoint_file_path(temp.path()))
        .expect("checkpoint should load");
    assert!(checkpoint.terminal_status.is_none());

    // resume re-executes the interrupted stage exactly once, then advances
    let resume_backend = Arc::new(ScriptedBackend::new());
    let resume_config = RunConfig {
        resume_from_checkpoint: Some(checkpoint_file_path(temp.path())),
        logs_root: Some(temp.path().to_path_buf()),
        ..config_with_backend(resume_backend.clone())
    };
    let resumed = PipelineRunner
        .run(&graph, resume_config)
        .await
        .expect("resume should succeed");

    assert_eq!(resumed.status, PipelineStatus::Success);
    assert_eq!(resume_backend.invocation_count("b"), 1);
    assert_eq!(resumed.completed_nodes.last().map(String::as_str), Some("exit"));
}

#[tokio::test(flavor = "current_thread")]
async fn resume_restores_context_and_retry_counters() {
    let graph = three_stage_graph();
    let temp = tempfile::tempdir().expect("temp dir should create");
    let path = checkpoint_file_path(temp.path());

    // hand-build a mid-run checkpoint: a completed, resume at b
    let mut a_outcome = NodeOutcome::success();
    a_outcome
        .context_updates
        .insert("a.result".to_string(), json!("kept"));
    let checkpoint = CheckpointState {
        timestamp: "2026-01-01T00:00:00Z".to_string(),
        run_id: "pipeline-run".to_string(),
        current_node: "a".to_string(),
        resume_at: Some("b".to_string()),
        completed_nodes: vec!["start".to_string(), "a".to_string()],
        node_retries: std::collections::BTreeMap::from([("a".to_string(), 2)]),
        node_outcomes: std::collections::BTreeMap::from([(
            "a".to_string(),
            attractor_core::CheckpointNodeOutcome::from_runtime(&a_outcome),
        )]),
        context_values: std::collections::BTreeMap::from([
            ("a.result".to_string(), json!("kept")),
            ("outcome".to_string(), json!("success")),
        ]),
        logs: vec!["stage a done".to_string()],
        terminal_status: None,
        terminal_failure_reason: None,
    };
    checkpoint.save_to_path(&path).expect("checkpoint should save");

    let backend = Arc::new(ScriptedBackend::new());
    let events = EventLog::new();
    let resume_config = RunConfig {
        resume_from_checkpoint: Some(path),
        events: events.sink(),
        ..config_with_backend(backend.clone())
    };
    let result = PipelineRunner
        .run(&graph, resume_config)
        .await
        .expect("resume should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    // a is not re-executed; the restored prefix stays
    assert!(backend.invocations().iter().all(|id| id != "a"));
    assert_eq!(result.completed_nodes, vec!["start", "a", "b", "exit"]);
    assert_eq!(result.context.get("a.result"), Some(&json!("kept")));
    assert!(result.logs.contains(&"stage a done".to_string()));
    assert!(events.kinds().iter().any(|kind| kind == "pipeline_resumed"));
    assert!(!events.kinds().iter().any(|kind| kind == "pipeline_started"));
}

#[test]
fn context_snapshot_apply_round_trip_expected_equivalent() {
    let original = ContextStore::new();
    original.set("graph.goal", json!("ship")).expect("set should succeed");
    original
        .set("review.findings", json!([{"message": "m"}]))
        .expect("set should succeed");
    original.set("tries", json!(3)).expect("set should succeed");

    let snapshot = original.snapshot().expect("snapshot should succeed");
    let fresh = ContextStore::new();
    fresh
        .apply_updates(&snapshot.values)
        .expect("apply should succeed");

    assert_eq!(
        fresh.snapshot().expect("snapshot should succeed").values,
        snapshot.values
    );
}
