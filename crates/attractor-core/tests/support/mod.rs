#![allow(dead_code)]

use async_trait::async_trait;
use attractor_core::handlers::StageEnv;
use attractor_core::handlers::codergen::CodergenBackend;
use attractor_core::{
    AttractorError, Graph, Node, NodeOutcome, RunConfig, RuntimeContext, RuntimeEvent,
    RuntimeEventSink, SharedRuntimeEventObserver, parse_dot,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub fn parse(source: &str) -> Graph {
    parse_dot(source).expect("graph should parse")
}

/// Codergen backend that replays scripted outcomes per node id and records
/// every invocation. Nodes without a script succeed.
#[derive(Default)]
pub struct ScriptedBackend {
    outcomes: Mutex<HashMap<String, VecDeque<NodeOutcome>>>,
    invocations: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, node_id: &str, outcomes: Vec<NodeOutcome>) -> Self {
        self.outcomes
            .lock()
            .expect("outcomes mutex should lock")
            .insert(node_id.to_string(), outcomes.into());
        self
    }

    pub fn invocations(&self) -> Vec<String> {
        self.invocations
            .lock()
            .expect("invocations mutex should lock")
            .clone()
    }

    pub fn invocation_count(&self, node_id: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|id| id.as_str() == node_id)
            .count()
    }
}

#[async_trait]
impl CodergenBackend for ScriptedBackend {
    async fn run(
        &self,
        node: &Node,
        _prompt: &str,
        _context: &RuntimeContext,
        _env: &StageEnv,
    ) -> Result<NodeOutcome, AttractorError> {
        self.invocations
            .lock()
            .expect("invocations mutex should lock")
            .push(node.id.clone());
        let outcome = self
            .outcomes
            .lock()
            .expect("outcomes mutex should lock")
            .get_mut(&node.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(NodeOutcome::success);
        Ok(outcome)
    }
}

/// Recording event observer plus a config pre-wired to it.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<RuntimeEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> RuntimeEventSink {
        let events = Arc::clone(&self.events);
        let observer: SharedRuntimeEventObserver = Arc::new(move |event: &RuntimeEvent| {
            events.lock().expect("events mutex should lock").push(event.clone());
        });
        RuntimeEventSink::with_observer(observer)
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events.lock().expect("events mutex should lock").clone()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|event| {
                serde_json::to_value(event)
                    .expect("event should serialize")
                    .get("kind")
                    .and_then(serde_json::Value::as_str)
                    .expect("event should carry a kind")
                    .to_string()
            })
            .collect()
    }

    /// (kind, name) pairs for stage-scoped events of a single node.
    pub fn stage_kinds(&self, node_id: &str) -> Vec<String> {
        self.events()
            .iter()
            .filter(|event| event.event.stage_name() == Some(node_id))
            .map(|event| {
                serde_json::to_value(event)
                    .expect("event should serialize")
                    .get("kind")
                    .and_then(serde_json::Value::as_str)
                    .expect("event should carry a kind")
                    .to_string()
            })
            .collect()
    }
}

pub fn config_with_backend(backend: Arc<ScriptedBackend>) -> RunConfig {
    RunConfig {
        backend: Some(backend),
        ..RunConfig::default()
    }
}

pub fn usage_outcome(status_success: bool, key_base: &str, input_tokens: u64) -> NodeOutcome {
    let mut outcome = if status_success {
        NodeOutcome::success()
    } else {
        NodeOutcome::failure("scripted failure")
    };
    let mut updates = BTreeMap::new();
    updates.insert(
        format!("{key_base}.usage.input_tokens"),
        serde_json::json!(input_tokens),
    );
    updates.insert(
        format!("{key_base}.usage.total_tokens"),
        serde_json::json!(input_tokens),
    );
    outcome.context_updates = updates;
    outcome
}
