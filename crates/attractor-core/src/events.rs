use crate::UsageMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub sequence_no: u64,
    /// ISO-8601 UTC.
    pub timestamp: String,
    #[serde(flatten)]
    pub event: PipelineEvent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStarted {
        run_id: String,
        name: String,
        node_count: usize,
        stage_count: usize,
    },
    PipelineResumed {
        run_id: String,
        name: String,
        resume_node: String,
    },
    StageStarted {
        run_id: String,
        name: String,
        attempt: u32,
    },
    AgentText {
        run_id: String,
        name: String,
        text: String,
    },
    AgentToolStart {
        run_id: String,
        name: String,
        tool: String,
    },
    AgentToolEnd {
        run_id: String,
        name: String,
        tool: String,
    },
    StageCompleted {
        run_id: String,
        name: String,
        attempt: u32,
        status: String,
        notes: Option<String>,
    },
    StageFailed {
        run_id: String,
        name: String,
        attempt: u32,
        status: String,
        failure_reason: Option<String>,
        failure_class: Option<String>,
        will_retry: bool,
    },
    StageRetrying {
        run_id: String,
        name: String,
        attempt: u32,
        next_attempt: u32,
        delay_ms: u64,
    },
    CheckpointSaved {
        run_id: String,
        name: String,
        path: String,
    },
    UsageUpdate {
        run_id: String,
        name: String,
        attempt: u32,
        metrics: UsageMetrics,
        totals: UsageMetrics,
    },
    PipelineCompleted {
        run_id: String,
    },
    PipelineFailed {
        run_id: String,
        reason: String,
    },
    PipelineCancelled {
        run_id: String,
        at_node: String,
    },
}

impl PipelineEvent {
    /// Node the event belongs to, when it is a stage-scoped event.
    pub fn stage_name(&self) -> Option<&str> {
        match self {
            Self::StageStarted { name, .. }
            | Self::AgentText { name, .. }
            | Self::AgentToolStart { name, .. }
            | Self::AgentToolEnd { name, .. }
            | Self::StageCompleted { name, .. }
            | Self::StageFailed { name, .. }
            | Self::StageRetrying { name, .. }
            | Self::CheckpointSaved { name, .. }
            | Self::UsageUpdate { name, .. } => Some(name),
            _ => None,
        }
    }
}

pub trait RuntimeEventObserver: Send + Sync {
    fn on_event(&self, event: &RuntimeEvent);
}

impl<F> RuntimeEventObserver for F
where
    F: Fn(&RuntimeEvent) + Send + Sync,
{
    fn on_event(&self, event: &RuntimeEvent) {
        self(event);
    }
}

pub type SharedRuntimeEventObserver = Arc<dyn RuntimeEventObserver>;
pub type RuntimeEventSender = mpsc::UnboundedSender<RuntimeEvent>;
pub type RuntimeEventReceiver = mpsc::UnboundedReceiver<RuntimeEvent>;

/// Fan-out sink shared by the runner and the backend. Stamps a run-wide
/// sequence number and an ISO-8601 timestamp on every event; the channel is
/// unbounded so the (sequential) engine never blocks on a slow renderer.
#[derive(Clone, Default)]
pub struct RuntimeEventSink {
    observer: Option<SharedRuntimeEventObserver>,
    sender: Option<RuntimeEventSender>,
    sequence: Arc<AtomicU64>,
}

impl RuntimeEventSink {
    pub fn with_observer(observer: SharedRuntimeEventObserver) -> Self {
        Self {
            observer: Some(observer),
            ..Self::default()
        }
    }

    pub fn with_sender(sender: RuntimeEventSender) -> Self {
        Self {
            sender: Some(sender),
            ..Self::default()
        }
    }

    pub fn observer(mut self, observer: SharedRuntimeEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: RuntimeEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, event: PipelineEvent) {
        if !self.is_enabled() {
            return;
        }
        let event = RuntimeEvent {
            sequence_no: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: chrono::Utc::now().to_rfc3339(),
            event,
        };
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn runtime_event_channel() -> (RuntimeEventSender, RuntimeEventReceiver) {
    mpsc::unbounded_channel()
}
