use crate::handlers::codergen::CodergenBackend;
use crate::{
    AutoApproveInterviewer, CancellationToken, Interviewer, JjRunner, NodeOutcome,
    PipelineFailureSummary, RetryBackoffConfig, RunUsageSummary, RuntimeContext, RuntimeEventSink,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStatus {
    Success,
    Fail,
    Cancelled,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Everything a run needs injected: the backend for codergen stages, the
/// interviewer for human gates, the jj runner for workspace stages, the
/// event sink, and the cancellation token.
#[derive(Clone)]
pub struct RunConfig {
    pub run_id: Option<String>,
    pub events: RuntimeEventSink,
    pub backend: Option<Arc<dyn CodergenBackend>>,
    pub interviewer: Arc<dyn Interviewer>,
    pub jj: Option<Arc<dyn JjRunner>>,
    pub retry_backoff: RetryBackoffConfig,
    pub logs_root: Option<PathBuf>,
    pub resume_from_checkpoint: Option<PathBuf>,
    pub cancel: CancellationToken,
    pub max_loop_restarts: u32,
    /// Remove the jj workspace when the run FAILS. Never applies to
    /// cancellation; users expect to resume and keep their work.
    pub emergency_cleanup: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            events: RuntimeEventSink::default(),
            backend: None,
            interviewer: Arc::new(AutoApproveInterviewer),
            jj: None,
            retry_backoff: RetryBackoffConfig::default(),
            logs_root: None,
            resume_from_checkpoint: None,
            cancel: CancellationToken::new(),
            max_loop_restarts: 16,
            emergency_cleanup: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineRunResult {
    pub run_id: String,
    pub status: PipelineStatus,
    pub failure_reason: Option<String>,
    pub failure_summary: Option<PipelineFailureSummary>,
    pub completed_nodes: Vec<String>,
    pub node_outcomes: BTreeMap<String, NodeOutcome>,
    pub context: RuntimeContext,
    pub logs: Vec<String>,
    pub usage: RunUsageSummary,
}
