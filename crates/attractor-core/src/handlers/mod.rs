use crate::{
    AttractorError, CancellationToken, Graph, Node, NodeOutcome, RuntimeContext, RuntimeEventSink,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

pub mod codergen;
pub mod conditional;
pub mod exit;
pub mod registry;
pub mod start;
pub mod tool;
pub mod wait_human;
pub mod workspace;

/// Per-invocation environment the runner hands to every handler: where the
/// stage logs live, the run's cancellation token, and the event sink.
#[derive(Clone)]
pub struct StageEnv {
    pub run_id: String,
    pub attempt: u32,
    pub logs_root: Option<PathBuf>,
    pub cancel: CancellationToken,
    pub events: RuntimeEventSink,
}

impl StageEnv {
    pub fn for_tests() -> Self {
        Self {
            run_id: "test-run".to_string(),
            attempt: 1,
            logs_root: None,
            cancel: CancellationToken::new(),
            events: RuntimeEventSink::default(),
        }
    }
}

#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        graph: &Graph,
        env: &StageEnv,
    ) -> Result<NodeOutcome, AttractorError>;
}

pub type SharedNodeHandler = Arc<dyn NodeHandler>;

/// Discriminator that selects a stage's handler. An explicit `type` attr
/// wins over the node shape; type values the engine does not know become
/// custom kinds, which the registry serves from its fallback handler.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeKind {
    Start,
    Exit,
    Codergen,
    Tool,
    Human,
    Conditional,
    WorkspaceCreate,
    WorkspaceMerge,
    WorkspaceCleanup,
    Custom(String),
}

impl NodeKind {
    pub fn of(node: &Node) -> Self {
        match node.attrs.get_str("type").map(str::trim) {
            Some(raw) if !raw.is_empty() => Self::from_type_attr(raw),
            _ => Self::from_shape(node.attrs.get_str("shape").unwrap_or("box")),
        }
    }

    fn from_type_attr(raw: &str) -> Self {
        match raw {
            "start" => Self::Start,
            "exit" => Self::Exit,
            "codergen" | "llm" => Self::Codergen,
            "tool" => Self::Tool,
            "human" | "wait.human" => Self::Human,
            "conditional" | "gate" => Self::Conditional,
            "workspace_create" | "workspace.create" => Self::WorkspaceCreate,
            "workspace_merge" | "workspace.merge" => Self::WorkspaceMerge,
            "workspace_cleanup" | "workspace.cleanup" => Self::WorkspaceCleanup,
            other => Self::Custom(other.to_string()),
        }
    }

    fn from_shape(shape: &str) -> Self {
        match shape {
            "Mdiamond" => Self::Start,
            "Msquare" => Self::Exit,
            "parallelogram" => Self::Tool,
            "hexagon" => Self::Human,
            "diamond" => Self::Conditional,
            _ => Self::Codergen,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::Exit => "exit",
            Self::Codergen => "codergen",
            Self::Tool => "tool",
            Self::Human => "human",
            Self::Conditional => "conditional",
            Self::WorkspaceCreate => "workspace_create",
            Self::WorkspaceMerge => "workspace_merge",
            Self::WorkspaceCleanup => "workspace_cleanup",
            Self::Custom(name) => name,
        }
    }

    /// Start and exit markers bracket the run; everything else does work.
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Start | Self::Exit)
    }
}
