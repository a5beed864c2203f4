use crate::handlers::{NodeHandler, StageEnv};
use crate::{AttractorError, Graph, Node, NodeOutcome, RuntimeContext, stage_dir, write_text_file};
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &RuntimeContext,
        _graph: &Graph,
        env: &StageEnv,
    ) -> Result<NodeOutcome, AttractorError> {
        if let Some(logs_root) = env.logs_root.as_ref() {
            write_text_file(&stage_dir(logs_root, &node.id).join("started.marker"), "")?;
        }
        Ok(NodeOutcome::success().with_note(format!("Pipeline started at {}", node.id)))
    }
}
