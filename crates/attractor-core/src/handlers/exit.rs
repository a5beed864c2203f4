use crate::handlers::{NodeHandler, StageEnv};
use crate::{AttractorError, Graph, Node, NodeOutcome, RuntimeContext, stage_dir, write_text_file};
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &RuntimeContext,
        _graph: &Graph,
        env: &StageEnv,
    ) -> Result<NodeOutcome, AttractorError> {
        if let Some(logs_root) = env.logs_root.as_ref() {
            write_text_file(&stage_dir(logs_root, &node.id).join("completed.marker"), "")?;
        }
        Ok(NodeOutcome::success().with_note(format!("Pipeline reached exit {}", node.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeStatus, parse_dot};

    #[tokio::test(flavor = "current_thread")]
    async fn exit_handler_without_logs_root_expected_success() {
        let graph = parse_dot("digraph G { done [shape=Msquare] }").expect("graph should parse");
        let node = graph.nodes.get("done").expect("node should exist");

        let outcome = ExitHandler
            .execute(node, &RuntimeContext::new(), &graph, &StageEnv::for_tests())
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Success);
    }
}
