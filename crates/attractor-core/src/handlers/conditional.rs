use crate::handlers::{NodeHandler, StageEnv};
use crate::{AttractorError, Graph, Node, NodeOutcome, RuntimeContext};
use async_trait::async_trait;

/// Routing gates do no work of their own. The runner routes their outgoing
/// edges against the upstream outcome recorded in the context, so the
/// handler only acknowledges the visit.
#[derive(Debug, Default)]
pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &RuntimeContext,
        _graph: &Graph,
        _env: &StageEnv,
    ) -> Result<NodeOutcome, AttractorError> {
        Ok(NodeOutcome::success().with_note(format!("Conditional node evaluated: {}", node.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeStatus, parse_dot};

    #[tokio::test(flavor = "current_thread")]
    async fn conditional_handler_execute_expected_success() {
        let graph = parse_dot("digraph G { gate [shape=diamond] }").expect("graph should parse");
        let node = graph.nodes.get("gate").expect("gate node should exist");
        let outcome = ConditionalHandler
            .execute(node, &RuntimeContext::new(), &graph, &StageEnv::for_tests())
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Success);
        assert!(outcome.notes.as_deref().unwrap_or_default().contains("gate"));
    }
}
