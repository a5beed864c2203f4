use crate::handlers::{NodeHandler, StageEnv};
use crate::{
    AttractorError, Graph, Node, NodeOutcome, RuntimeContext, expand_context_refs,
    render_context_summary, response_key_base,
};
use async_trait::async_trait;
use serde_json::Value;
use std::fs;
use std::sync::Arc;

/// Single-operation contract the engine holds against an LLM coding agent.
/// Implementations must honor the cancellation token carried by the stage
/// environment, apply the protocol-retry rules, and report the full response
/// and usage through `context_updates` under the node's response key base.
#[async_trait]
pub trait CodergenBackend: Send + Sync {
    async fn run(
        &self,
        node: &Node,
        prompt: &str,
        context: &RuntimeContext,
        env: &StageEnv,
    ) -> Result<NodeOutcome, AttractorError>;
}

pub struct CodergenHandler {
    backend: Option<Arc<dyn CodergenBackend>>,
}

impl CodergenHandler {
    pub fn new(backend: Option<Arc<dyn CodergenBackend>>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NodeHandler for CodergenHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        graph: &Graph,
        env: &StageEnv,
    ) -> Result<NodeOutcome, AttractorError> {
        let prompt = match compose_prompt(node, context, graph) {
            Ok(prompt) => prompt,
            Err(error) => return Ok(NodeOutcome::failure(error.to_string())),
        };

        let key_base = response_key_base(node);
        let mut outcome = if let Some(backend) = self.backend.as_ref() {
            match backend.run(node, &prompt, context, env).await {
                Ok(outcome) => outcome,
                Err(error) => NodeOutcome::failure(error.to_string()),
            }
        } else {
            // no backend wired up (dry runs): stage succeeds with a canned
            // response
            let response = format!("[Simulated] Response for stage: {}", node.id);
            let mut outcome = NodeOutcome::success()
                .with_note(format!("Stage completed: {}", node.id));
            outcome.context_updates.insert(
                format!("{key_base}._full_response"),
                Value::String(response),
            );
            outcome
        };

        outcome
            .context_updates
            .entry(format!("{key_base}._prompt"))
            .or_insert_with(|| Value::String(prompt));
        outcome
            .context_updates
            .insert("last_stage".to_string(), Value::String(node.id.clone()));
        Ok(outcome)
    }
}

/// Prompt composition order: prompt-file contents (joined by a `---` rule),
/// the context summary, then the node's literal prompt. `$goal` and `$key`
/// placeholders expand from context.
pub fn compose_prompt(
    node: &Node,
    context: &RuntimeContext,
    graph: &Graph,
) -> Result<String, AttractorError> {
    let mut sections: Vec<String> = Vec::new();

    if let Some(prompt_file) = node.attrs.get_str("prompt_file") {
        let mut file_sections = Vec::new();
        for path in prompt_file.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let contents = fs::read_to_string(path).map_err(|error| {
                AttractorError::Runtime(format!("failed to read prompt_file '{path}': {error}"))
            })?;
            file_sections.push(contents.trim_end().to_string());
        }
        if !file_sections.is_empty() {
            sections.push(file_sections.join("\n\n---\n\n"));
        }
    }

    let summary = render_context_summary(context);
    if !summary.trim().is_empty() {
        sections.push(format!("## Context\n\n{summary}"));
    }

    let mut literal = node.attrs.get_str("prompt").unwrap_or_default().to_string();
    if literal.trim().is_empty() && !node.attrs.get_str("prompt_file").is_some_and(|f| !f.is_empty())
    {
        literal = node
            .attrs
            .get_str("label")
            .filter(|label| !label.trim().is_empty())
            .unwrap_or(node.id.as_str())
            .to_string();
    }
    if !literal.trim().is_empty() {
        sections.push(literal);
    }

    let mut prompt = sections.join("\n\n");
    if let Some(goal) = context.get("graph.goal").and_then(Value::as_str) {
        prompt = prompt.replace("$goal", goal);
    } else if let Some(goal) = graph.attrs.get_str("goal") {
        prompt = prompt.replace("$goal", goal);
    }
    Ok(expand_context_refs(&prompt, context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeStatus, parse_dot};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::io::Write;

    struct RecordingBackend;

    #[async_trait]
    impl CodergenBackend for RecordingBackend {
        async fn run(
            &self,
            node: &Node,
            prompt: &str,
            _context: &RuntimeContext,
            _env: &StageEnv,
        ) -> Result<NodeOutcome, AttractorError> {
            let mut outcome = NodeOutcome::success();
            outcome.context_updates.insert(
                format!("{}._full_response", node.id),
                json!(format!("reply::{prompt}")),
            );
            Ok(outcome)
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn codergen_handler_expands_goal_and_returns_success() {
        let graph = parse_dot(
            r#"
            digraph G {
                graph [goal="ship"]
                n1 [shape=box, prompt="achieve $goal"]
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("n1").expect("node should exist");
        let handler = CodergenHandler::new(Some(Arc::new(RecordingBackend)));

        let mut context = RuntimeContext::new();
        context.insert("graph.goal".to_string(), json!("ship"));
        let outcome = handler
            .execute(node, &context, &graph, &StageEnv::for_tests())
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, NodeStatus::Success);
        let response = outcome
            .context_updates
            .get("n1._full_response")
            .and_then(Value::as_str)
            .expect("response recorded");
        assert!(response.contains("achieve ship"));
        assert_eq!(
            outcome.context_updates.get("last_stage"),
            Some(&json!("n1"))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn codergen_handler_no_backend_expected_simulated_response() {
        let graph = parse_dot("digraph G { n1 [shape=box, label=\"Plan\"] }").expect("graph parses");
        let node = graph.nodes.get("n1").expect("node should exist");
        let handler = CodergenHandler::new(None);

        let outcome = handler
            .execute(node, &RuntimeContext::new(), &graph, &StageEnv::for_tests())
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Success);
        assert!(outcome.context_updates.contains_key("n1._full_response"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn codergen_handler_missing_prompt_file_expected_fail() {
        let graph = parse_dot(
            "digraph G { n1 [shape=box, prompt_file=\"/no/such/file.md\"] }",
        )
        .expect("graph parses");
        let node = graph.nodes.get("n1").expect("node should exist");
        let handler = CodergenHandler::new(Some(Arc::new(RecordingBackend)));

        let outcome = handler
            .execute(node, &RuntimeContext::new(), &graph, &StageEnv::for_tests())
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Fail);
    }

    #[test]
    fn compose_prompt_orders_files_summary_literal() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file should create");
        writeln!(file, "file instructions").expect("write should succeed");

        let graph = parse_dot(&format!(
            "digraph G {{ n1 [prompt=\"do the thing\", prompt_file=\"{}\"] }}",
            file.path().display()
        ))
        .expect("graph parses");
        let node = graph.nodes.get("n1").expect("node should exist");

        let context = BTreeMap::from([("plan.response".to_string(), json!("earlier result"))]);
        let prompt = compose_prompt(node, &context, &graph).expect("prompt composes");

        let file_at = prompt.find("file instructions").expect("file section present");
        let summary_at = prompt.find("## Context").expect("summary present");
        let literal_at = prompt.find("do the thing").expect("literal present");
        assert!(file_at < summary_at && summary_at < literal_at);
        assert!(prompt.contains("earlier result"));
    }
}
