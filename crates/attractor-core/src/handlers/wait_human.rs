use crate::handlers::{NodeHandler, StageEnv};
use crate::{
    AttractorError, Graph, HumanAnswer, HumanChoice, HumanQuestion, HumanQuestionType, Interviewer,
    Node, NodeOutcome, NodeStatus, RuntimeContext, normalize_label,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Labels that mark a gate's approval branch.
const APPROVAL_LABELS: &[&str] = &["approve", "approved", "yes", "accept", "lgtm", "ship"];

/// Human gates ask the interviewer to pick among the outgoing labeled edges.
/// The selected label becomes the outcome's `preferred_label`, which drives
/// edge selection.
pub struct WaitHumanHandler {
    interviewer: Arc<dyn Interviewer>,
}

impl WaitHumanHandler {
    pub fn new(interviewer: Arc<dyn Interviewer>) -> Self {
        Self { interviewer }
    }
}

#[async_trait]
impl NodeHandler for WaitHumanHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &RuntimeContext,
        graph: &Graph,
        _env: &StageEnv,
    ) -> Result<NodeOutcome, AttractorError> {
        let choices = derive_choices(node, graph);
        if choices.is_empty() {
            return Ok(NodeOutcome::failure("no outgoing edges for human gate"));
        }

        let question = HumanQuestion {
            stage: node.id.clone(),
            text: node
                .attrs
                .get_str("label")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or("Select an option:")
                .to_string(),
            question_type: HumanQuestionType::MultipleChoice,
            choices: choices.clone(),
            default_choice: node
                .attrs
                .get_str("human.default_choice")
                .map(ToOwned::to_owned),
            timeout: node
                .attrs
                .get_millis("human.timeout")
                .map(Duration::from_millis),
        };

        let answer = self.interviewer.ask(question).await;
        let selected = match answer {
            HumanAnswer::Selected(raw) => {
                find_choice(&choices, &raw).unwrap_or_else(|| choices[0].clone())
            }
            HumanAnswer::Yes => approval_choice(&choices).unwrap_or_else(|| choices[0].clone()),
            HumanAnswer::No => non_approval_choice(&choices)
                .unwrap_or_else(|| choices[choices.len() - 1].clone()),
            HumanAnswer::FreeText(raw) => match find_choice(&choices, &raw) {
                Some(choice) => choice,
                None => {
                    return Ok(NodeOutcome::failure(format!(
                        "answer '{raw}' did not match an option"
                    )));
                }
            },
            HumanAnswer::Timeout => {
                let default_choice = node
                    .attrs
                    .get_str("human.default_choice")
                    .and_then(|raw| find_choice(&choices, raw));
                match default_choice {
                    Some(choice) => choice,
                    None => {
                        return Ok(NodeOutcome::retry("human gate timeout, no default"));
                    }
                }
            }
            HumanAnswer::Skipped => return Ok(NodeOutcome::failure("human skipped interaction")),
        };

        let mut outcome = NodeOutcome::with_status(NodeStatus::Success);
        outcome.notes = Some(format!("human selected {}", selected.key));
        outcome.context_updates.insert(
            "human.gate.selected".to_string(),
            Value::String(selected.key.clone()),
        );
        outcome.context_updates.insert(
            "human.gate.label".to_string(),
            Value::String(selected.label.clone()),
        );
        outcome.preferred_label = Some(selected.label.clone());
        outcome.suggested_next_ids = vec![selected.to_node.clone()];
        Ok(outcome)
    }
}

/// The edge a success-like "approve" answer routes to: first edge whose
/// normalized label is an approval word, else the gate's first edge.
pub fn approval_target(node: &Node, graph: &Graph) -> Option<String> {
    let choices = derive_choices(node, graph);
    approval_choice(&choices)
        .or_else(|| choices.first().cloned())
        .map(|choice| choice.to_node)
}

fn approval_choice(choices: &[HumanChoice]) -> Option<HumanChoice> {
    choices
        .iter()
        .find(|choice| APPROVAL_LABELS.contains(&normalize_label(&choice.label).as_str()))
        .cloned()
}

fn non_approval_choice(choices: &[HumanChoice]) -> Option<HumanChoice> {
    choices
        .iter()
        .find(|choice| !APPROVAL_LABELS.contains(&normalize_label(&choice.label).as_str()))
        .cloned()
}

fn derive_choices(node: &Node, graph: &Graph) -> Vec<HumanChoice> {
    graph
        .outgoing_edges(&node.id)
        .map(|edge| {
            let label = edge
                .attrs
                .get_str("label")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(&edge.to)
                .to_string();
            HumanChoice {
                key: parse_accelerator_key(&label),
                label,
                to_node: edge.to.clone(),
            }
        })
        .collect()
}

fn parse_accelerator_key(label: &str) -> String {
    let trimmed = label.trim();
    if let Some(inner) = trimmed.strip_prefix('[').and_then(|raw| raw.split_once(']')) {
        let key = inner.0.trim();
        if !key.is_empty() {
            return key.to_ascii_uppercase();
        }
    }
    if let Some((left, _)) = trimmed.split_once(')') {
        let key = left.trim();
        if key.len() == 1 {
            return key.to_ascii_uppercase();
        }
    }
    if let Some((left, _)) = trimmed.split_once('-') {
        let key = left.trim();
        if key.len() == 1 {
            return key.to_ascii_uppercase();
        }
    }
    trimmed
        .chars()
        .next()
        .map(|ch| ch.to_ascii_uppercase().to_string())
        .unwrap_or_else(|| "X".to_string())
}

fn find_choice(choices: &[HumanChoice], raw: &str) -> Option<HumanChoice> {
    let needle = raw.trim().to_ascii_lowercase();
    choices
        .iter()
        .find(|choice| {
            choice.key.to_ascii_lowercase() == needle
                || choice.label.to_ascii_lowercase() == needle
                || choice.to_node.to_ascii_lowercase() == needle
        })
        .cloned()
}
