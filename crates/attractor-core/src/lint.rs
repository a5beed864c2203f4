use crate::handlers::NodeKind;
use crate::{Graph, ValidationError, validate_condition_expression};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// What a diagnostic points at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSubject {
    Graph,
    Node { id: String },
    Edge { from: String, to: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub subject: DiagnosticSubject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

impl Diagnostic {
    pub fn error(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_severity(rule, Severity::Error, message)
    }

    pub fn warning(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_severity(rule, Severity::Warning, message)
    }

    fn with_severity(
        rule: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule: rule.into(),
            severity,
            message: message.into(),
            subject: DiagnosticSubject::Graph,
            fix: None,
        }
    }

    pub fn on_node(mut self, id: impl Into<String>) -> Self {
        self.subject = DiagnosticSubject::Node { id: id.into() };
        self
    }

    pub fn on_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.subject = DiagnosticSubject::Edge {
            from: from.into(),
            to: to.into(),
        };
        self
    }

    pub fn suggest(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn node_id(&self) -> Option<&str> {
        match &self.subject {
            DiagnosticSubject::Node { id } => Some(id),
            _ => None,
        }
    }
}

pub trait LintRule {
    fn name(&self) -> &str;
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic>;
}

pub fn validate(graph: &Graph, extra_rules: &[&dyn LintRule]) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    diagnostics.extend(rule_start_node(graph));
    diagnostics.extend(rule_terminal_node(graph));
    diagnostics.extend(rule_edge_endpoints_exist(graph));
    diagnostics.extend(rule_start_no_incoming(graph));
    diagnostics.extend(rule_exit_no_outgoing(graph));
    diagnostics.extend(rule_reachability(graph));
    diagnostics.extend(rule_exit_reachable(graph));
    diagnostics.extend(rule_human_gate_arity(graph));
    diagnostics.extend(rule_prompt_sources(graph));
    diagnostics.extend(rule_conditional_branch_coverage(graph));
    diagnostics.extend(rule_tool_failure_edge(graph));
    diagnostics.extend(rule_prompt_file_readable(graph));
    diagnostics.extend(rule_condition_syntax(graph));
    diagnostics.extend(rule_retry_target_exists(graph));
    diagnostics.extend(rule_goal_gate_has_retry(graph));

    for rule in extra_rules {
        diagnostics.extend(rule.apply(graph));
    }

    diagnostics
}

pub fn validate_or_raise(
    graph: &Graph,
    extra_rules: &[&dyn LintRule],
) -> Result<Vec<Diagnostic>, ValidationError> {
    let diagnostics = validate(graph, extra_rules);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics));
    }
    Ok(diagnostics)
}

fn rule_start_node(graph: &Graph) -> Vec<Diagnostic> {
    let starts = graph.start_candidates();
    if starts.len() == 1 {
        Vec::new()
    } else {
        vec![Diagnostic::error(
            "start_node",
            format!(
                "pipeline must have exactly one start node; found {}",
                starts.len()
            ),
        )]
    }
}

fn rule_terminal_node(graph: &Graph) -> Vec<Diagnostic> {
    if graph.terminal_candidates().is_empty() {
        vec![Diagnostic::error(
            "terminal_node",
            "pipeline must have at least one exit node",
        )]
    } else {
        Vec::new()
    }
}

fn rule_edge_endpoints_exist(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for edge in &graph.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !graph.nodes.contains_key(endpoint) {
                diagnostics.push(
                    Diagnostic::error(
                        "edge_endpoints_exist",
                        format!("edge endpoint '{}' does not exist", endpoint),
                    )
                    .on_edge(edge.from.clone(), edge.to.clone()),
                );
            }
        }
    }
    diagnostics
}

fn rule_start_no_incoming(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for start in graph.start_candidates() {
        if graph.incoming_edges(&start.id).next().is_some() {
            diagnostics.push(
                Diagnostic::error("start_no_incoming", "start node must have no incoming edges")
                    .on_node(start.id.clone()),
            );
        }
    }
    diagnostics
}

fn rule_exit_no_outgoing(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for terminal in graph.terminal_candidates() {
        if graph.outgoing_edges(&terminal.id).next().is_some() {
            diagnostics.push(
                Diagnostic::error("exit_no_outgoing", "exit node must have no outgoing edges")
                    .on_node(terminal.id.clone()),
            );
        }
    }
    diagnostics
}

fn reachable_from_start(graph: &Graph) -> BTreeSet<String> {
    let mut visited = BTreeSet::new();
    let Some(start) = graph.start_candidates().into_iter().next() else {
        return visited;
    };

    let mut queue = VecDeque::new();
    visited.insert(start.id.clone());
    queue.push_back(start.id.clone());
    while let Some(node_id) = queue.pop_front() {
        for edge in graph.outgoing_edges(&node_id) {
            if visited.insert(edge.to.clone()) {
                queue.push_back(edge.to.clone());
            }
        }
    }
    visited
}

fn rule_reachability(graph: &Graph) -> Vec<Diagnostic> {
    if graph.start_candidates().len() != 1 {
        return Vec::new();
    }
    let visited = reachable_from_start(graph);

    graph
        .nodes
        .values()
        .filter(|node| !visited.contains(&node.id))
        .map(|node| {
            Diagnostic::error("reachability", "node is unreachable from start")
                .on_node(node.id.clone())
        })
        .collect()
}

/// Every node on a path from start must still be able to reach some exit.
fn rule_exit_reachable(graph: &Graph) -> Vec<Diagnostic> {
    if graph.start_candidates().len() != 1 || graph.terminal_candidates().is_empty() {
        return Vec::new();
    }

    let mut reaches_exit = BTreeSet::new();
    let mut queue = VecDeque::new();
    for exit in graph.terminal_candidates() {
        reaches_exit.insert(exit.id.clone());
        queue.push_back(exit.id.clone());
    }
    while let Some(node_id) = queue.pop_front() {
        for edge in graph.incoming_edges(&node_id) {
            if reaches_exit.insert(edge.from.clone()) {
                queue.push_back(edge.from.clone());
            }
        }
    }

    reachable_from_start(graph)
        .into_iter()
        .filter(|node_id| !reaches_exit.contains(node_id))
        .map(|node_id| {
            Diagnostic::error("exit_reachable", "node cannot reach any exit").on_node(node_id)
        })
        .collect()
}

fn rule_human_gate_arity(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        if NodeKind::of(node) == NodeKind::Human && graph.outgoing_edges(&node.id).count() < 2 {
            diagnostics.push(
                Diagnostic::error(
                    "human_gate_arity",
                    "human gate must have at least two outgoing edges",
                )
                .on_node(node.id.clone()),
            );
        }
    }
    diagnostics
}

fn rule_prompt_sources(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        if NodeKind::of(node) != NodeKind::Codergen {
            continue;
        }
        let has_prompt = !node.attrs.get_str("prompt").unwrap_or_default().is_empty();
        let has_prompt_file = !node
            .attrs
            .get_str("prompt_file")
            .unwrap_or_default()
            .is_empty();
        let has_label = !node.attrs.get_str("label").unwrap_or_default().is_empty();

        if has_prompt && has_prompt_file {
            diagnostics.push(
                Diagnostic::error(
                    "prompt_sources",
                    "stage declares both prompt and prompt_file; use one",
                )
                .on_node(node.id.clone()),
            );
        } else if !has_prompt && !has_prompt_file && !has_label {
            diagnostics.push(
                Diagnostic::warning(
                    "prompt_sources",
                    "codergen stage should define prompt, prompt_file, or label",
                )
                .on_node(node.id.clone()),
            );
        }
    }
    diagnostics
}

fn rule_conditional_branch_coverage(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        if NodeKind::of(node) != NodeKind::Conditional {
            continue;
        }

        let conditions: Vec<String> = graph
            .outgoing_edges(&node.id)
            .map(|edge| {
                edge.attrs
                    .get_str("condition")
                    .unwrap_or_default()
                    .replace(' ', "")
            })
            .collect();
        let has_success_branch = conditions.iter().any(|c| c == "outcome=success");
        let has_non_success_branch = conditions
            .iter()
            .any(|c| c.is_empty() || c == "outcome!=success" || c == "outcome=fail");

        if has_success_branch && !has_non_success_branch {
            diagnostics.push(
                Diagnostic::warning(
                    "conditional_branch_coverage",
                    "conditional gate has a success branch but no branch for non-success outcomes",
                )
                .on_node(node.id.clone())
                .suggest("add an edge with condition=\"outcome!=success\""),
            );
        }
    }
    diagnostics
}

fn rule_tool_failure_edge(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        if NodeKind::of(node) != NodeKind::Tool {
            continue;
        }

        let has_failure_route = graph.outgoing_edges(&node.id).any(|edge| {
            let condition = edge
                .attrs
                .get_str("condition")
                .unwrap_or_default()
                .replace(' ', "");
            if condition == "outcome=fail" || condition == "outcome!=success" {
                return true;
            }
            condition.is_empty()
                && graph
                    .node(&edge.to)
                    .is_some_and(|target| NodeKind::of(target) == NodeKind::Conditional)
        });

        if !has_failure_route {
            diagnostics.push(
                Diagnostic::warning(
                    "tool_failure_edge",
                    "tool stage has no failure edge to a routing gate; a failure here ends the run",
                )
                .on_node(node.id.clone())
                .suggest("route the command into a diamond gate that branches on outcome"),
            );
        }
    }
    diagnostics
}

fn rule_prompt_file_readable(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        let Some(prompt_file) = node.attrs.get_str("prompt_file") else {
            continue;
        };
        for path in prompt_file.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if std::fs::metadata(path).is_err() {
                diagnostics.push(
                    Diagnostic::warning(
                        "prompt_file_readable",
                        format!("prompt_file '{path}' is not readable"),
                    )
                    .on_node(node.id.clone()),
                );
            }
        }
    }
    diagnostics
}

fn rule_condition_syntax(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for edge in &graph.edges {
        let condition = edge.attrs.get_str("condition").unwrap_or_default();
        if condition.is_empty() {
            continue;
        }
        if let Err(message) = validate_condition_expression(condition) {
            // invalid predicates evaluate to false at runtime; surface them
            // here instead of failing the load
            diagnostics.push(
                Diagnostic::warning("condition_syntax", message)
                    .on_edge(edge.from.clone(), edge.to.clone()),
            );
        }
    }
    diagnostics
}

fn rule_retry_target_exists(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    for key in ["retry_target", "fallback_retry_target"] {
        if let Some(target) = graph.attrs.get_str(key) {
            if !target.is_empty() && !graph.nodes.contains_key(target) {
                diagnostics.push(Diagnostic::warning(
                    "retry_target_exists",
                    format!("graph {key} references missing node '{target}'"),
                ));
            }
        }
    }

    for node in graph.nodes.values() {
        for key in ["retry_target", "fallback_retry_target"] {
            if let Some(target) = node.attrs.get_str(key) {
                if !target.is_empty() && !graph.nodes.contains_key(target) {
                    diagnostics.push(
                        Diagnostic::warning(
                            "retry_target_exists",
                            format!("node {key} references missing node '{target}'"),
                        )
                        .on_node(node.id.clone()),
                    );
                }
            }
        }
    }

    diagnostics
}

fn rule_goal_gate_has_retry(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        if node.attrs.get_bool("goal_gate") != Some(true) {
            continue;
        }
        let has_target = ["retry_target", "fallback_retry_target"].iter().any(|key| {
            !node.attrs.get_str(key).unwrap_or_default().is_empty()
                || !graph.attrs.get_str(key).unwrap_or_default().is_empty()
        });
        if !has_target {
            diagnostics.push(
                Diagnostic::warning(
                    "goal_gate_has_retry",
                    "goal_gate node should define retry_target or fallback_retry_target",
                )
                .on_node(node.id.clone())
                .suggest("set retry_target to the stage that should redo the work"),
            );
        }
    }
    diagnostics
}
