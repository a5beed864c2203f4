use crate::handlers::NodeKind;
use crate::{Edge, Graph, NodeOutcome, RuntimeContext, evaluate_condition_expression};

/// Success-path edge selection, in priority order: matching conditions,
/// preferred label, suggested next ids, unconditional edges, anything left.
/// Weight then lexical target id breaks every tie.
pub fn select_next_edge<'a>(
    graph: &'a Graph,
    from_node_id: &'a str,
    outcome: &NodeOutcome,
    context: &RuntimeContext,
) -> Option<&'a Edge> {
    let edges: Vec<&Edge> = graph.outgoing_edges(from_node_id).collect();
    if edges.is_empty() {
        return None;
    }

    let condition_matched: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| {
            let condition = edge.attrs.get_str("condition").unwrap_or_default().trim();
            !condition.is_empty()
                && evaluate_condition_expression(condition, outcome, context).unwrap_or(false)
        })
        .collect();
    if !condition_matched.is_empty() {
        return best_by_weight_then_lexical(condition_matched);
    }

    // eligible for label and suggestion matching: unconditional or matching
    let eligible: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| {
            let condition = edge.attrs.get_str("condition").unwrap_or_default().trim();
            condition.is_empty()
                || evaluate_condition_expression(condition, outcome, context).unwrap_or(false)
        })
        .collect();

    if let Some(preferred) = outcome.preferred_label.as_ref() {
        let preferred = normalize_label(preferred);
        if let Some(edge) = eligible.iter().find(|edge| {
            normalize_label(edge.attrs.get_str("label").unwrap_or_default()) == preferred
        }) {
            return Some(*edge);
        }
    }

    for suggested in &outcome.suggested_next_ids {
        if let Some(edge) = eligible.iter().find(|edge| edge.to == *suggested) {
            return Some(*edge);
        }
    }

    let unconditional: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| {
            edge.attrs
                .get_str("condition")
                .unwrap_or_default()
                .trim()
                .is_empty()
        })
        .collect();
    if !unconditional.is_empty() {
        return best_by_weight_then_lexical(unconditional);
    }

    best_by_weight_then_lexical(edges)
}

/// Failure-path selection is deliberately narrower so a failure is never
/// swallowed by an ordinary happy-path edge: explicit condition matches,
/// then unconditional edges whose target is itself a routing gate, then
/// handler-suggested targets. `None` sends the caller to the retry-target
/// fallback.
pub fn select_failure_edge<'a>(
    graph: &'a Graph,
    from_node_id: &'a str,
    outcome: &NodeOutcome,
    context: &RuntimeContext,
) -> Option<&'a Edge> {
    let edges: Vec<&Edge> = graph.outgoing_edges(from_node_id).collect();
    if edges.is_empty() {
        return None;
    }

    let condition_matched: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| {
            let condition = edge.attrs.get_str("condition").unwrap_or_default().trim();
            !condition.is_empty()
                && evaluate_condition_expression(condition, outcome, context).unwrap_or(false)
        })
        .collect();
    if !condition_matched.is_empty() {
        return best_by_weight_then_lexical(condition_matched);
    }

    let to_routing_gate: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| {
            edge.attrs
                .get_str("condition")
                .unwrap_or_default()
                .trim()
                .is_empty()
                && graph
                    .node(&edge.to)
                    .is_some_and(|node| NodeKind::of(node) == NodeKind::Conditional)
        })
        .collect();
    if !to_routing_gate.is_empty() {
        return best_by_weight_then_lexical(to_routing_gate);
    }

    for suggested in &outcome.suggested_next_ids {
        if let Some(edge) = edges.iter().find(|edge| edge.to == *suggested) {
            return Some(*edge);
        }
    }

    None
}

fn best_by_weight_then_lexical<'a, I>(edges: I) -> Option<&'a Edge>
where
    I: IntoIterator<Item = &'a Edge>,
{
    edges.into_iter().max_by(|left, right| {
        edge_weight(left)
            .cmp(&edge_weight(right))
            .then_with(|| right.to.cmp(&left.to))
    })
}

pub fn edge_weight(edge: &Edge) -> i64 {
    edge.attrs.get_i64("weight").unwrap_or(0)
}

/// Lower-case, trim, and strip accelerator prefixes (`[Y] Yes`, `Y) Yes`,
/// `Y - Yes`) so handler hints and edge labels compare loosely.
pub fn normalize_label(input: &str) -> String {
    let trimmed = input.trim().to_ascii_lowercase();

    if trimmed.starts_with('[') {
        if let Some((_, rest)) = trimmed.split_once(']') {
            return rest.trim().to_string();
        }
    }

    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b')' {
        return trimmed[2..].trim().to_string();
    }
    if bytes.len() >= 3 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b' ' && bytes[2] == b'-' {
        return trimmed[3..].trim().to_string();
    }

    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeOutcome, parse_dot};

    fn base_outcome() -> NodeOutcome {
        NodeOutcome::success()
    }

    #[test]
    fn select_next_edge_condition_beats_weight_expected_condition_route() {
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                via_weight
                via_condition
                n1 -> via_weight [weight=100]
                n1 -> via_condition [condition="outcome=success"]
            }
            "#,
        )
        .expect("graph should parse");

        let selected = select_next_edge(&graph, "n1", &base_outcome(), &RuntimeContext::new())
            .expect("edge expected");
        assert_eq!(selected.to, "via_condition");
    }

    #[test]
    fn select_next_edge_preferred_label_normalized_expected_match() {
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                yes
                no
                n1 -> yes [label="[Y] Yes"]
                n1 -> no [label="No"]
            }
            "#,
        )
        .expect("graph should parse");
        let mut outcome = base_outcome();
        outcome.preferred_label = Some("yes".to_string());

        let selected =
            select_next_edge(&graph, "n1", &outcome, &RuntimeContext::new()).expect("edge expected");
        assert_eq!(selected.to, "yes");
    }

    #[test]
    fn select_next_edge_suggested_ids_after_label_expected_order() {
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                a
                b
                n1 -> a
                n1 -> b
            }
            "#,
        )
        .expect("graph should parse");
        let mut outcome = base_outcome();
        outcome.suggested_next_ids = vec!["b".to_string(), "a".to_string()];

        let selected =
            select_next_edge(&graph, "n1", &outcome, &RuntimeContext::new()).expect("edge expected");
        assert_eq!(selected.to, "b");
    }

    #[test]
    fn select_next_edge_weight_then_lexical_expected_deterministic() {
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                a
                b
                c
                n1 -> b [weight=1]
                n1 -> c [weight=1]
                n1 -> a [weight=2]
            }
            "#,
        )
        .expect("graph should parse");

        let selected = select_next_edge(&graph, "n1", &base_outcome(), &RuntimeContext::new())
            .expect("edge expected");
        assert_eq!(selected.to, "a");
    }

    #[test]
    fn select_next_edge_lexical_tie_expected_smallest_id() {
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                a
                b
                n1 -> b [weight=1]
                n1 -> a [weight=1]
            }
            "#,
        )
        .expect("graph should parse");

        let selected = select_next_edge(&graph, "n1", &base_outcome(), &RuntimeContext::new())
            .expect("edge expected");
        assert_eq!(selected.to, "a");
    }

    #[test]
    fn select_failure_edge_plain_edge_expected_none() {
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                next
                n1 -> next
            }
            "#,
        )
        .expect("graph should parse");
        let outcome = NodeOutcome::failure("boom");

        assert!(select_failure_edge(&graph, "n1", &outcome, &RuntimeContext::new()).is_none());
    }

    #[test]
    fn select_failure_edge_unconditional_to_gate_expected_allowed() {
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                gate [shape=diamond]
                n1 -> gate
            }
            "#,
        )
        .expect("graph should parse");
        let outcome = NodeOutcome::failure("boom");

        let selected = select_failure_edge(&graph, "n1", &outcome, &RuntimeContext::new())
            .expect("edge expected");
        assert_eq!(selected.to, "gate");
    }

    #[test]
    fn select_failure_edge_condition_match_expected_first_priority() {
        let graph = parse_dot(
            r#"
            digraph G {
                n1
                cleanup
                gate [shape=diamond]
                n1 -> gate
                n1 -> cleanup [condition="outcome=fail"]
            }
            "#,
        )
        .expect("graph should parse");
        let outcome = NodeOutcome::failure("boom");

        let selected = select_failure_edge(&graph, "n1", &outcome, &RuntimeContext::new())
            .expect("edge expected");
        assert_eq!(selected.to, "cleanup");
    }

    #[test]
    fn normalize_label_accelerator_prefixes_expected_stripped() {
        assert_eq!(normalize_label("[Y] Yes"), "yes");
        assert_eq!(normalize_label("y) Yes"), "yes");
        assert_eq!(normalize_label("Y - Yes"), "yes");
        assert_eq!(normalize_label("  Plain  "), "plain");
    }
}
