use crate::NodeStatus;

/// Markers parsed from the tail of an assistant response.
///
/// `[STATUS: success|fail|partial_success|retry]` (last occurrence wins),
/// `[PREFERRED_LABEL: <label>]`, `[NEXT: <node_id>]` (repeatable, ordered),
/// `[FAILURE_REASON: <text>]`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedMarkers {
    pub status: Option<NodeStatus>,
    pub preferred_label: Option<String>,
    pub next_ids: Vec<String>,
    pub failure_reason: Option<String>,
}

pub fn parse_status_markers(text: &str) -> ParsedMarkers {
    let mut markers = ParsedMarkers::default();

    for line in text.lines() {
        let mut rest = line;
        while let Some(open) = rest.find('[') {
            rest = &rest[open + 1..];
            let Some(close) = rest.find(']') else {
                break;
            };
            let body = &rest[..close];
            rest = &rest[close + 1..];

            let Some((tag, value)) = body.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match tag.trim().to_ascii_uppercase().as_str() {
                "STATUS" => {
                    if let Some(status) = parse_status_value(value) {
                        markers.status = Some(status);
                    }
                }
                "PREFERRED_LABEL" if !value.is_empty() => {
                    markers.preferred_label = Some(value.to_string());
                }
                "NEXT" if !value.is_empty() => {
                    markers.next_ids.push(value.to_string());
                }
                "FAILURE_REASON" if !value.is_empty() => {
                    markers.failure_reason = Some(value.to_string());
                }
                _ => {}
            }
        }
    }

    markers
}

fn parse_status_value(value: &str) -> Option<NodeStatus> {
    match value.to_ascii_lowercase().as_str() {
        "success" => Some(NodeStatus::Success),
        "partial_success" => Some(NodeStatus::PartialSuccess),
        "retry" => Some(NodeStatus::Retry),
        "fail" | "failure" => Some(NodeStatus::Fail),
        _ => None,
    }
}
