use crate::{Node, RuntimeContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const USAGE_FIELDS: &[&str] = &[
    "input_tokens",
    "output_tokens",
    "cache_read_tokens",
    "cache_write_tokens",
    "total_tokens",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

impl UsageMetrics {
    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_read_tokens == 0
            && self.cache_write_tokens == 0
            && self.total_tokens == 0
            && self.cost == 0.0
    }

    pub fn accumulate(&mut self, other: &UsageMetrics) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.total_tokens += other.total_tokens;
        self.cost += other.cost;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageAttemptUsage {
    pub stage_id: String,
    pub attempt: u32,
    pub metrics: UsageMetrics,
}

/// Always produced, even for runs that never touched an LLM, so renderers
/// can print a summary unconditionally.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunUsageSummary {
    pub stages: Vec<StageAttemptUsage>,
    pub totals: UsageMetrics,
}

impl RunUsageSummary {
    pub fn push(&mut self, attempt: StageAttemptUsage) {
        self.totals.accumulate(&attempt.metrics);
        self.stages.push(attempt);
    }
}

/// Context namespace a stage writes its response and usage keys under.
pub fn response_key_base(node: &Node) -> String {
    node.attrs
        .get_str("response_key_base")
        .filter(|base| !base.trim().is_empty())
        .map(|base| base.trim().to_string())
        .unwrap_or_else(|| node.id.clone())
}

/// Pull usage metrics out of a single attempt's `context_updates`. Reading
/// the updates rather than the shared context keeps a retried stage from
/// re-counting keys a previous attempt already wrote.
pub fn extract_attempt_metrics(updates: &RuntimeContext, key_base: &str) -> UsageMetrics {
    let field = |name: &str| coerce_u64(updates.get(&format!("{key_base}.usage.{name}")));
    UsageMetrics {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_read_tokens: field("cache_read_tokens"),
        cache_write_tokens: field("cache_write_tokens"),
        total_tokens: field("total_tokens"),
        cost: coerce_f64(updates.get(&format!("{key_base}.usage.cost"))),
    }
}

pub fn usage_updates(key_base: &str, metrics: &UsageMetrics) -> RuntimeContext {
    let mut updates = RuntimeContext::new();
    let mut set = |name: &str, value: u64| {
        updates.insert(
            format!("{key_base}.usage.{name}"),
            Value::Number(value.into()),
        );
    };
    set("input_tokens", metrics.input_tokens);
    set("output_tokens", metrics.output_tokens);
    set("cache_read_tokens", metrics.cache_read_tokens);
    set("cache_write_tokens", metrics.cache_write_tokens);
    set("total_tokens", metrics.total_tokens);
    updates.insert(
        format!("{key_base}.usage.cost"),
        serde_json::Number::from_f64(metrics.cost)
            .map(Value::Number)
            .unwrap_or(Value::Number(0.into())),
    );
    updates
}

// Providers occasionally report null, strings, or non-finite numbers;
// anything that is not a finite non-negative number counts as zero.
fn coerce_u64(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f as u64)
            })
            .unwrap_or(0),
        _ => 0,
    }
}

fn coerce_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(number)) => number.as_f64().filter(|f| f.is_finite()).unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn extract_attempt_metrics_reads_namespaced_keys() {
        let updates = BTreeMap::from([
            ("plan.usage.input_tokens".to_string(), json!(120)),
            ("plan.usage.output_tokens".to_string(), json!(30)),
            ("plan.usage.total_tokens".to_string(), json!(150)),
            ("plan.usage.cost".to_string(), json!(0.25)),
        ]);
        let metrics = extract_attempt_metrics(&updates, "plan");
        assert_eq!(metrics.input_tokens, 120);
        assert_eq!(metrics.total_tokens, 150);
        assert!((metrics.cost - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn extract_attempt_metrics_other_namespace_expected_zero() {
        let updates = BTreeMap::from([("other.usage.input_tokens".to_string(), json!(500))]);
        assert!(extract_attempt_metrics(&updates, "plan").is_zero());
    }

    #[test]
    fn coercion_non_numeric_and_non_finite_expected_zero() {
        let updates = BTreeMap::from([
            ("plan.usage.input_tokens".to_string(), json!("12")),
            ("plan.usage.output_tokens".to_string(), Value::Null),
            ("plan.usage.total_tokens".to_string(), json!(-5)),
        ]);
        let metrics = extract_attempt_metrics(&updates, "plan");
        assert!(metrics.is_zero());
    }

    #[test]
    fn run_usage_summary_accumulates_totals() {
        let mut summary = RunUsageSummary::default();
        summary.push(StageAttemptUsage {
            stage_id: "plan".to_string(),
            attempt: 1,
            metrics: UsageMetrics {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                ..UsageMetrics::default()
            },
        });
        summary.push(StageAttemptUsage {
            stage_id: "plan".to_string(),
            attempt: 2,
            metrics: UsageMetrics {
                input_tokens: 20,
                output_tokens: 10,
                total_tokens: 30,
                ..UsageMetrics::default()
            },
        });

        assert_eq!(summary.stages.len(), 2);
        assert_eq!(summary.totals.total_tokens, 45);
    }

    #[test]
    fn usage_updates_round_trip_expected_same_metrics() {
        let metrics = UsageMetrics {
            input_tokens: 7,
            output_tokens: 3,
            cache_read_tokens: 1,
            cache_write_tokens: 2,
            total_tokens: 13,
            cost: 0.5,
        };
        let updates = usage_updates("plan", &metrics);
        assert_eq!(extract_attempt_metrics(&updates, "plan"), metrics);
    }
}
