use crate::{FailureClass, Graph, Node, NodeOutcome, NodeStatus};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryBackoffConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

/// What the attempt loop should do with a handler's outcome.
#[derive(Clone, Debug, PartialEq)]
pub enum AttemptDisposition {
    /// The outcome stands; the stage is settled.
    Settled,
    /// Budget remains; try again after the backoff delay.
    RetryAfter(Duration),
    /// A retry-requested outcome ran out of budget; the stage settles with
    /// the replacement outcome instead.
    Exhausted(NodeOutcome),
}

/// Per-stage retry accounting: the attempt budget, exponential backoff with
/// deterministic jitter, and the `allow_partial` escape hatch for stages
/// whose partial result is acceptable once the budget runs dry.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: RetryBackoffConfig,
    accept_partial_on_exhaustion: bool,
    jitter_seed: u64,
}

impl RetryPolicy {
    /// Node `max_retries` wins over the graph's `default_max_retry`; both
    /// default to zero, meaning a single attempt.
    pub fn for_node(
        node: &Node,
        graph: &Graph,
        backoff: RetryBackoffConfig,
        jitter_seed: u64,
    ) -> Self {
        let max_retries = node
            .attrs
            .get_i64("max_retries")
            .or_else(|| graph.attrs.get_i64("default_max_retry"))
            .unwrap_or(0)
            .clamp(0, u32::MAX as i64 - 1) as u32;

        Self {
            max_attempts: max_retries + 1,
            backoff,
            accept_partial_on_exhaustion: node.attrs.get_bool("allow_partial") == Some(true),
            jitter_seed,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn disposition(&self, outcome: &NodeOutcome, attempt: u32) -> AttemptDisposition {
        match outcome.status {
            NodeStatus::Success | NodeStatus::PartialSuccess | NodeStatus::Cancelled => {
                AttemptDisposition::Settled
            }
            NodeStatus::Retry | NodeStatus::Fail if attempt < self.max_attempts => {
                AttemptDisposition::RetryAfter(self.delay(attempt))
            }
            NodeStatus::Retry => AttemptDisposition::Exhausted(self.exhausted_outcome()),
            // a final failure stands as the handler reported it
            NodeStatus::Fail => AttemptDisposition::Settled,
        }
    }

    fn exhausted_outcome(&self) -> NodeOutcome {
        if self.accept_partial_on_exhaustion {
            let mut outcome = NodeOutcome::with_status(NodeStatus::PartialSuccess);
            outcome.notes = Some("retry budget exhausted; partial result accepted".to_string());
            return outcome;
        }
        NodeOutcome::failure_with_class("retry budget exhausted", FailureClass::StageError)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let raw = (self.backoff.initial_delay_ms as f64) * self.backoff.backoff_factor.powi(exponent);
        let mut capped = raw.min(self.backoff.max_delay_ms as f64);
        if self.backoff.jitter {
            capped *= self.jitter_factor(attempt);
        }
        Duration::from_millis(capped.round().max(0.0) as u64)
    }

    // splitmix-style mix of (seed, attempt) onto [0.5, 1.5); deterministic
    // so tests can pin timing bounds
    fn jitter_factor(&self, attempt: u32) -> f64 {
        let mut z = self.jitter_seed ^ 0x9E3779B97F4A7C15u64.wrapping_mul(u64::from(attempt) + 1);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^= z >> 31;
        0.5 + (z >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Stable per-(run, node) seed so a given stage jitters the same way on
/// every attempt of the same run.
pub fn stage_jitter_seed(run_id: &str, node_id: &str) -> u64 {
    let mut seed = 0x243F6A8885A308D3u64;
    for byte in run_id.bytes().chain([b'\n']).chain(node_id.bytes()) {
        seed = seed.rotate_left(7) ^ u64::from(byte).wrapping_mul(0x100000001B3);
    }
    seed
}
