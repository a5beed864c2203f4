use crate::AttractorError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

pub type RuntimeContext = BTreeMap<String, Value>;

const MAX_KEY_LENGTH: usize = 256;

/// Key holding the accumulated structured review findings. Updates to this
/// key append instead of overwrite.
pub const REVIEW_FINDINGS_KEY: &str = "review.findings";

const GENEROUS_SUMMARY_BUDGET: usize = 2_000;
const SHORT_SUMMARY_BUDGET: usize = 160;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub values: RuntimeContext,
    pub logs: Vec<String>,
}

/// Process-local run state. Owned by the execution loop; handlers see a
/// snapshot and feed writes back through their outcome's `context_updates`.
#[derive(Clone, Default)]
pub struct ContextStore {
    inner: Arc<RwLock<ContextState>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct ContextState {
    values: RuntimeContext,
    logs: Vec<String>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: RuntimeContext) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ContextState {
                values,
                logs: Vec::new(),
            })),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<(), AttractorError> {
        let key = key.into();
        validate_context_key(&key)?;
        let mut state = self
            .inner
            .write()
            .map_err(|_| AttractorError::Runtime("context write lock poisoned".to_string()))?;
        state.values.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, AttractorError> {
        let state = self
            .inner
            .read()
            .map_err(|_| AttractorError::Runtime("context read lock poisoned".to_string()))?;
        Ok(state.values.get(key).cloned())
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>, AttractorError> {
        Ok(self.get(key)?.and_then(|value| match value {
            Value::String(inner) => Some(inner),
            other => Some(other.to_string()),
        }))
    }

    /// Merge updates into the store; later writes win, except
    /// `review.findings`, which accumulates array elements.
    pub fn apply_updates(&self, updates: &RuntimeContext) -> Result<(), AttractorError> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut state = self
            .inner
            .write()
            .map_err(|_| AttractorError::Runtime("context write lock poisoned".to_string()))?;
        for (key, value) in updates {
            validate_context_key(key)?;
            if key == REVIEW_FINDINGS_KEY {
                let merged = match (state.values.get(key), value) {
                    (Some(Value::Array(existing)), Value::Array(incoming)) => {
                        let mut merged = existing.clone();
                        merged.extend(incoming.iter().cloned());
                        Value::Array(merged)
                    }
                    _ => value.clone(),
                };
                state.values.insert(key.clone(), merged);
                continue;
            }
            state.values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), AttractorError> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| AttractorError::Runtime("context write lock poisoned".to_string()))?;
        state.values.remove(key);
        Ok(())
    }

    pub fn append_log(&self, entry: impl Into<String>) -> Result<(), AttractorError> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| AttractorError::Runtime("context write lock poisoned".to_string()))?;
        state.logs.push(entry.into());
        Ok(())
    }

    pub fn snapshot(&self) -> Result<ContextSnapshot, AttractorError> {
        let state = self
            .inner
            .read()
            .map_err(|_| AttractorError::Runtime("context read lock poisoned".to_string()))?;
        Ok(ContextSnapshot {
            values: state.values.clone(),
            logs: state.logs.clone(),
        })
    }
}

/// Keys with an underscore-prefixed segment are internal plumbing
/// (`plan._full_response`, `_scratch`) and never reach prompt summaries.
pub fn is_hidden_key(key: &str) -> bool {
    key.split('.').any(|segment| segment.starts_with('_'))
}

/// Render the context for inclusion in an LLM prompt. Response and feedback
/// keys get a generous character budget; everything else a short one.
/// `review.findings` renders as a structured list.
pub fn render_context_summary(values: &RuntimeContext) -> String {
    let mut out = String::new();

    for (key, value) in values {
        if is_hidden_key(key) || key.starts_with("internal.") {
            continue;
        }
        if key == REVIEW_FINDINGS_KEY {
            if let Value::Array(findings) = value {
                if !findings.is_empty() {
                    let _ = writeln!(out, "{key}:");
                    for finding in findings {
                        let _ = writeln!(out, "{}", render_finding(finding));
                    }
                }
            }
            continue;
        }

        let budget = if is_generous_key(key) {
            GENEROUS_SUMMARY_BUDGET
        } else {
            SHORT_SUMMARY_BUDGET
        };
        let rendered = match value {
            Value::String(inner) => inner.clone(),
            other => other.to_string(),
        };
        let _ = writeln!(out, "{key}: {}", truncate_chars(&rendered, budget));
    }

    out
}

fn is_generous_key(key: &str) -> bool {
    let last = key.rsplit('.').next().unwrap_or(key);
    last.contains("response") || last.contains("feedback")
}

fn render_finding(finding: &Value) -> String {
    match serde_json::from_value::<ReviewFinding>(finding.clone()) {
        Ok(finding) => {
            let mut line = String::from("  -");
            if let Some(severity) = &finding.severity {
                let _ = write!(line, " [{severity}]");
            }
            if let Some(file) = &finding.file {
                match finding.line {
                    Some(number) => {
                        let _ = write!(line, " {file}:{number}");
                    }
                    None => {
                        let _ = write!(line, " {file}");
                    }
                }
            }
            let _ = write!(line, " {}", finding.message);
            line
        }
        Err(_) => format!("  - {finding}"),
    }
}

fn truncate_chars(input: &str, max_len: usize) -> String {
    if input.chars().count() <= max_len {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max_len).collect();
    out.push_str("...");
    out
}

/// Substitute `$key` references from the context. Unknown identifiers stay
/// verbatim so ordinary shell variables keep working. Text between
/// references is copied as-is, so non-ASCII content survives untouched.
pub fn expand_context_refs(input: &str, context: &RuntimeContext) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(dollar) = rest.find('$') {
        output.push_str(&rest[..dollar]);
        let candidate = &rest[dollar + 1..];
        let key_len = context_ref_len(candidate);
        if key_len == 0 {
            output.push('$');
            rest = candidate;
            continue;
        }

        match context.get(&candidate[..key_len]) {
            Some(value) => {
                output.push_str(&match value {
                    Value::String(inner) => inner.clone(),
                    other => other.to_string(),
                });
                rest = &candidate[key_len..];
            }
            None => {
                output.push('$');
                rest = candidate;
            }
        }
    }

    output.push_str(rest);
    output
}

/// Byte length of the leading key. Key characters are a subset of ASCII, so
/// any other character (including multi-byte ones) terminates the key and
/// the length stays a valid slice boundary.
fn context_ref_len(input: &str) -> usize {
    let mut len = 0;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
            len += 1;
        } else {
            break;
        }
    }
    // a trailing dot punctuates the sentence, it is not part of the key
    while len > 0 && input.as_bytes()[len - 1] == b'.' {
        len -= 1;
    }
    len
}

pub fn validate_context_key(key: &str) -> Result<(), AttractorError> {
    if key.is_empty() {
        return Err(AttractorError::Runtime(
            "context key cannot be empty".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(AttractorError::Runtime(format!(
            "context key '{}' exceeds max length {}",
            key, MAX_KEY_LENGTH
        )));
    }

    for segment in key.split('.') {
        if segment.is_empty() {
            return Err(AttractorError::Runtime(format!(
                "context key '{}' contains an empty namespace segment",
                key
            )));
        }
        let mut chars = segment.chars();
        let first = chars.next().expect("segment is non-empty");
        if !first.is_ascii_alphabetic() && first != '_' {
            return Err(AttractorError::Runtime(format!(
                "context key '{}' has invalid segment '{}'",
                key, segment
            )));
        }
        if chars.any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-')) {
            return Err(AttractorError::Runtime(format!(
                "context key '{}' has invalid segment '{}'",
                key, segment
            )));
        }
    }

    Ok(())
}
