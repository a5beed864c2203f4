use crate::{AttractorError, UsageMetrics};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Tools whose execution mutates the workspace. A protocol retry would
/// replay their side effects, so retries are refused once one has run.
pub const MUTATING_TOOLS: &[&str] = &["bash", "edit", "write"];

/// Phrase the session layer stamps into a message when a queued user input
/// cancelled an in-flight tool call, orphaning its result.
pub const TOOL_RESULT_SKIPPED_MARKER: &str = "tool call was cancelled by a queued user message";

#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    BeforeStart,
    Text { text: String },
    ToolStart { tool: String },
    ToolEnd { tool: String },
    End,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentRole {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentMessage {
    pub role: AgentRole,
    pub text: String,
    pub tool_name: Option<String>,
}

impl AgentMessage {
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: AgentRole::Assistant,
            text: text.into(),
            tool_name: None,
        }
    }

    pub fn assistant_tool(tool: impl Into<String>) -> Self {
        Self {
            role: AgentRole::Assistant,
            text: String::new(),
            tool_name: Some(tool.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: AgentRole::User,
            text: text.into(),
            tool_name: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ToolMode {
    None,
    ReadOnly,
    #[default]
    Coding,
}

impl ToolMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ReadOnly => "read-only",
            Self::Coding => "coding",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "read-only" | "readonly" => Some(Self::ReadOnly),
            "coding" => Some(Self::Coding),
            _ => None,
        }
    }
}

/// Model, provider, reasoning, and tool allowlist state the backend swaps in
/// around a stage and restores afterwards.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionOverrides {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub reasoning_effort: Option<String>,
    pub tool_mode: Option<ToolMode>,
}

/// The external agent-session abstraction the backend drives. `subscribe`
/// replaces the event subscription, so events from a previous attempt never
/// leak into the next one.
#[async_trait]
pub trait AgentSession: Send {
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<AgentEvent>;

    async fn wait_idle(&mut self) -> Result<(), AttractorError>;

    async fn send_followup(&mut self, prompt: String) -> Result<(), AttractorError>;

    fn message_trace(&self) -> Vec<AgentMessage>;

    fn last_usage(&self) -> Option<UsageMetrics>;

    fn overrides(&self) -> SessionOverrides;

    fn apply_overrides(&mut self, overrides: &SessionOverrides);

    async fn dispose(&mut self);
}

/// One scripted agent turn: the events the session streams, the message
/// trace it leaves behind, and the usage it reports.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTurn {
    pub events: Vec<AgentEvent>,
    pub trace: Vec<AgentMessage>,
    pub usage: Option<UsageMetrics>,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            events: vec![
                AgentEvent::BeforeStart,
                AgentEvent::Text { text: text.clone() },
                AgentEvent::End,
            ],
            trace: vec![AgentMessage::assistant(text)],
            usage: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            events: vec![AgentEvent::BeforeStart, AgentEvent::End],
            trace: Vec::new(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: UsageMetrics) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_trace(mut self, trace: Vec<AgentMessage>) -> Self {
        self.trace = trace;
        self
    }

    /// A turn whose stream never reports the end event; exercises the
    /// completion latch timeout.
    pub fn without_end(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            events: vec![
                AgentEvent::BeforeStart,
                AgentEvent::Text { text: text.clone() },
            ],
            trace: vec![AgentMessage::assistant(text)],
            usage: None,
        }
    }
}

/// Counters shared with tests after the session moves into the backend.
#[derive(Clone, Default)]
pub struct ScriptedSessionHandle {
    submits: Arc<AtomicUsize>,
    disposals: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<String>>>,
    overrides_log: Arc<Mutex<Vec<SessionOverrides>>>,
}

impl ScriptedSessionHandle {
    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn disposal_count(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts mutex should lock").clone()
    }

    pub fn overrides_log(&self) -> Vec<SessionOverrides> {
        self.overrides_log
            .lock()
            .expect("overrides mutex should lock")
            .clone()
    }
}

/// In-process session that replays scripted turns; the standard test double
/// and the engine's mock backend.
pub struct ScriptedSession {
    turns: VecDeque<ScriptedTurn>,
    sender: Option<mpsc::UnboundedSender<AgentEvent>>,
    trace: Vec<AgentMessage>,
    last_usage: Option<UsageMetrics>,
    overrides: SessionOverrides,
    handle: ScriptedSessionHandle,
}

impl ScriptedSession {
    pub fn new<I>(turns: I) -> Self
    where
        I: IntoIterator<Item = ScriptedTurn>,
    {
        Self {
            turns: turns.into_iter().collect(),
            sender: None,
            trace: Vec::new(),
            last_usage: None,
            overrides: SessionOverrides::default(),
            handle: ScriptedSessionHandle::default(),
        }
    }

    pub fn handle(&self) -> ScriptedSessionHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl AgentSession for ScriptedSession {
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.sender = Some(sender);
        receiver
    }

    async fn wait_idle(&mut self) -> Result<(), AttractorError> {
        Ok(())
    }

    async fn send_followup(&mut self, prompt: String) -> Result<(), AttractorError> {
        self.handle.submits.fetch_add(1, Ordering::SeqCst);
        self.handle
            .prompts
            .lock()
            .expect("prompts mutex should lock")
            .push(prompt.clone());

        let turn = self.turns.pop_front().unwrap_or_else(ScriptedTurn::empty);
        self.trace = vec![AgentMessage::user(prompt)];
        self.trace.extend(turn.trace);
        self.last_usage = turn.usage;
        if let Some(sender) = self.sender.as_ref() {
            for event in turn.events {
                let _ = sender.send(event);
            }
        }
        Ok(())
    }

    fn message_trace(&self) -> Vec<AgentMessage> {
        self.trace.clone()
    }

    fn last_usage(&self) -> Option<UsageMetrics> {
        self.last_usage
    }

    fn overrides(&self) -> SessionOverrides {
        self.overrides.clone()
    }

    fn apply_overrides(&mut self, overrides: &SessionOverrides) {
        self.overrides = overrides.clone();
        self.handle
            .overrides_log
            .lock()
            .expect("overrides mutex should lock")
            .push(overrides.clone());
    }

    async fn dispose(&mut self) {
        self.handle.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn scripted_session_streams_turn_events_to_subscriber() {
        let mut session = ScriptedSession::new([ScriptedTurn::text("hello")]);
        let mut receiver = session.subscribe();
        session
            .send_followup("prompt".to_string())
            .await
            .expect("followup should send");

        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert_eq!(events.last(), Some(&AgentEvent::End));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scripted_session_resubscribe_drops_old_channel() {
        let mut session = ScriptedSession::new([
            ScriptedTurn::text("first"),
            ScriptedTurn::text("second"),
        ]);
        let mut first = session.subscribe();
        session
            .send_followup("one".to_string())
            .await
            .expect("followup should send");
        while first.try_recv().is_ok() {}

        let mut second = session.subscribe();
        session
            .send_followup("two".to_string())
            .await
            .expect("followup should send");

        // the first receiver sees nothing from the second attempt
        assert!(first.try_recv().is_err());
        let mut texts = Vec::new();
        while let Ok(event) = second.try_recv() {
            if let AgentEvent::Text { text } = event {
                texts.push(text);
            }
        }
        assert_eq!(texts, vec!["second".to_string()]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scripted_session_handle_counts_submits_and_disposals() {
        let mut session = ScriptedSession::new([ScriptedTurn::text("hi")]);
        let handle = session.handle();
        session.subscribe();
        session
            .send_followup("prompt".to_string())
            .await
            .expect("followup should send");
        session.dispose().await;

        assert_eq!(handle.submit_count(), 1);
        assert_eq!(handle.disposal_count(), 1);
        assert_eq!(handle.prompts(), vec!["prompt".to_string()]);
    }
}
