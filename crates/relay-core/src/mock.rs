//! Deterministic doubles for orchestration tests: scripted agents, a rule-based
//! selector and a sink that records everything it is handed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::agent::{Agent, AgentContext};
use crate::errors::AgentError;
use crate::events::{OrchestrationEvent, TurnStatus};
use crate::ids::AgentId;
use crate::selector::Selector;
use crate::sink::PresentationSink;

/// Shared log of agent start order.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// One pre-programmed action of a [`ScriptedAgent`].
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Emit(String),
    Provide(String, Value),
    /// Sleep, returning `Cancelled` if the run is cancelled meanwhile.
    Delay(Duration),
    /// Block until cancelled.
    Hang,
    Require(String),
    Fail(AgentError),
    Panic(String),
}

/// Agent that replays a fixed script.
pub struct ScriptedAgent {
    name: String,
    steps: Vec<ScriptStep>,
    journal: Option<Journal>,
}

impl ScriptedAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            journal: None,
        }
    }

    /// Convenience: emit one line, then provide each key with a string value.
    pub fn providing(name: &str, keys: &[&str]) -> Self {
        let mut agent = Self::new(name).emit(format!("{name} done"));
        for key in keys {
            agent = agent.provide(*key, Value::String(format!("{key} from {name}")));
        }
        agent
    }

    pub fn emit(mut self, text: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Emit(text.into()));
        self
    }

    pub fn provide(mut self, key: impl Into<String>, value: Value) -> Self {
        self.steps.push(ScriptStep::Provide(key.into(), value));
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Delay(duration));
        self
    }

    pub fn hang(mut self) -> Self {
        self.steps.push(ScriptStep::Hang);
        self
    }

    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Require(key.into()));
        self
    }

    pub fn fail(mut self, error: AgentError) -> Self {
        self.steps.push(ScriptStep::Fail(error));
        self
    }

    pub fn panic(mut self, message: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Panic(message.into()));
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn execute(&self, ctx: &mut AgentContext) -> Result<(), AgentError> {
        if let Some(journal) = &self.journal {
            journal.lock().push(self.name.clone());
        }

        for step in &self.steps {
            match step {
                ScriptStep::Emit(text) => ctx.emit(text.clone()).await?,
                ScriptStep::Provide(key, value) => ctx.provide(key.clone(), value.clone()).await?,
                ScriptStep::Delay(duration) => {
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(*duration) => {}
                    }
                }
                ScriptStep::Hang => {
                    ctx.cancelled().await;
                    return Err(AgentError::Cancelled);
                }
                ScriptStep::Require(key) => {
                    ctx.require(key)?;
                }
                ScriptStep::Fail(error) => return Err(error.clone()),
                ScriptStep::Panic(message) => panic!("{message}"),
            }
        }
        Ok(())
    }
}

/// Rule-based selector: a rule fires when the query contains its needle and
/// the purpose matches exactly.
#[derive(Clone, Debug, Default)]
pub struct MockSelector {
    rules: Vec<(String, String, f64)>,
    decomposition: Option<Vec<String>>,
    default_score: f64,
}

impl MockSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(
        mut self,
        needle: impl Into<String>,
        purpose: impl Into<String>,
        score: f64,
    ) -> Self {
        self.rules.push((needle.into(), purpose.into(), score));
        self
    }

    pub fn decompose_into<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.decomposition = Some(steps.into_iter().map(Into::into).collect());
        self
    }

    pub fn default_score(mut self, score: f64) -> Self {
        self.default_score = score;
        self
    }
}

impl Selector for MockSelector {
    fn score(&self, query: &str, purpose: &str) -> f64 {
        self.rules
            .iter()
            .filter(|(needle, p, _)| query.contains(needle.as_str()) && p == purpose)
            .map(|(_, _, score)| *score)
            .fold(self.default_score, f64::max)
    }

    fn decompose(&self, query: &str) -> Vec<String> {
        self.decomposition
            .clone()
            .unwrap_or_else(|| vec![query.to_string()])
    }
}

/// Sink that keeps every callback for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    chunks: Mutex<Vec<(AgentId, String)>>,
    done: Mutex<Vec<(TurnStatus, Option<String>)>>,
    events: Mutex<Vec<OrchestrationEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> Vec<(AgentId, String)> {
        self.chunks.lock().clone()
    }

    pub fn chunk_agents(&self) -> Vec<String> {
        self.chunks.lock().iter().map(|(a, _)| a.to_string()).collect()
    }

    pub fn done(&self) -> Vec<(TurnStatus, Option<String>)> {
        self.done.lock().clone()
    }

    pub fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.lock().clone()
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event_type()).collect()
    }
}

impl PresentationSink for RecordingSink {
    fn on_chunk(&self, agent_id: &AgentId, text: &str) {
        self.chunks.lock().push((agent_id.clone(), text.to_string()));
    }

    fn on_done(&self, status: TurnStatus, error: Option<&str>) {
        self.done.lock().push((status, error.map(String::from)));
    }

    fn on_event(&self, event: &OrchestrationEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_selector_rules() {
        let s = MockSelector::new()
            .route("chart", "draw charts", 0.9)
            .route("chart", "list tables", 0.1)
            .default_score(0.05);

        assert_eq!(s.score("chart revenue", "draw charts"), 0.9);
        assert_eq!(s.score("chart revenue", "list tables"), 0.1);
        assert_eq!(s.score("hello", "draw charts"), 0.05);
    }

    #[test]
    fn mock_selector_decomposition() {
        let s = MockSelector::new();
        assert_eq!(s.decompose("whole"), vec!["whole"]);
        let s = s.decompose_into(["a", "b"]);
        assert_eq!(s.decompose("whole"), vec!["a", "b"]);
    }

    #[test]
    fn recording_sink_records() {
        let sink = RecordingSink::new();
        sink.on_chunk(&AgentId::from("lister"), "x");
        sink.on_done(TurnStatus::Completed, None);
        assert_eq!(sink.chunk_agents(), vec!["lister"]);
        assert_eq!(sink.done(), vec![(TurnStatus::Completed, None)]);
        assert!(sink.events().is_empty());
    }
}
