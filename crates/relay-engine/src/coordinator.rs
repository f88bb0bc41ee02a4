use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{
    AgentId, MemoryStore, OrchestrationEvent, PresentationSink, SessionId, Selector, Strategy,
};
use relay_settings::RelaySettings;
use relay_telemetry::MetricsRecorder;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::OrchestrationError;
use crate::executor::{AgentExecutor, ExecutionRecord};
use crate::planner::PlannerCoordinator;
use crate::registry::AgentRegistry;
use crate::resolver::ResolverCoordinator;

/// One streamed fragment, attributed to the agent that produced it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Chunk {
    pub agent_id: AgentId,
    pub text: String,
}

/// Everything a turn produced so far. Survives coordinator failures so the
/// session can return partial output.
#[derive(Clone, Debug, Default)]
pub struct TurnOutput {
    pub chunks: Vec<Chunk>,
    pub executions: Vec<ExecutionRecord>,
}

impl TurnOutput {
    pub fn push_chunk(&mut self, agent_id: AgentId, text: String) {
        self.chunks.push(Chunk { agent_id, text });
    }

    /// Chunks concatenated in arrival order. A line break is inserted where
    /// the producing agent changes and the previous chunk did not end one.
    pub fn text(&self) -> String {
        let mut out = String::new();
        let mut last: Option<&AgentId> = None;
        for chunk in &self.chunks {
            let agent_changed = last.is_some_and(|a| a != &chunk.agent_id);
            if agent_changed && !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&chunk.text);
            last = Some(&chunk.agent_id);
        }
        out
    }

    /// Agents in the order they were executed.
    pub fn agents(&self) -> Vec<AgentId> {
        self.executions.iter().map(|e| e.agent_id.clone()).collect()
    }
}

/// Per-turn state handed to a coordinator.
pub struct TurnContext<'a> {
    pub session_id: &'a SessionId,
    pub turn: u32,
    pub query: &'a str,
    pub memory: &'a mut MemoryStore,
    pub sink: &'a dyn PresentationSink,
    pub output: &'a mut TurnOutput,
    pub cancel: &'a CancellationToken,
}

impl TurnContext<'_> {
    pub fn emit(&self, event: OrchestrationEvent) {
        self.sink.on_event(&event);
    }

    pub fn check_cancelled(&self) -> Result<(), OrchestrationError> {
        if self.cancel.is_cancelled() {
            Err(OrchestrationError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Turns one user query into a sequence of agent executions.
#[async_trait]
pub trait Coordinator: Send + Sync {
    fn strategy(&self) -> Strategy;

    async fn run_turn(&self, ctx: &mut TurnContext<'_>) -> Result<(), OrchestrationError>;
}

/// Shared, read-only collaborators of every coordinator.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub registry: Arc<AgentRegistry>,
    pub selector: Arc<dyn Selector>,
    pub executor: Arc<AgentExecutor>,
    pub settings: Arc<RelaySettings>,
    pub metrics: Option<Arc<MetricsRecorder>>,
}

impl CoordinatorDeps {
    pub fn new(
        registry: Arc<AgentRegistry>,
        selector: Arc<dyn Selector>,
        settings: Arc<RelaySettings>,
    ) -> Self {
        let executor = Arc::new(AgentExecutor::new((&*settings).into()));
        Self {
            registry,
            selector,
            executor,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.executor = Arc::new(
            AgentExecutor::new(self.executor.config().clone()).with_metrics(metrics.clone()),
        );
        self.metrics = metrics;
        self
    }
}

pub fn build_coordinator(strategy: Strategy, deps: CoordinatorDeps) -> Arc<dyn Coordinator> {
    match strategy {
        Strategy::Resolver => Arc::new(ResolverCoordinator::new(deps)),
        Strategy::Planner => Arc::new(PlannerCoordinator::new(deps)),
    }
}

#[cfg(test)]
mod tests {
    use relay_core::LexicalSelector;

    use super::*;

    fn chunk(agent: &str, text: &str) -> Chunk {
        Chunk {
            agent_id: AgentId::from(agent),
            text: text.into(),
        }
    }

    #[test]
    fn text_breaks_lines_between_agents() {
        let output = TurnOutput {
            chunks: vec![
                chunk("lister", "found "),
                chunk("lister", "2 tables"),
                chunk("querier", "3 rows\n"),
                chunk("charter", "chart ready"),
            ],
            executions: Vec::new(),
        };
        assert_eq!(output.text(), "found 2 tables\n3 rows\nchart ready");
    }

    #[test]
    fn empty_output_is_empty_text() {
        assert_eq!(TurnOutput::default().text(), "");
    }

    #[test]
    fn build_coordinator_matches_strategy() {
        let deps = CoordinatorDeps::new(
            Arc::new(AgentRegistry::new()),
            Arc::new(LexicalSelector::new()),
            Arc::new(RelaySettings::default()),
        );
        assert_eq!(
            build_coordinator(Strategy::Resolver, deps.clone()).strategy(),
            Strategy::Resolver
        );
        assert_eq!(build_coordinator(Strategy::Planner, deps).strategy(), Strategy::Planner);
    }
}
