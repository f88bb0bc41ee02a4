use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use relay_core::{
    AgentId, MemorySnapshot, MemoryStore, OrchestrationEvent, PresentationSink, SessionId,
    Strategy, TurnStatus,
};
use relay_settings::RelaySettings;
use relay_telemetry::MetricsRecorder;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::coordinator::{build_coordinator, Coordinator, CoordinatorDeps, TurnContext, TurnOutput};
use crate::error::OrchestrationError;
use crate::executor::ExecutionRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Archived,
}

/// One completed turn as remembered by the session.
#[derive(Clone, Debug, Serialize)]
pub struct TranscriptEntry {
    pub turn: u32,
    pub query: String,
    pub response: String,
    pub status: TurnStatus,
    pub error_kind: Option<String>,
    pub agents: Vec<AgentId>,
    pub at: DateTime<Utc>,
}

/// Result of [`Session::submit`]. A failed turn still carries whatever the
/// agents streamed before the failure, followed by a marked notice.
#[derive(Clone, Debug)]
pub struct TurnResponse {
    pub turn: u32,
    pub text: String,
    pub status: TurnStatus,
    pub executions: Vec<ExecutionRecord>,
    pub error: Option<OrchestrationError>,
}

impl TurnResponse {
    pub fn is_success(&self) -> bool {
        self.status == TurnStatus::Completed
    }
}

/// A conversation: memory that persists across turns, a transcript and the
/// coordinator chosen at creation.
pub struct Session {
    id: SessionId,
    memory: MemoryStore,
    transcript: Vec<TranscriptEntry>,
    coordinator: Arc<dyn Coordinator>,
    turns: u32,
    state: SessionState,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Session {
    pub fn new(id: SessionId, coordinator: Arc<dyn Coordinator>, memory: MemoryStore) -> Self {
        Self {
            id,
            memory,
            transcript: Vec::new(),
            coordinator,
            turns: 0,
            state: SessionState::Active,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn strategy(&self) -> Strategy {
        self.coordinator.strategy()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        self.memory.snapshot()
    }

    pub fn archive(&mut self) {
        self.state = SessionState::Archived;
    }

    /// Run one turn. Only fails outright when the session is archived; every
    /// orchestration failure is folded into the response.
    #[instrument(skip_all, fields(session_id = %self.id, turn = self.turns + 1))]
    pub async fn submit(
        &mut self,
        query: &str,
        sink: &dyn PresentationSink,
        cancel: &CancellationToken,
    ) -> Result<TurnResponse, OrchestrationError> {
        if self.state == SessionState::Archived {
            return Err(OrchestrationError::SessionArchived(self.id.clone()));
        }

        self.turns += 1;
        let turn = self.turns;
        let strategy = self.coordinator.strategy();
        sink.on_event(&OrchestrationEvent::TurnStart {
            session_id: self.id.clone(),
            turn,
            strategy,
        });

        let mut output = TurnOutput::default();
        let result = {
            let mut ctx = TurnContext {
                session_id: &self.id,
                turn,
                query,
                memory: &mut self.memory,
                sink,
                output: &mut output,
                cancel,
            };
            self.coordinator.run_turn(&mut ctx).await
        };

        let mut text = output.text();
        let (status, error) = match result {
            Ok(()) => (TurnStatus::Completed, None),
            Err(err) => {
                let (status, marker) = if err.is_cancelled() {
                    (TurnStatus::Cancelled, "[turn cancelled]")
                } else {
                    (TurnStatus::Failed, "[turn failed]")
                };
                warn!(error_kind = err.error_kind(), error = %err, "turn failed");
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(marker);
                text.push(' ');
                text.push_str(&err.user_notice());
                (status, Some(err))
            }
        };

        let error_message = error.as_ref().map(ToString::to_string);
        sink.on_done(status, error_message.as_deref());

        info!(status = ?status, agents = output.executions.len(), "turn done");
        if let Some(metrics) = &self.metrics {
            let status_label = match status {
                TurnStatus::Completed => "completed",
                TurnStatus::Failed => "failed",
                TurnStatus::Cancelled => "cancelled",
            };
            metrics.counter_inc(
                "turns_total",
                &[("strategy", strategy.as_str()), ("status", status_label)],
                1,
            );
        }

        self.transcript.push(TranscriptEntry {
            turn,
            query: query.to_string(),
            response: text.clone(),
            status,
            error_kind: error.as_ref().map(|e| e.error_kind().to_string()),
            agents: output.agents(),
            at: Utc::now(),
        });

        Ok(TurnResponse {
            turn,
            text,
            status,
            executions: output.executions,
            error,
        })
    }
}

/// What remains of a session after [`SessionManager::archive`].
#[derive(Clone, Debug, Serialize)]
pub struct ArchivedSession {
    pub session_id: SessionId,
    pub strategy: Strategy,
    pub turns: u32,
    pub transcript: Vec<TranscriptEntry>,
    pub memory: MemorySnapshot,
}

/// Owns every live session. Sessions run concurrently with each other; turns
/// within one session are serialized by its lock.
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    archived: DashSet<SessionId>,
    deps: CoordinatorDeps,
}

impl SessionManager {
    pub fn new(deps: CoordinatorDeps) -> Self {
        Self {
            sessions: DashMap::new(),
            archived: DashSet::new(),
            deps,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.deps.settings
    }

    /// Create an empty session. `None` uses the configured default strategy.
    pub fn create(&self, strategy: Option<Strategy>) -> SessionId {
        let memory = MemoryStore::with_audit_capacity(self.deps.settings.memory.audit_capacity);
        self.insert(strategy, memory)
    }

    /// Create a session whose memory starts from an exported snapshot.
    pub fn resume(&self, strategy: Option<Strategy>, snapshot: &MemorySnapshot) -> SessionId {
        let memory = MemoryStore::from_snapshot(snapshot, self.deps.settings.memory.audit_capacity);
        self.insert(strategy, memory)
    }

    fn insert(&self, strategy: Option<Strategy>, memory: MemoryStore) -> SessionId {
        let strategy = strategy.unwrap_or(self.deps.settings.session.default_strategy);
        let id = SessionId::new();
        let coordinator = build_coordinator(strategy, self.deps.clone());
        let session = Session::new(id.clone(), coordinator, memory)
            .with_metrics(self.deps.metrics.clone());
        self.sessions.insert(id.clone(), Arc::new(Mutex::new(session)));
        info!(session_id = %id, %strategy, "session created");
        self.update_gauge();
        id
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub async fn submit(
        &self,
        id: &SessionId,
        query: &str,
        sink: &dyn PresentationSink,
        cancel: &CancellationToken,
    ) -> Result<TurnResponse, OrchestrationError> {
        let session = self.lookup(id)?;
        let mut session = session.lock().await;
        session.submit(query, sink, cancel).await
    }

    /// Close a session. Waits for an in-flight turn to finish first.
    pub async fn archive(&self, id: &SessionId) -> Result<ArchivedSession, OrchestrationError> {
        let session = self.lookup(id)?;
        let mut session = session.lock().await;
        session.archive();
        self.sessions.remove(id);
        self.archived.insert(id.clone());
        self.update_gauge();
        info!(session_id = %id, turns = session.turns(), "session archived");

        Ok(ArchivedSession {
            session_id: id.clone(),
            strategy: session.strategy(),
            turns: session.turns(),
            transcript: session.transcript().to_vec(),
            memory: session.snapshot(),
        })
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    fn lookup(&self, id: &SessionId) -> Result<Arc<Mutex<Session>>, OrchestrationError> {
        if let Some(session) = self.get(id) {
            return Ok(session);
        }
        if self.archived.contains(id) {
            Err(OrchestrationError::SessionArchived(id.clone()))
        } else {
            Err(OrchestrationError::SessionNotFound(id.clone()))
        }
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.deps.metrics {
            metrics.gauge_set("active_sessions", &[], self.sessions.len() as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use relay_core::mock::{MockSelector, RecordingSink, ScriptedAgent};
    use relay_core::{AgentDescriptor, AgentError, NullSink};
    use serde_json::json;

    use super::*;
    use crate::registry::AgentRegistry;

    fn pipeline_registry() -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        for (id, purpose, requires, provides) in [
            ("lister", "list tables", vec![], vec!["tables"]),
            ("querier", "query data", vec!["tables"], vec!["result"]),
            ("charter", "draw chart", vec!["result"], vec!["chart"]),
        ] {
            registry
                .register(
                    AgentDescriptor::new(
                        id,
                        purpose,
                        Arc::new(ScriptedAgent::providing(id, &provides)),
                    )
                    .requires(requires)
                        .provides(provides),
                )
                .unwrap();
        }
        registry
    }

    fn manager_with(
        registry: AgentRegistry,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> SessionManager {
        let selector = MockSelector::new()
            .route("chart", "draw chart", 0.9)
            .route("tables", "list tables", 0.9)
            .decompose_into(["list tables", "chart it"]);
        SessionManager::new(
            CoordinatorDeps::new(
                Arc::new(registry),
                Arc::new(selector),
                Arc::new(RelaySettings::default()),
            )
            .with_metrics(metrics),
        )
    }

    fn manager() -> SessionManager {
        manager_with(pipeline_registry(), None)
    }

    #[tokio::test]
    async fn successful_turn_aggregates_sub_agent_output() {
        let manager = manager();
        let id = manager.create(None);
        let sink = RecordingSink::new();

        let response = manager
            .submit(&id, "chart revenue", &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.turn, 1);
        assert_eq!(response.text, "lister done\nquerier done\ncharter done");
        assert_eq!(sink.chunk_agents(), vec!["lister", "querier", "charter"]);
        assert_eq!(sink.done(), vec![(TurnStatus::Completed, None)]);
        let types = sink.event_types();
        assert_eq!(types.first(), Some(&"turn_start"));

        let session = manager.get(&id).unwrap();
        let session = session.lock().await;
        assert_eq!(session.transcript().len(), 1);
        assert_eq!(session.transcript()[0].agents.len(), 3);
        assert!(session.memory().has("chart"));
    }

    #[tokio::test]
    async fn memory_persists_across_turns() {
        let manager = manager();
        let id = manager.create(None);
        let cancel = CancellationToken::new();

        manager.submit(&id, "chart one", &NullSink, &cancel).await.unwrap();
        let second = manager.submit(&id, "chart two", &NullSink, &cancel).await.unwrap();

        // requirements met from the first turn, so only the charter runs again
        assert_eq!(second.turn, 2);
        assert_eq!(second.executions.len(), 1);
        assert_eq!(second.executions[0].agent_id.as_str(), "charter");
    }

    #[tokio::test]
    async fn failure_returns_partial_output_and_notice() {
        let mut registry = AgentRegistry::new();
        registry
            .register(
                AgentDescriptor::new(
                    "lister",
                    "list tables",
                    Arc::new(ScriptedAgent::providing("lister", &["tables"])),
                )
                .provides(["tables"]),
            )
            .unwrap();
        registry
            .register(
                AgentDescriptor::new(
                    "charter",
                    "draw chart",
                    Arc::new(
                        ScriptedAgent::new("charter")
                            .emit("drawing")
                            .fail(AgentError::Failed("renderer crashed".into())),
                    ),
                )
                .requires(["tables"])
                .provides(["chart"]),
            )
            .unwrap();
        let manager = manager_with(registry, None);
        let id = manager.create(Some(Strategy::Resolver));
        let sink = RecordingSink::new();

        let response = manager
            .submit(&id, "chart", &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, TurnStatus::Failed);
        assert!(response.text.starts_with("lister done\ndrawing\n[turn failed] "));
        assert!(response.text.contains("renderer crashed"));
        assert_eq!(response.error.as_ref().map(|e| e.error_kind()), Some("agent_failed"));
        let done = sink.done();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0, TurnStatus::Failed);
        assert!(done[0].1.as_deref().is_some_and(|e| e.contains("renderer crashed")));
    }

    #[tokio::test]
    async fn no_candidate_is_never_silent() {
        let manager = manager();
        let id = manager.create(None);
        let response = manager
            .submit(&id, "weather tomorrow", &NullSink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status, TurnStatus::Failed);
        assert_eq!(response.text, "[turn failed] Sorry, I cannot help with that.");
    }

    #[tokio::test]
    async fn planner_strategy_is_fixed_at_creation() {
        let manager = manager();
        let id = manager.create(Some(Strategy::Planner));
        let response = manager
            .submit(&id, "anything", &NullSink, &CancellationToken::new())
            .await
            .unwrap();
        // the planner maps "chart it" to the charter with nothing to provide `result`
        assert_eq!(response.status, TurnStatus::Failed);
        assert_eq!(
            response.error.as_ref().map(|e| e.error_kind()),
            Some("plan_execution_failure")
        );
        let session = manager.get(&id).unwrap();
        assert_eq!(session.lock().await.strategy(), Strategy::Planner);
    }

    #[tokio::test]
    async fn cancelled_turn_is_marked() {
        let manager = manager();
        let id = manager.create(None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let response = manager.submit(&id, "chart", &NullSink, &cancel).await.unwrap();
        assert_eq!(response.status, TurnStatus::Cancelled);
        assert!(response.text.starts_with("[turn cancelled]"));
    }

    #[tokio::test]
    async fn archive_then_submit_is_rejected() {
        let manager = manager();
        let id = manager.create(None);
        manager
            .submit(&id, "chart", &NullSink, &CancellationToken::new())
            .await
            .unwrap();

        let archived = manager.archive(&id).await.unwrap();
        assert_eq!(archived.turns, 1);
        assert_eq!(archived.transcript.len(), 1);
        assert!(archived.memory.has("chart"));
        assert_eq!(manager.active_count(), 0);

        let err = manager
            .submit(&id, "chart", &NullSink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::SessionArchived(_)));

        let err = manager
            .submit(&SessionId::new(), "chart", &NullSink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn archived_session_rejects_direct_submit() {
        let deps = CoordinatorDeps::new(
            Arc::new(pipeline_registry()),
            Arc::new(MockSelector::new()),
            Arc::new(RelaySettings::default()),
        );
        let mut session = Session::new(
            SessionId::new(),
            build_coordinator(Strategy::Resolver, deps),
            MemoryStore::new(),
        );
        session.archive();
        let err = session
            .submit("q", &NullSink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "session_archived");
        assert_eq!(session.turns(), 0);
    }

    #[tokio::test]
    async fn resume_from_snapshot() {
        let manager = manager();
        let first = manager.create(None);
        manager
            .submit(&first, "chart", &NullSink, &CancellationToken::new())
            .await
            .unwrap();
        let archived = manager.archive(&first).await.unwrap();

        let json = archived.memory.to_json().unwrap();
        let snapshot = MemorySnapshot::from_json(&json).unwrap();
        let resumed = manager.resume(None, &snapshot);

        let response = manager
            .submit(&resumed, "chart again", &NullSink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.executions.len(), 1);

        let session = manager.get(&resumed).unwrap();
        let session = session.lock().await;
        let chart = session.memory().entry("chart").unwrap();
        let tables = session.memory().entry("tables").unwrap();
        assert!(chart.version > tables.version);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sessions_are_isolated() {
        let mut registry = AgentRegistry::new();
        registry
            .register(
                AgentDescriptor::new(
                    "charter",
                    "draw chart",
                    Arc::new(
                        ScriptedAgent::new("charter")
                            .delay(Duration::from_millis(50))
                            .provide("chart", json!("png")),
                    ),
                )
                .provides(["chart"]),
            )
            .unwrap();
        let metrics = Arc::new(MetricsRecorder::new());
        let manager = Arc::new(manager_with(registry, Some(Arc::clone(&metrics))));
        let ids: Vec<SessionId> = (0..4).map(|_| manager.create(None)).collect();
        assert_eq!(metrics.gauge_get("active_sessions", &[]), 4.0);

        let runs = ids.iter().map(|id| {
            let manager = Arc::clone(&manager);
            let id = id.clone();
            async move {
                manager
                    .submit(&id, "chart", &NullSink, &CancellationToken::new())
                    .await
            }
        });
        let responses = futures::future::join_all(runs).await;

        for response in responses {
            assert!(response.unwrap().is_success());
        }
        for id in &ids {
            let session = manager.get(id).unwrap();
            let session = session.lock().await;
            assert_eq!(session.memory().len(), 1);
            assert_eq!(session.memory().entry("chart").unwrap().version, 1);
        }
        assert_eq!(
            metrics.counter_get(
                "turns_total",
                &[("strategy", "resolver"), ("status", "completed")]
            ),
            4
        );
    }

    #[test]
    fn create_uses_default_strategy() {
        let manager = manager();
        let id = manager.create(None);
        assert_eq!(manager.active_count(), 1);
        let session = manager.get(&id).unwrap();
        let session = session.try_lock().unwrap();
        assert_eq!(session.strategy(), Strategy::Resolver);
        assert_eq!(session.state(), SessionState::Active);
    }
}
