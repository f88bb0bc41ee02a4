use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::broadcast;

use crate::events::{OrchestrationEvent, TurnStatus};
use crate::ids::{AgentId, SessionId};

/// Where a turn's output goes while it is produced.
///
/// `on_chunk` is called once per fragment, in execution order, including
/// fragments from agents resolved on behalf of others. `on_done` is called
/// exactly once per turn, last.
pub trait PresentationSink: Send + Sync {
    fn on_chunk(&self, agent_id: &AgentId, text: &str);

    fn on_done(&self, status: TurnStatus, error: Option<&str>);

    /// Lifecycle events other than chunks and turn completion.
    fn on_event(&self, _event: &OrchestrationEvent) {}
}

/// Drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl PresentationSink for NullSink {
    fn on_chunk(&self, _agent_id: &AgentId, _text: &str) {}
    fn on_done(&self, _status: TurnStatus, _error: Option<&str>) {}
}

/// Republishes every callback as an [`OrchestrationEvent`] on a broadcast
/// channel, for transports that fan out to several subscribers.
pub struct BroadcastSink {
    session_id: SessionId,
    turn: AtomicU32,
    tx: broadcast::Sender<OrchestrationEvent>,
}

impl BroadcastSink {
    pub fn new(session_id: SessionId, tx: broadcast::Sender<OrchestrationEvent>) -> Self {
        Self {
            session_id,
            turn: AtomicU32::new(0),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: OrchestrationEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!(session_id = %self.session_id, "no event receivers, event dropped");
        }
    }
}

impl PresentationSink for BroadcastSink {
    fn on_chunk(&self, agent_id: &AgentId, text: &str) {
        self.send(OrchestrationEvent::Chunk {
            session_id: self.session_id.clone(),
            agent_id: agent_id.clone(),
            text: text.to_string(),
        });
    }

    fn on_done(&self, status: TurnStatus, error: Option<&str>) {
        self.send(OrchestrationEvent::TurnDone {
            session_id: self.session_id.clone(),
            turn: self.turn.load(Ordering::Relaxed),
            status,
            error: error.map(String::from),
        });
    }

    fn on_event(&self, event: &OrchestrationEvent) {
        if let OrchestrationEvent::TurnStart { turn, .. } = event {
            self.turn.store(*turn, Ordering::Relaxed);
        }
        self.send(event.clone());
    }
}
