use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, SessionId};

/// Which coordinator drives a session. Fixed when the session is created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Pick one agent and recursively resolve its requirements.
    #[default]
    Resolver,
    /// Decompose first, then run a fixed plan.
    Planner,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolver => "resolver",
            Self::Planner => "planner",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "resolver" => Ok(Self::Resolver),
            "planner" => Ok(Self::Planner),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// How a turn ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Orchestration lifecycle events, in emission order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OrchestrationEvent {
    #[serde(rename = "turn_start")]
    TurnStart {
        session_id: SessionId,
        turn: u32,
        strategy: Strategy,
    },

    #[serde(rename = "agent_selected")]
    AgentSelected {
        session_id: SessionId,
        agent_id: AgentId,
        score: f64,
    },

    #[serde(rename = "plan_ready")]
    PlanReady {
        session_id: SessionId,
        steps: Vec<AgentId>,
    },

    #[serde(rename = "requirement_resolving")]
    RequirementResolving {
        session_id: SessionId,
        requester: AgentId,
        key: String,
        provider: AgentId,
        depth: usize,
    },

    /// No agent provides `key`; `requester` runs without it.
    #[serde(rename = "requirement_unresolved")]
    RequirementUnresolved {
        session_id: SessionId,
        requester: AgentId,
        key: String,
    },

    #[serde(rename = "fallback_attempt")]
    FallbackAttempt {
        session_id: SessionId,
        key: String,
        failed: AgentId,
        next: AgentId,
    },

    #[serde(rename = "agent_start")]
    AgentStart {
        session_id: SessionId,
        agent_id: AgentId,
        depth: usize,
    },

    #[serde(rename = "chunk")]
    Chunk {
        session_id: SessionId,
        agent_id: AgentId,
        text: String,
    },

    #[serde(rename = "agent_complete")]
    AgentComplete {
        session_id: SessionId,
        agent_id: AgentId,
        written_keys: Vec<String>,
        duration_ms: u64,
    },

    #[serde(rename = "agent_failed")]
    AgentFailed {
        session_id: SessionId,
        agent_id: AgentId,
        error_kind: String,
        message: String,
    },

    /// MUST be the last event of a turn.
    #[serde(rename = "turn_done")]
    TurnDone {
        session_id: SessionId,
        turn: u32,
        status: TurnStatus,
        error: Option<String>,
    },
}

impl OrchestrationEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::TurnStart { session_id, .. }
            | Self::AgentSelected { session_id, .. }
            | Self::PlanReady { session_id, .. }
            | Self::RequirementResolving { session_id, .. }
            | Self::RequirementUnresolved { session_id, .. }
            | Self::FallbackAttempt { session_id, .. }
            | Self::AgentStart { session_id, .. }
            | Self::Chunk { session_id, .. }
            | Self::AgentComplete { session_id, .. }
            | Self::AgentFailed { session_id, .. }
            | Self::TurnDone { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStart { .. } => "turn_start",
            Self::AgentSelected { .. } => "agent_selected",
            Self::PlanReady { .. } => "plan_ready",
            Self::RequirementResolving { .. } => "requirement_resolving",
            Self::RequirementUnresolved { .. } => "requirement_unresolved",
            Self::FallbackAttempt { .. } => "fallback_attempt",
            Self::AgentStart { .. } => "agent_start",
            Self::Chunk { .. } => "chunk",
            Self::AgentComplete { .. } => "agent_complete",
            Self::AgentFailed { .. } => "agent_failed",
            Self::TurnDone { .. } => "turn_done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parse_and_display() {
        assert_eq!("Planner".parse::<Strategy>().unwrap(), Strategy::Planner);
        assert_eq!(Strategy::Resolver.to_string(), "resolver");
        assert!("graph".parse::<Strategy>().is_err());
        assert_eq!(Strategy::default(), Strategy::Resolver);
    }

    #[test]
    fn strategy_serde() {
        assert_eq!(serde_json::to_string(&Strategy::Planner).unwrap(), r#""planner""#);
    }

    #[test]
    fn event_session_id_and_type() {
        let sid = SessionId::new();
        let evt = OrchestrationEvent::Chunk {
            session_id: sid.clone(),
            agent_id: AgentId::from("lister"),
            text: "hi".into(),
        };
        assert_eq!(evt.session_id(), &sid);
        assert_eq!(evt.event_type(), "chunk");
    }

    #[test]
    fn event_tagged_serialization() {
        let evt = OrchestrationEvent::TurnDone {
            session_id: SessionId::from_raw("sess_1"),
            turn: 2,
            status: TurnStatus::Failed,
            error: Some("cycle_detected".into()),
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "turn_done");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["turn"], 2);
    }
}
