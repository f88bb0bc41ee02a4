use std::time::Duration;

use relay_core::{AgentError, AgentId, SessionId};

use crate::resolver::ResolutionTask;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("agent `{0}` is already registered")]
    Duplicate(AgentId),

    #[error("agent `{agent}` both requires and provides `{key}`")]
    SelfDependency { agent: AgentId, key: String },
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("no agent can handle `{query}`")]
    NoCandidateAgent { query: String },

    #[error("dependency cycle: {}", format_path(.path))]
    CycleDetected { path: Vec<ResolutionTask> },

    #[error("agent `{agent}` could not provide `{key}`: {reason}")]
    ProvisionFailure {
        agent: AgentId,
        key: String,
        reason: String,
    },

    /// `step` is the zero-based position in the plan.
    #[error("plan step {step} ({agent}) failed: {reason}")]
    PlanExecutionFailure {
        step: usize,
        agent: AgentId,
        reason: String,
    },

    #[error("resolution deeper than {limit} frames")]
    ResolutionDepthExceeded { limit: usize },

    #[error("agent `{agent}` failed: {error}")]
    AgentFailed { agent: AgentId, error: AgentError },

    #[error("agent `{agent}` timed out after {timeout:?}")]
    AgentTimedOut { agent: AgentId, timeout: Duration },

    #[error("agent `{agent}` panicked: {message}")]
    AgentPanicked { agent: AgentId, message: String },

    #[error("turn cancelled")]
    Cancelled,

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session archived: {0}")]
    SessionArchived(SessionId),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

fn format_path(path: &[ResolutionTask]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl OrchestrationError {
    /// Stable snake_case classification for logs, metrics and events.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NoCandidateAgent { .. } => "no_candidate_agent",
            Self::CycleDetected { .. } => "cycle_detected",
            Self::ProvisionFailure { .. } => "provision_failure",
            Self::PlanExecutionFailure { .. } => "plan_execution_failure",
            Self::ResolutionDepthExceeded { .. } => "resolution_depth_exceeded",
            Self::AgentFailed { .. } => "agent_failed",
            Self::AgentTimedOut { .. } => "agent_timed_out",
            Self::AgentPanicked { .. } => "agent_panicked",
            Self::Cancelled => "cancelled",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionArchived(_) => "session_archived",
            Self::Registry(_) => "registry",
        }
    }

    /// Sentence shown to the end user after any partial output.
    pub fn user_notice(&self) -> String {
        match self {
            Self::NoCandidateAgent { .. } => "Sorry, I cannot help with that.".to_string(),
            Self::CycleDetected { .. } | Self::ResolutionDepthExceeded { .. } => {
                "The agents needed for this request depend on each other; \
                 please report this configuration problem."
                    .to_string()
            }
            Self::Cancelled => "The request was cancelled.".to_string(),
            Self::AgentTimedOut { agent, .. } => format!("`{agent}` took too long to respond."),
            other => format!("Something went wrong: {other}."),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
