/// Errors an agent handler reports back to the executor.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// The agent could not produce one of its declared keys.
    #[error("could not provide `{key}`: {reason}")]
    Provision { key: String, reason: String },

    /// A key the agent needs to read is absent from memory.
    #[error("missing input `{0}`")]
    MissingInput(String),

    /// The agent tried to write a key it never declared.
    #[error("undeclared key `{0}`")]
    UndeclaredKey(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl AgentError {
    pub fn provision(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Provision {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Provision { .. } => "provision_failure",
            Self::MissingInput(_) => "missing_input",
            Self::UndeclaredKey(_) => "undeclared_key",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "agent_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_display_names_key() {
        let err = AgentError::provision("tables", "catalog offline");
        assert_eq!(err.to_string(), "could not provide `tables`: catalog offline");
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(AgentError::Cancelled.error_kind(), "cancelled");
        assert_eq!(AgentError::MissingInput("x".into()).error_kind(), "missing_input");
        assert_eq!(AgentError::provision("x", "y").error_kind(), "provision_failure");
    }
}
