//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file only needs the fields it wants to change.

use relay_core::Strategy;
use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "selection": { "minConfidence": 0.35 },
///   "resolution": { "fallbackRetries": 2 },
///   "session": { "defaultStrategy": "planner" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub logging: LoggingSettings,
    pub selection: SelectionSettings,
    pub resolution: ResolutionSettings,
    pub execution: ExecutionSettings,
    pub memory: MemorySettings,
    pub session: SessionSettings,
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level name (`"info"`, `"debug"`, ...). `RUST_LOG` wins over it.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Record in-process metrics.
    pub metrics: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            metrics: true,
        }
    }
}

/// How candidate agents are ranked against a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectionSettings {
    /// Minimum selector match score for an agent to be chosen at all.
    pub min_confidence: f64,
    /// Added to the match score when every requirement is already available.
    pub satisfied_bonus: f64,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.2,
            satisfied_bonus: 0.25,
        }
    }
}

/// Dependency resolution limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolutionSettings {
    /// Maximum number of frames on the resolution stack.
    pub max_depth: usize,
    /// Alternate providers tried per key after a provision failure.
    pub fallback_retries: u32,
}

impl Default for ResolutionSettings {
    fn default() -> Self {
        Self {
            max_depth: 16,
            fallback_retries: 1,
        }
    }
}

/// Per-agent execution limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionSettings {
    /// Capacity of the bounded output channel between an agent and the executor.
    pub chunk_buffer: usize,
    /// Wall-clock limit for a single agent run.
    pub agent_timeout_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            chunk_buffer: 64,
            agent_timeout_ms: 120_000,
        }
    }
}

/// Memory store settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemorySettings {
    /// Bounded audit log length. `0` disables the log.
    pub audit_capacity: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            audit_capacity: relay_core::memory::DEFAULT_AUDIT_CAPACITY,
        }
    }
}

/// Session behavior settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Coordinator used when a session is created without an explicit strategy.
    pub default_strategy: Strategy,
}
