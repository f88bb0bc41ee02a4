//! Shared vocabulary of the relay orchestrator: ids, the per-session memory
//! store, the agent contract, the selector seam, events and sinks.

pub mod agent;
pub mod errors;
pub mod events;
pub mod ids;
pub mod memory;
pub mod mock;
pub mod selector;
pub mod sink;

pub use agent::{Agent, AgentContext, AgentDescriptor, AgentOutput, ContextParts};
pub use errors::AgentError;
pub use events::{OrchestrationEvent, Strategy, TurnStatus};
pub use ids::{AgentId, RunId, SessionId};
pub use memory::{AuditRecord, KeyPresence, MemoryEntry, MemorySnapshot, MemoryStore};
pub use selector::{LexicalSelector, Selector};
pub use sink::{BroadcastSink, NullSink, PresentationSink};
