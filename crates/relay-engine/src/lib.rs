//! Orchestration engine: the agent registry, the single-agent executor, the
//! resolver and planner coordinators, and sessions.

pub mod coordinator;
pub mod error;
pub mod executor;
pub mod planner;
pub mod registry;
pub mod resolver;
pub mod session;

pub use coordinator::{
    build_coordinator, Chunk, Coordinator, CoordinatorDeps, TurnContext, TurnOutput,
};
pub use error::{OrchestrationError, RegistryError};
pub use executor::{AgentExecutor, ExecutionRecord, ExecutionStatus, ExecutorConfig};
pub use planner::{PlanStep, PlannerCoordinator};
pub use registry::{AgentRegistry, Candidate};
pub use resolver::{ResolutionTask, ResolverCoordinator};
pub use session::{
    ArchivedSession, Session, SessionManager, SessionState, TranscriptEntry, TurnResponse,
};
