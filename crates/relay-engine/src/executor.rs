use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_core::{
    AgentContext, AgentDescriptor, AgentError, AgentId, AgentOutput, ContextParts,
    OrchestrationEvent, RunId,
};
use relay_settings::RelaySettings;
use relay_telemetry::MetricsRecorder;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, instrument, warn};

use crate::coordinator::TurnContext;
use crate::error::OrchestrationError;

const DEFAULT_CHUNK_BUFFER: usize = 64;
const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for running a single agent.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub chunk_buffer: usize,
    pub agent_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            chunk_buffer: DEFAULT_CHUNK_BUFFER,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }
}

impl From<&RelaySettings> for ExecutorConfig {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            chunk_buffer: settings.execution.chunk_buffer.max(1),
            agent_timeout: Duration::from_millis(settings.execution.agent_timeout_ms),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    ProvisionFailed,
    Failed,
    TimedOut,
    Panicked,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ProvisionFailed => "provision_failed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Panicked => "panicked",
            Self::Cancelled => "cancelled",
        }
    }
}

/// What one agent run did, kept in the turn output.
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionRecord {
    pub agent_id: AgentId,
    pub run_id: RunId,
    pub depth: usize,
    pub status: ExecutionStatus,
    /// Keys committed to memory, in first-write order.
    pub written_keys: Vec<String>,
    pub duration_ms: u64,
}

enum Outcome {
    Joined(Result<Result<(), AgentError>, JoinError>),
    Cancelled,
    TimedOut,
}

/// Runs one agent at a time against a session's memory.
///
/// The agent executes on its own task and streams [`AgentOutput`] over a
/// bounded channel. Chunks go straight to the sink; writes are staged and
/// committed only when the agent finishes or reports a provision failure.
pub struct AgentExecutor {
    config: ExecutorConfig,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl AgentExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    #[instrument(
        skip_all,
        fields(session_id = %ctx.session_id, agent_id = %descriptor.id, depth = depth)
    )]
    pub async fn run(
        &self,
        descriptor: &AgentDescriptor,
        query: &str,
        depth: usize,
        ctx: &mut TurnContext<'_>,
    ) -> Result<(), OrchestrationError> {
        let agent_id = descriptor.id.clone();
        let run_id = RunId::new();
        let started = Instant::now();

        ctx.emit(OrchestrationEvent::AgentStart {
            session_id: ctx.session_id.clone(),
            agent_id: agent_id.clone(),
            depth,
        });

        let (tx, mut rx) = mpsc::channel(self.config.chunk_buffer);
        let agent_cancel = ctx.cancel.child_token();
        let _stop_agent = agent_cancel.clone().drop_guard();

        let mut agent_ctx = AgentContext::new(ContextParts {
            query: query.to_string(),
            agent_id: agent_id.clone(),
            session_id: ctx.session_id.clone(),
            run_id: run_id.clone(),
            memory: ctx.memory.snapshot(),
            provides: descriptor.provides.clone(),
            tx,
            cancel: agent_cancel.clone(),
        });
        let handler = descriptor.handler();
        let mut handle = tokio::spawn(async move { handler.execute(&mut agent_ctx).await });

        let mut staged: Vec<(String, Value)> = Vec::new();
        let mut channel_open = true;
        let timeout = tokio::time::sleep(self.config.agent_timeout);
        tokio::pin!(timeout);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    handle.abort();
                    break Outcome::Cancelled;
                }
                _ = &mut timeout => {
                    agent_cancel.cancel();
                    handle.abort();
                    break Outcome::TimedOut;
                }
                output = rx.recv(), if channel_open => match output {
                    Some(output) => accept(output, &agent_id, ctx, &mut staged),
                    None => channel_open = false,
                },
                joined = &mut handle => {
                    while let Ok(output) = rx.try_recv() {
                        accept(output, &agent_id, ctx, &mut staged);
                    }
                    break Outcome::Joined(joined);
                }
            }
        };

        let result = match outcome {
            Outcome::Joined(Ok(Ok(()))) => {
                let missing = descriptor
                    .provides
                    .iter()
                    .find(|key| !staged.iter().any(|(k, _)| k == *key));
                match missing {
                    None => Ok(()),
                    Some(key) => Err(OrchestrationError::ProvisionFailure {
                        agent: agent_id.clone(),
                        key: key.clone(),
                        reason: "agent finished without providing it".into(),
                    }),
                }
            }
            Outcome::Joined(Ok(Err(AgentError::Provision { key, reason }))) => {
                Err(OrchestrationError::ProvisionFailure {
                    agent: agent_id.clone(),
                    key,
                    reason,
                })
            }
            Outcome::Joined(Ok(Err(AgentError::MissingInput(input)))) => {
                let key = descriptor
                    .provides
                    .iter()
                    .find(|key| !staged.iter().any(|(k, _)| k == *key))
                    .cloned()
                    .unwrap_or_else(|| input.clone());
                Err(OrchestrationError::ProvisionFailure {
                    agent: agent_id.clone(),
                    key,
                    reason: format!("required input `{input}` is not available"),
                })
            }
            Outcome::Joined(Ok(Err(AgentError::Cancelled))) if ctx.cancel.is_cancelled() => {
                Err(OrchestrationError::Cancelled)
            }
            Outcome::Joined(Ok(Err(error))) => Err(OrchestrationError::AgentFailed {
                agent: agent_id.clone(),
                error,
            }),
            Outcome::Joined(Err(join_err)) if join_err.is_panic() => {
                Err(OrchestrationError::AgentPanicked {
                    agent: agent_id.clone(),
                    message: panic_message(join_err),
                })
            }
            Outcome::Joined(Err(_)) | Outcome::Cancelled => Err(OrchestrationError::Cancelled),
            Outcome::TimedOut => Err(OrchestrationError::AgentTimedOut {
                agent: agent_id.clone(),
                timeout: self.config.agent_timeout,
            }),
        };

        let commit = matches!(
            result,
            Ok(()) | Err(OrchestrationError::ProvisionFailure { .. })
        );
        let mut written_keys: Vec<String> = Vec::new();
        if commit {
            for (key, value) in staged {
                ctx.memory.set(key.clone(), value, &agent_id);
                if !written_keys.contains(&key) {
                    written_keys.push(key);
                }
            }
        } else if !staged.is_empty() {
            debug!(discarded = staged.len(), "discarding staged writes");
        }

        let status = execution_status(&result);
        let duration_ms = started.elapsed().as_millis() as u64;
        self.record_metrics(&agent_id, status, duration_ms);

        match &result {
            Ok(()) => ctx.emit(OrchestrationEvent::AgentComplete {
                session_id: ctx.session_id.clone(),
                agent_id: agent_id.clone(),
                written_keys: written_keys.clone(),
                duration_ms,
            }),
            Err(e) => {
                warn!(error_kind = e.error_kind(), error = %e, duration_ms, "agent run failed");
                ctx.emit(OrchestrationEvent::AgentFailed {
                    session_id: ctx.session_id.clone(),
                    agent_id: agent_id.clone(),
                    error_kind: e.error_kind().to_string(),
                    message: e.to_string(),
                });
            }
        }

        ctx.output.executions.push(ExecutionRecord {
            agent_id,
            run_id,
            depth,
            status,
            written_keys,
            duration_ms,
        });
        result
    }

    fn record_metrics(&self, agent_id: &AgentId, status: ExecutionStatus, duration_ms: u64) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.counter_inc(
            "agent_executions_total",
            &[("agent", agent_id.as_str()), ("status", status.as_str())],
            1,
        );
        metrics.histogram_observe(
            "agent_duration_ms",
            &[("agent", agent_id.as_str())],
            duration_ms as f64,
        );
    }
}

fn accept(
    output: AgentOutput,
    agent_id: &AgentId,
    ctx: &mut TurnContext<'_>,
    staged: &mut Vec<(String, Value)>,
) {
    match output {
        AgentOutput::Chunk(text) => {
            ctx.sink.on_chunk(agent_id, &text);
            ctx.output.push_chunk(agent_id.clone(), text);
        }
        AgentOutput::Write { key, value } => staged.push((key, value)),
    }
}

fn execution_status(result: &Result<(), OrchestrationError>) -> ExecutionStatus {
    match result {
        Ok(()) => ExecutionStatus::Completed,
        Err(OrchestrationError::ProvisionFailure { .. }) => ExecutionStatus::ProvisionFailed,
        Err(OrchestrationError::AgentTimedOut { .. }) => ExecutionStatus::TimedOut,
        Err(OrchestrationError::AgentPanicked { .. }) => ExecutionStatus::Panicked,
        Err(OrchestrationError::Cancelled) => ExecutionStatus::Cancelled,
        Err(_) => ExecutionStatus::Failed,
    }
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
