use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{AgentDescriptor, AgentId, OrchestrationEvent, Strategy};
use relay_settings::{ResolutionSettings, SelectionSettings};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::coordinator::{Coordinator, CoordinatorDeps, TurnContext};
use crate::error::OrchestrationError;

/// "`requester` needs `key`, to be produced by `provider`".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionTask {
    pub requester: AgentId,
    pub key: String,
    pub provider: AgentId,
}

impl ResolutionTask {
    fn same_need(&self, requester: &AgentId, key: &str) -> bool {
        &self.requester == requester && self.key == key
    }
}

impl fmt::Display for ResolutionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} needs `{}` from {}", self.requester, self.key, self.provider)
    }
}

struct Frame {
    descriptor: Arc<AgentDescriptor>,
    query: String,
    /// Why this frame exists. `None` for the root.
    task: Option<ResolutionTask>,
    /// Remaining providers for `task.key`, best first.
    alternatives: VecDeque<Arc<AgentDescriptor>>,
    fallbacks_left: u32,
    /// Missing keys this frame gave up on; the agent runs without them.
    exhausted: HashSet<String>,
}

impl Frame {
    fn root(descriptor: Arc<AgentDescriptor>, query: &str) -> Self {
        Self {
            descriptor,
            query: query.to_string(),
            task: None,
            alternatives: VecDeque::new(),
            fallbacks_left: 0,
            exhausted: HashSet::new(),
        }
    }

    fn provider(
        requester: &AgentId,
        key: &str,
        provider: Arc<AgentDescriptor>,
        alternatives: VecDeque<Arc<AgentDescriptor>>,
        fallbacks_left: u32,
    ) -> Self {
        Self {
            task: Some(ResolutionTask {
                requester: requester.clone(),
                key: key.to_string(),
                provider: provider.id.clone(),
            }),
            query: format!("need key {key}"),
            descriptor: provider,
            alternatives,
            fallbacks_left,
            exhausted: HashSet::new(),
        }
    }
}

/// Picks the best agent for the query and satisfies its requirements by
/// running providers first, depth first.
///
/// Resolution uses an explicit frame stack. Each (requester, key) pair is
/// attempted at most once per turn; meeting a pair that is still on the
/// stack is a cycle.
pub struct ResolverCoordinator {
    deps: CoordinatorDeps,
    selection: SelectionSettings,
    resolution: ResolutionSettings,
}

impl ResolverCoordinator {
    pub fn new(deps: CoordinatorDeps) -> Self {
        let selection = deps.settings.selection.clone();
        let resolution = deps.settings.resolution.clone();
        Self {
            deps,
            selection,
            resolution,
        }
    }

    fn select_root(
        &self,
        ctx: &TurnContext<'_>,
    ) -> Result<Arc<AgentDescriptor>, OrchestrationError> {
        let candidates = self.deps.registry.find_candidates(
            ctx.query,
            &*ctx.memory,
            self.deps.selector.as_ref(),
            &self.selection,
        );
        let chosen = candidates
            .into_iter()
            .find(|c| c.match_score >= self.selection.min_confidence)
            .ok_or_else(|| OrchestrationError::NoCandidateAgent {
                query: ctx.query.to_string(),
            })?;

        info!(agent_id = %chosen.descriptor.id, score = chosen.match_score, "agent selected");
        ctx.emit(OrchestrationEvent::AgentSelected {
            session_id: ctx.session_id.clone(),
            agent_id: chosen.descriptor.id.clone(),
            score: chosen.match_score,
        });
        Ok(chosen.descriptor)
    }

    fn count(&self, name: &str) {
        if let Some(metrics) = &self.deps.metrics {
            metrics.counter_inc(name, &[], 1);
        }
    }
}

#[async_trait]
impl Coordinator for ResolverCoordinator {
    fn strategy(&self) -> Strategy {
        Strategy::Resolver
    }

    #[instrument(skip_all, fields(session_id = %ctx.session_id, turn = ctx.turn))]
    async fn run_turn(&self, ctx: &mut TurnContext<'_>) -> Result<(), OrchestrationError> {
        let root = self.select_root(ctx)?;
        let mut stack = vec![Frame::root(root, ctx.query)];
        let mut visited: HashSet<(AgentId, String)> = HashSet::new();

        loop {
            ctx.check_cancelled()?;
            let Some(top) = stack.last() else {
                return Ok(());
            };

            let next_missing = top
                .descriptor
                .requires
                .iter()
                .find(|k| !ctx.memory.has(k) && !top.exhausted.contains(*k))
                .cloned();

            if let Some(key) = next_missing {
                let requester = top.descriptor.id.clone();

                if let Some(pos) = stack
                    .iter()
                    .position(|f| f.task.as_ref().is_some_and(|t| t.same_need(&requester, &key)))
                {
                    let mut path: Vec<ResolutionTask> =
                        stack.iter().filter_map(|f| f.task.clone()).collect();
                    if let Some(closing) = stack[pos].task.clone() {
                        path.push(closing);
                    }
                    self.count("resolution_cycles_total");
                    let err = OrchestrationError::CycleDetected { path };
                    error!(error = %err, "dependency cycle in agent registry");
                    return Err(err);
                }

                if !visited.insert((requester.clone(), key.clone())) {
                    debug!(
                        agent_id = %requester,
                        key = %key,
                        "requirement already attempted, skipping"
                    );
                    mark_exhausted(&mut stack, key);
                    continue;
                }

                let mut providers: VecDeque<Arc<AgentDescriptor>> = self
                    .deps
                    .registry
                    .providers_for(&key, &*ctx.memory)
                    .into();
                let Some(provider) = providers.pop_front() else {
                    warn!(agent_id = %requester, key = %key, "no provider for required key");
                    ctx.emit(OrchestrationEvent::RequirementUnresolved {
                        session_id: ctx.session_id.clone(),
                        requester,
                        key: key.clone(),
                    });
                    mark_exhausted(&mut stack, key);
                    continue;
                };

                if stack.len() >= self.resolution.max_depth {
                    return Err(OrchestrationError::ResolutionDepthExceeded {
                        limit: self.resolution.max_depth,
                    });
                }

                ctx.emit(OrchestrationEvent::RequirementResolving {
                    session_id: ctx.session_id.clone(),
                    requester: requester.clone(),
                    key: key.clone(),
                    provider: provider.id.clone(),
                    depth: stack.len(),
                });
                stack.push(Frame::provider(
                    &requester,
                    &key,
                    provider,
                    providers,
                    self.resolution.fallback_retries,
                ));
                continue;
            }

            let Some(mut frame) = stack.pop() else {
                return Ok(());
            };
            let depth = stack.len();
            match self
                .deps
                .executor
                .run(&frame.descriptor, &frame.query, depth, ctx)
                .await
            {
                Ok(()) => {}
                Err(err @ OrchestrationError::ProvisionFailure { .. }) => {
                    let written = frame.task.as_ref().filter(|t| ctx.memory.has(&t.key));
                    if let Some(task) = written {
                        debug!(
                            key = %task.key,
                            provider = %task.provider,
                            error = %err,
                            "provider failed after writing the requested key"
                        );
                        continue;
                    }
                    let next = match &frame.task {
                        Some(_) if frame.fallbacks_left > 0 => frame.alternatives.pop_front(),
                        _ => None,
                    };
                    let (Some(next), Some(task)) = (next, frame.task) else {
                        return Err(err);
                    };

                    warn!(
                        key = %task.key,
                        failed = %task.provider,
                        next = %next.id,
                        "provider failed, falling back"
                    );
                    self.count("resolution_fallbacks_total");
                    ctx.emit(OrchestrationEvent::FallbackAttempt {
                        session_id: ctx.session_id.clone(),
                        key: task.key.clone(),
                        failed: task.provider.clone(),
                        next: next.id.clone(),
                    });
                    stack.push(Frame::provider(
                        &task.requester,
                        &task.key,
                        next,
                        frame.alternatives,
                        frame.fallbacks_left - 1,
                    ));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn mark_exhausted(stack: &mut [Frame], key: String) {
    if let Some(top) = stack.last_mut() {
        top.exhausted.insert(key);
    }
}
