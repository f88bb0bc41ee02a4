use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{AgentDescriptor, OrchestrationEvent, Strategy};
use relay_settings::SelectionSettings;
use tracing::{info, instrument};

use crate::coordinator::{Coordinator, CoordinatorDeps, TurnContext};
use crate::error::OrchestrationError;

/// One subquery bound to the agent that will answer it.
#[derive(Clone, Debug)]
pub struct PlanStep {
    pub subquery: String,
    pub agent: Arc<AgentDescriptor>,
    pub score: f64,
}

/// Decomposes the query up front, maps every part to an agent, then runs the
/// plan in order. There is no dynamic resolution and no fallback.
pub struct PlannerCoordinator {
    deps: CoordinatorDeps,
    selection: SelectionSettings,
}

impl PlannerCoordinator {
    pub fn new(deps: CoordinatorDeps) -> Self {
        let selection = deps.settings.selection.clone();
        Self { deps, selection }
    }

    /// Build the full plan without running anything. Keys promised by earlier
    /// steps count as available when ranking later ones.
    pub fn plan(
        &self,
        query: &str,
        available: HashSet<String>,
    ) -> Result<Vec<PlanStep>, OrchestrationError> {
        let mut subqueries: Vec<String> = self
            .deps
            .selector
            .decompose(query)
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if subqueries.is_empty() {
            subqueries.push(query.to_string());
        }

        let mut promised = available;
        let mut steps = Vec::with_capacity(subqueries.len());
        for subquery in subqueries {
            let candidate = self
                .deps
                .registry
                .find_candidates(&subquery, &promised, self.deps.selector.as_ref(), &self.selection)
                .into_iter()
                .find(|c| c.match_score >= self.selection.min_confidence)
                .ok_or_else(|| OrchestrationError::NoCandidateAgent {
                    query: subquery.clone(),
                })?;
            promised.extend(candidate.descriptor.provides.iter().cloned());
            steps.push(PlanStep {
                subquery,
                agent: candidate.descriptor,
                score: candidate.match_score,
            });
        }
        Ok(steps)
    }
}

#[async_trait]
impl Coordinator for PlannerCoordinator {
    fn strategy(&self) -> Strategy {
        Strategy::Planner
    }

    #[instrument(skip_all, fields(session_id = %ctx.session_id, turn = ctx.turn))]
    async fn run_turn(&self, ctx: &mut TurnContext<'_>) -> Result<(), OrchestrationError> {
        let steps = self.plan(ctx.query, ctx.memory.snapshot().key_set())?;
        info!(steps = steps.len(), "plan ready");
        ctx.emit(OrchestrationEvent::PlanReady {
            session_id: ctx.session_id.clone(),
            steps: steps.iter().map(|s| s.agent.id.clone()).collect(),
        });

        for (index, step) in steps.iter().enumerate() {
            ctx.check_cancelled()?;

            if let Some(key) = step.agent.missing(&*ctx.memory).first() {
                return Err(OrchestrationError::PlanExecutionFailure {
                    step: index,
                    agent: step.agent.id.clone(),
                    reason: format!("required key `{key}` is not available"),
                });
            }

            match self
                .deps
                .executor
                .run(&step.agent, &step.subquery, 0, ctx)
                .await
            {
                Ok(()) => {}
                Err(OrchestrationError::Cancelled) => return Err(OrchestrationError::Cancelled),
                Err(err) => {
                    return Err(OrchestrationError::PlanExecutionFailure {
                        step: index,
                        agent: step.agent.id.clone(),
                        reason: err.to_string(),
                    })
                }
            }
        }
        Ok(())
    }
}
