use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use relay_core::{AgentDescriptor, AgentId, KeyPresence, Selector};
use relay_settings::SelectionSettings;

use crate::error::RegistryError;

/// One ranked answer to "who could handle this query?".
#[derive(Clone, Debug)]
pub struct Candidate {
    pub descriptor: Arc<AgentDescriptor>,
    /// Raw selector score in [0, 1].
    pub match_score: f64,
    /// `match_score` plus the satisfied bonus, if earned.
    pub rank_score: f64,
    pub unmet: usize,
    /// Registration position, used to break ties.
    pub order: usize,
}

/// Closed set of agents known to the engine. Built at startup, then shared
/// read-only behind an `Arc`.
#[derive(Default)]
pub struct AgentRegistry {
    agents: Vec<Arc<AgentDescriptor>>,
    index: HashMap<AgentId, usize>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: AgentDescriptor) -> Result<(), RegistryError> {
        if self.index.contains_key(&descriptor.id) {
            return Err(RegistryError::Duplicate(descriptor.id));
        }
        let provides: HashSet<&str> = descriptor.provides.iter().map(String::as_str).collect();
        if let Some(key) = descriptor.requires.iter().find(|k| provides.contains(k.as_str())) {
            return Err(RegistryError::SelfDependency {
                agent: descriptor.id.clone(),
                key: key.clone(),
            });
        }
        self.index.insert(descriptor.id.clone(), self.agents.len());
        self.agents.push(Arc::new(descriptor));
        Ok(())
    }

    /// Descriptors in registration order.
    pub fn all(&self) -> &[Arc<AgentDescriptor>] {
        &self.agents
    }

    pub fn get(&self, id: &AgentId) -> Option<Arc<AgentDescriptor>> {
        self.index.get(id).map(|&i| Arc::clone(&self.agents[i]))
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Every agent scored against `query`, best first.
    pub fn find_candidates(
        &self,
        query: &str,
        available: &dyn KeyPresence,
        selector: &dyn Selector,
        selection: &SelectionSettings,
    ) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = self
            .agents
            .iter()
            .enumerate()
            .map(|(order, descriptor)| {
                let match_score = selector.score(query, &descriptor.purpose).clamp(0.0, 1.0);
                let unmet = descriptor.unmet_count(available);
                let bonus = if unmet == 0 {
                    selection.satisfied_bonus
                } else {
                    0.0
                };
                Candidate {
                    descriptor: Arc::clone(descriptor),
                    match_score,
                    rank_score: match_score + bonus,
                    unmet,
                    order,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.rank_score
                .total_cmp(&a.rank_score)
                .then_with(|| a.order.cmp(&b.order))
        });
        candidates
    }

    /// Agents declaring `key`, fewest unmet requirements first, then
    /// registration order.
    pub fn providers_for(
        &self,
        key: &str,
        available: &dyn KeyPresence,
    ) -> Vec<Arc<AgentDescriptor>> {
        let mut providers: Vec<(usize, usize, &Arc<AgentDescriptor>)> = self
            .agents
            .iter()
            .enumerate()
            .filter(|(_, d)| d.declares(key))
            .map(|(order, d)| (d.unmet_count(available), order, d))
            .collect();
        providers.sort_by_key(|(unmet, order, _)| (*unmet, *order));
        providers.into_iter().map(|(_, _, d)| Arc::clone(d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use relay_core::mock::{MockSelector, ScriptedAgent};

    use super::*;

    fn descriptor(
        id: &str,
        purpose: &str,
        requires: &[&str],
        provides: &[&str],
    ) -> AgentDescriptor {
        AgentDescriptor::new(id, purpose, Arc::new(ScriptedAgent::new(id)))
            .requires(requires.iter().copied())
            .provides(provides.iter().copied())
    }

    fn keys(keys: &[&str]) -> HashSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn duplicate_rejected() {
        let mut reg = AgentRegistry::new();
        reg.register(descriptor("lister", "list tables", &[], &["tables"]))
            .unwrap();
        let err = reg
            .register(descriptor("lister", "other", &[], &[]))
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(AgentId::from("lister")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn self_dependency_rejected() {
        let mut reg = AgentRegistry::new();
        let err = reg
            .register(descriptor("loop", "loops", &["x"], &["x"]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::SelfDependency { key, .. } if key == "x"));
        assert!(reg.is_empty());
    }

    #[test]
    fn get_and_all_keep_order() {
        let mut reg = AgentRegistry::new();
        reg.register(descriptor("b", "", &[], &[])).unwrap();
        reg.register(descriptor("a", "", &[], &[])).unwrap();
        let ids: Vec<&str> = reg.all().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(reg.get(&AgentId::from("a")).is_some());
        assert!(reg.get(&AgentId::from("zzz")).is_none());
    }

    #[test]
    fn satisfied_bonus_changes_ranking() {
        let mut reg = AgentRegistry::new();
        reg.register(descriptor("querier", "query data", &["tables"], &["result"]))
            .unwrap();
        reg.register(descriptor("lister", "list tables", &[], &["tables"]))
            .unwrap();
        let selector = MockSelector::new()
            .route("data", "query data", 0.6)
            .route("data", "list tables", 0.5);
        let selection = SelectionSettings::default();

        let ranked = reg.find_candidates("data please", &keys(&[]), &selector, &selection);
        assert_eq!(ranked[0].descriptor.id.as_str(), "lister");
        assert_eq!(ranked[0].rank_score, 0.75);
        assert_eq!(ranked[1].unmet, 1);

        let ranked = reg.find_candidates("data please", &keys(&["tables"]), &selector, &selection);
        assert_eq!(ranked[0].descriptor.id.as_str(), "querier");
        assert_eq!(ranked[0].match_score, 0.6);
    }

    #[test]
    fn ties_break_by_registration_order() {
        let mut reg = AgentRegistry::new();
        reg.register(descriptor("first", "same", &[], &[])).unwrap();
        reg.register(descriptor("second", "same", &[], &[])).unwrap();
        let selector = MockSelector::new().default_score(0.5);
        let ranked = reg.find_candidates("q", &keys(&[]), &selector, &SelectionSettings::default());
        let ids: Vec<&str> = ranked.iter().map(|c| c.descriptor.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn providers_prefer_fewest_unmet() {
        let mut reg = AgentRegistry::new();
        reg.register(descriptor("slow", "", &["a", "b"], &["tables"])).unwrap();
        reg.register(descriptor("other", "", &[], &["chart"])).unwrap();
        reg.register(descriptor("medium", "", &["a"], &["tables"])).unwrap();
        reg.register(descriptor("fast", "", &["a"], &["tables"])).unwrap();

        let providers = reg.providers_for("tables", &keys(&[]));
        let ids: Vec<&str> = providers.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["medium", "fast", "slow"]);

        assert!(reg.providers_for("nothing", &keys(&[])).is_empty());
    }
}
