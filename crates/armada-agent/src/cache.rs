//! Target states the agent last drove each unit to.

use std::collections::BTreeMap;

use armada_core::JobState;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentCache {
    target_states: BTreeMap<String, JobState>,
}

impl AgentCache {
    pub fn set_target_state(&mut self, name: &str, state: JobState) {
        self.target_states.insert(name.to_string(), state);
    }

    pub fn drop_target_state(&mut self, name: &str) {
        self.target_states.remove(name);
    }

    pub fn target_state(&self, name: &str) -> Option<JobState> {
        self.target_states.get(name).copied()
    }

    pub fn launched(&self) -> Vec<String> {
        self.with_state(JobState::Launched)
    }

    pub fn loaded(&self) -> Vec<String> {
        self.with_state(JobState::Loaded)
    }

    fn with_state(&self, state: JobState) -> Vec<String> {
        self.target_states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_latest_target() {
        let mut cache = AgentCache::default();
        cache.set_target_state("a.service", JobState::Loaded);
        cache.set_target_state("b.service", JobState::Launched);
        cache.set_target_state("a.service", JobState::Launched);

        assert_eq!(cache.launched(), ["a.service", "b.service"]);
        assert!(cache.loaded().is_empty());

        cache.drop_target_state("a.service");
        assert_eq!(cache.target_state("a.service"), None);
        assert_eq!(cache.launched(), ["b.service"]);
    }
}
