//! Agent registry.
//!
//! Maps each workflow phase to the agent that performs it. The orchestrator
//! only ever sees `Arc<dyn PhaseAgent>`, so real services, mocks and the
//! printing agent are interchangeable.

use crate::agents::adapters::MockAgent;
use crate::agents::base::PhaseAgent;
use pf_protocol::workflow_models::Phase;
use std::collections::HashMap;
use std::sync::Arc;

/// Registered phase agents.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<Phase, Arc<dyn PhaseAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a succeeding `MockAgent` for every phase.
    ///
    /// Used by the CLI demo and as a starting point in tests, where single
    /// phases are then replaced with `register`.
    pub fn with_mock_agents() -> Self {
        let mut registry = Self::new();
        for phase in Phase::ALL {
            registry.register(phase, Arc::new(MockAgent::for_phase(phase)));
        }
        registry
    }

    /// Register `agent` for `phase`, replacing any previous one.
    pub fn register(&mut self, phase: Phase, agent: Arc<dyn PhaseAgent>) -> &mut Self {
        self.agents.insert(phase, agent);
        self
    }

    /// Builder-style `register`.
    pub fn with(mut self, phase: Phase, agent: Arc<dyn PhaseAgent>) -> Self {
        self.register(phase, agent);
        self
    }

    pub fn get(&self, phase: Phase) -> Option<Arc<dyn PhaseAgent>> {
        self.agents.get(&phase).cloned()
    }

    pub fn has_agent(&self, phase: Phase) -> bool {
        self.agents.contains_key(&phase)
    }

    /// Phases with no registered agent, in workflow order.
    pub fn missing_phases(&self) -> Vec<Phase> {
        Phase::ALL
            .into_iter()
            .filter(|phase| !self.has_agent(*phase))
            .collect()
    }
}
