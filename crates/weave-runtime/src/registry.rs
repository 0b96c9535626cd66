use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use weave_core::error::{Result, WeaveError};
use weave_core::traits::AgentHandler;

/// Registry of agent handlers keyed by name.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn AgentHandler>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Names must be non-empty and unique.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn AgentHandler>) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(WeaveError::EmptyAgentName);
        }
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if agents.contains_key(&name) {
            return Err(WeaveError::DuplicateAgent(name));
        }
        agents.insert(name, handler);
        Ok(())
    }

    /// Get a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentHandler>> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = agents.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
