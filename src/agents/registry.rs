//! Registry of worker agents available for dispatch
//!
//! Agents are transient pool members and are never persisted. Registration
//! order is preserved because dispatch hands work to idle agents in the
//! order they joined the pool.

use crate::models::{Agent, AgentRole};
use serde::{Deserialize, Serialize};

/// Record of one live story-to-agent pairing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Unique assignment ID
    pub id: String,
    pub agent_id: String,
    pub story_id: String,
    /// When the assignment was created
    pub assigned_at: String,
}

impl Assignment {
    /// Create a new assignment
    pub fn new(agent_id: impl Into<String>, story_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            story_id: story_id.into(),
            assigned_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// A pool member plus its live assignment state
#[derive(Debug, Clone)]
pub struct RegisteredAgent {
    pub agent: Agent,
    pub registered_at: chrono::DateTime<chrono::Utc>,
    pub current_assignment: Option<Assignment>,
}

impl RegisteredAgent {
    fn new(agent: Agent) -> Self {
        Self {
            agent,
            registered_at: chrono::Utc::now(),
            current_assignment: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.agent.id
    }

    pub fn role(&self) -> AgentRole {
        self.agent.role
    }

    pub fn is_idle(&self) -> bool {
        self.current_assignment.is_none()
    }

    /// Story the agent is currently working, if any
    pub fn current_story(&self) -> Option<&str> {
        self.current_assignment.as_ref().map(|a| a.story_id.as_str())
    }
}

/// Registry for the worker agent pool
#[derive(Debug, Default)]
pub struct AgentRegistry {
    // Vec keeps registration order; pools are small, linear scans are fine
    agents: Vec<RegisteredAgent>,
}

impl AgentRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self { agents: Vec::new() }
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.iter().any(|a| a.id() == agent_id)
    }

    /// Add an agent to the pool. The caller is expected to reject duplicate
    /// ids before calling; a duplicate here is replaced with a warning.
    pub fn register(&mut self, agent: Agent) {
        if let Some(existing) = self.agents.iter_mut().find(|a| a.id() == agent.id) {
            log::warn!(
                "[AgentRegistry] Re-registering agent '{}', replacing previous entry",
                agent.id
            );
            *existing = RegisteredAgent::new(agent);
            return;
        }

        log::info!(
            "[AgentRegistry] Registered {} agent '{}'",
            agent.role,
            agent.id
        );
        self.agents.push(RegisteredAgent::new(agent));
    }

    /// Remove an agent from the pool, returning its entry (with any live
    /// assignment) so the caller can revert the work it held
    pub fn unregister(&mut self, agent_id: &str) -> Option<RegisteredAgent> {
        let idx = self.agents.iter().position(|a| a.id() == agent_id)?;
        let removed = self.agents.remove(idx);
        log::info!("[AgentRegistry] Unregistered agent '{}'", agent_id);
        Some(removed)
    }

    pub fn get(&self, agent_id: &str) -> Option<&RegisteredAgent> {
        self.agents.iter().find(|a| a.id() == agent_id)
    }

    /// Idle agents of the given role, in registration order
    pub fn idle_agents(&self, role: AgentRole) -> Vec<&RegisteredAgent> {
        self.agents
            .iter()
            .filter(|a| a.role() == role && a.is_idle())
            .collect()
    }

    /// Record a pairing. Returns None (with a warning) if the agent is
    /// unknown or already busy, so a stale dispatch plan cannot double-book.
    pub fn assign(&mut self, agent_id: &str, story_id: &str) -> Option<Assignment> {
        let entry = self.agents.iter_mut().find(|a| a.id() == agent_id)?;

        if let Some(existing) = &entry.current_assignment {
            log::warn!(
                "[AgentRegistry] Agent '{}' already working story '{}', refusing to assign '{}'",
                agent_id,
                existing.story_id,
                story_id
            );
            return None;
        }

        let assignment = Assignment::new(agent_id, story_id);
        entry.current_assignment = Some(assignment.clone());
        Some(assignment)
    }

    /// Free the agent working the given story, returning the cleared
    /// assignment if there was one
    pub fn clear_assignment_for_story(&mut self, story_id: &str) -> Option<Assignment> {
        let entry = self
            .agents
            .iter_mut()
            .find(|a| a.current_story() == Some(story_id))?;
        entry.current_assignment.take()
    }

    pub fn is_story_assigned(&self, story_id: &str) -> bool {
        self.agents
            .iter()
            .any(|a| a.current_story() == Some(story_id))
    }

    /// All live assignments, in registration order
    pub fn active_assignments(&self) -> Vec<&Assignment> {
        self.agents
            .iter()
            .filter_map(|a| a.current_assignment.as_ref())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Clear the pool (shutdown path)
    pub fn clear(&mut self) {
        self.agents.clear();
    }
}
