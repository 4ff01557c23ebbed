//! Event-driven coordination core
//!
//! Owns the story table, dependency graph, agent registry, and lock table,
//! and persists applied mutations before returning to the caller. There is
//! no polling loop: dispatch runs synchronously inside the operations that
//! can change readiness (story submission, status reports, and agent
//! registration changes).

pub mod dependency_graph;
pub mod locks;

use crate::agents::AgentRegistry;
use crate::config::CoordinatorConfig;
use crate::events::{
    AgentRegisteredPayload, AgentUnregisteredPayload, CoordinatorEvent, EventBus,
    FileBlockedPayload, StoryAssignedPayload, StoryMaxRetriesPayload, StoryUnblockedPayload,
    StoryUpdatedPayload,
};
use crate::file_storage;
use crate::models::state_machine::{self, StateTransitionError};
use crate::models::{Agent, AgentRole, FileLock, Story, StoryStatus};
use crate::utils::lock_mutex_recover;
use dependency_graph::{compute_blocked_by, DependencyGraph};
use locks::{LockAcquire, LockManager};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Invalid story: {0}")]
    InvalidStory(String),

    #[error("Unknown story: '{0}'")]
    UnknownStory(String),

    #[error("Unknown agent: '{0}'")]
    UnknownAgent(String),

    #[error("Agent '{0}' is already registered")]
    AgentExists(String),

    #[error("Dependencies of story '{0}' would create a cycle")]
    DependencyCycle(String),

    #[error("Story '{story_id}': {source}")]
    InvalidTransition {
        story_id: String,
        source: StateTransitionError,
    },

    #[error("Persistence failure: {0}")]
    Persistence(String),
}

/// Point-in-time counters for monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    pub total_stories: usize,
    pub pending: usize,
    pub backlog: usize,
    pub in_progress: usize,
    pub testing: usize,
    pub done: usize,
    pub failed: usize,
    /// Failed stories whose retry budget is exhausted
    pub terminal_failures: usize,
    pub registered_agents: usize,
    pub active_assignments: usize,
    pub held_locks: usize,
}

/// The coordination engine for one project
#[derive(Debug)]
pub struct Coordinator {
    config: CoordinatorConfig,
    stories: HashMap<String, Story>,
    /// Story ids in first-submission order; readiness keeps this order
    /// within a priority class
    order: Vec<String>,
    graph: DependencyGraph,
    locks: LockManager,
    registry: AgentRegistry,
    bus: EventBus,
}

impl Coordinator {
    /// Start with empty state, creating the project's .foreman directory
    pub fn init(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        file_storage::init_foreman_dir(&config.project_path)
            .map_err(CoordinatorError::Persistence)?;

        let locks = LockManager::new(&config.project_path, config.lock_stale_secs);
        Ok(Self {
            stories: HashMap::new(),
            order: Vec::new(),
            graph: DependencyGraph::new(),
            locks,
            registry: AgentRegistry::new(),
            bus: EventBus::new(),
            config,
        })
    }

    /// Recover durable state from the project's .foreman directory.
    ///
    /// Missing snapshots mean a fresh start; unreadable ones are an error
    /// rather than silently wiped. In-flight stories keep their status and
    /// assignee so the ready set after a restart matches the one before it.
    /// Agents held by a dead process are cleaned up by the driver through
    /// [`Coordinator::unregister_agent`], which is safe for ids this
    /// registry has never seen.
    pub fn load(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let mut coordinator = Self::init(config)?;

        let stories =
            file_storage::load_stories(&coordinator.config.project_path).map_err(|e| {
                log::error!("[Coordinator] Failed to load stories: {}", e);
                CoordinatorError::Persistence(e)
            })?;

        let rejected = coordinator.graph.rebuild(&stories);
        for story in stories {
            if rejected.contains(&story.id) {
                log::error!(
                    "[Coordinator] Skipping persisted story '{}': its dependencies form a cycle",
                    story.id
                );
                continue;
            }
            coordinator.order.push(story.id.clone());
            coordinator.stories.insert(story.id.clone(), story);
        }
        // Blocked-by is derived state; recompute instead of trusting the disk
        coordinator.recompute_all_blocked_by();

        let records = file_storage::load_locks(&coordinator.config.project_path).map_err(|e| {
            log::error!("[Coordinator] Failed to load locks: {}", e);
            CoordinatorError::Persistence(e)
        })?;
        let total = records.len();
        let discarded = coordinator.locks.restore(records);
        if discarded > 0 {
            coordinator.save_locks()?;
        }

        log::info!(
            "[Coordinator] Loaded {} stories and {} locks ({} stale locks discarded)",
            coordinator.stories.len(),
            total - discarded,
            discarded
        );

        Ok(coordinator)
    }

    /// Persist everything and drop the OS lock guards. Lock records stay on
    /// disk so fresh locks survive into the next run.
    pub fn shutdown(&mut self) -> Result<(), CoordinatorError> {
        let stories = self.save_stories();
        let locks = self.save_locks();
        self.locks.release_guards();
        self.registry.clear();
        log::info!("[Coordinator] Shut down");
        stories?;
        locks
    }

    /// Register a telemetry subscriber for coordination events
    pub fn subscribe(&mut self) -> UnboundedReceiver<CoordinatorEvent> {
        self.bus.subscribe()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // =========================================================================
    // Stories
    // =========================================================================

    /// Accept a new story or update an existing one, then dispatch.
    ///
    /// Resubmitting an id replaces the driver-owned fields (title,
    /// description, dependencies, priority, files) and preserves the
    /// engine-owned ones (status, assignee, retry count). A dependency set
    /// that would close a cycle is rejected and nothing is stored.
    pub fn submit_story(&mut self, story: Story) -> Result<(), CoordinatorError> {
        if story.id.trim().is_empty() {
            return Err(CoordinatorError::InvalidStory(
                "story id must not be empty".to_string(),
            ));
        }

        self.graph
            .upsert_story(&story.id, &story.dependencies)
            .map_err(|_| CoordinatorError::DependencyCycle(story.id.clone()))?;

        for dep_id in &story.dependencies {
            if !self.stories.contains_key(dep_id) {
                log::warn!(
                    "[Coordinator] Story '{}' depends on unknown story '{}'; it stays blocked until that dependency is submitted and completed",
                    story.id,
                    dep_id
                );
            }
        }

        let story_id = story.id.clone();
        match self.stories.get_mut(&story_id) {
            Some(existing) => {
                existing.title = story.title;
                existing.description = story.description;
                existing.dependencies = story.dependencies;
                existing.priority = story.priority;
                existing.files = story.files;
                log::info!("[Coordinator] Updated story '{}'", story_id);
            }
            None => {
                log::info!(
                    "[Coordinator] Accepted story '{}' (priority {})",
                    story_id,
                    story.priority
                );
                self.order.push(story_id.clone());
                self.stories.insert(story_id.clone(), story);
            }
        }

        self.recompute_all_blocked_by();
        self.save_stories()?;
        self.dispatch()
    }

    /// Apply a driver-reported status change, run the follow-on effects
    /// (lock release, unblocking, retry accounting), persist, and dispatch.
    ///
    /// Reporting the status a story already has is a no-op. An illegal
    /// transition is rejected without touching any state.
    pub fn report_status_change(
        &mut self,
        story_id: &str,
        status: StoryStatus,
    ) -> Result<(), CoordinatorError> {
        let (old_status, new_status) = {
            let story = match self.stories.get_mut(story_id) {
                Some(s) => s,
                None => return Err(CoordinatorError::UnknownStory(story_id.to_string())),
            };

            let old = story.status;
            let new = state_machine::transition_state(old, status).map_err(|source| {
                CoordinatorError::InvalidTransition {
                    story_id: story_id.to_string(),
                    source,
                }
            })?;
            if new == old {
                log::debug!(
                    "[Coordinator] Story '{}' already {}, nothing to do",
                    story_id,
                    old
                );
                return Ok(());
            }
            story.status = new;
            (old, new)
        };

        log::info!(
            "[Coordinator] Story '{}' moved {} -> {}",
            story_id,
            old_status,
            new_status
        );
        self.bus.emit(CoordinatorEvent::StoryUpdated(StoryUpdatedPayload {
            story_id: story_id.to_string(),
            old_status,
            new_status,
        }));

        match new_status {
            StoryStatus::Done => {
                self.clear_assignment(story_id);
                let released = self.locks.release_all_for_story(story_id);
                self.unblock_dependents(story_id);
                if released > 0 {
                    self.save_locks()?;
                }
            }
            StoryStatus::Failed => {
                self.clear_assignment(story_id);
                let released = self.locks.release_all_for_story(story_id);
                if released > 0 {
                    self.save_locks()?;
                }
                self.apply_retry_policy(story_id);
            }
            StoryStatus::Testing => {
                // Coder handoff: free the coder, the story waits in tester
                // intake. Its locks stay held until a terminal status.
                self.clear_assignment(story_id);
            }
            StoryStatus::Backlog | StoryStatus::Pending => {
                // Manual requeue
                self.clear_assignment(story_id);
            }
            StoryStatus::InProgress => {}
        }

        self.save_stories()?;
        self.dispatch()
    }

    /// Stories an agent of this role could start right now: unassigned,
    /// unblocked, in the role's intake statuses, ordered by priority and
    /// then first-submission order. Failed stories qualify for coders only
    /// while retry budget remains.
    pub fn get_ready_stories(&self, role: AgentRole) -> Vec<Story> {
        let mut ready: Vec<&Story> = self
            .order
            .iter()
            .filter_map(|id| self.stories.get(id))
            .filter(|story| !story.is_assigned() && !story.is_blocked())
            .filter(|story| match role {
                AgentRole::Coder => match story.status {
                    StoryStatus::Pending | StoryStatus::Backlog => true,
                    StoryStatus::Failed => story.retry_count < self.config.max_retries,
                    _ => false,
                },
                AgentRole::Tester => story.status == StoryStatus::Testing,
            })
            .collect();

        // sort_by_key is stable, so submission order survives within a class
        ready.sort_by_key(|story| story.priority.rank());
        ready.into_iter().cloned().collect()
    }

    pub fn get_story(&self, story_id: &str) -> Option<&Story> {
        self.stories.get(story_id)
    }

    /// All stories in first-submission order
    pub fn stories(&self) -> Vec<&Story> {
        self.order
            .iter()
            .filter_map(|id| self.stories.get(id))
            .collect()
    }

    pub fn story_count(&self) -> usize {
        self.stories.len()
    }

    // =========================================================================
    // Agents
    // =========================================================================

    /// Add an agent to the pool and dispatch. If the durable state already
    /// holds in-flight stories under this id (a restart mid-assignment),
    /// the agent re-adopts them instead of being handed new work on top.
    pub fn register_agent(&mut self, agent: Agent) -> Result<(), CoordinatorError> {
        if self.registry.contains(&agent.id) {
            return Err(CoordinatorError::AgentExists(agent.id));
        }

        let payload = AgentRegisteredPayload {
            agent_id: agent.id.clone(),
            role: agent.role,
            port: agent.port,
        };
        let agent_id = agent.id.clone();
        log::info!("[Coordinator] Registered {} '{}'", agent.role, agent_id);
        self.registry.register(agent);

        let held: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                self.stories
                    .get(*id)
                    .map(|s| {
                        s.assigned_to.as_deref() == Some(agent_id.as_str())
                            && state_machine::is_active_status(s.status)
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for story_id in held {
            if self.registry.assign(&agent_id, &story_id).is_some() {
                log::info!(
                    "[Coordinator] Agent '{}' resumed story '{}' from a previous run",
                    agent_id,
                    story_id
                );
            }
        }

        self.bus.emit(CoordinatorEvent::AgentRegistered(payload));
        self.dispatch()
    }

    /// Remove an agent, requeue whatever it was working on, and release its
    /// locks. Unknown ids are fine: recovery calls this for agents that
    /// died with a previous process.
    pub fn unregister_agent(&mut self, agent_id: &str) -> Result<(), CoordinatorError> {
        if self.registry.unregister(agent_id).is_some() {
            log::info!("[Coordinator] Unregistered agent '{}'", agent_id);
        }

        let held: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                self.stories
                    .get(*id)
                    .map(|s| {
                        s.assigned_to.as_deref() == Some(agent_id)
                            && state_machine::is_active_status(s.status)
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let mut reverted = Vec::new();
        for story_id in &held {
            let old_status = match self.stories.get_mut(story_id) {
                Some(story) => {
                    let old = story.status;
                    story.status = StoryStatus::Backlog;
                    story.assigned_to = None;
                    old
                }
                None => continue,
            };
            log::info!(
                "[Coordinator] Story '{}' reverted to backlog (agent '{}' gone)",
                story_id,
                agent_id
            );
            reverted.push(story_id.clone());
            self.bus.emit(CoordinatorEvent::StoryUpdated(StoryUpdatedPayload {
                story_id: story_id.clone(),
                old_status,
                new_status: StoryStatus::Backlog,
            }));
        }

        let released = self.locks.release_all_for_agent(agent_id);
        if released > 0 {
            log::info!(
                "[Coordinator] Released {} lock(s) held by '{}'",
                released,
                agent_id
            );
        }

        self.bus
            .emit(CoordinatorEvent::AgentUnregistered(AgentUnregisteredPayload {
                agent_id: agent_id.to_string(),
                reverted_stories: reverted.clone(),
                released_locks: released as u32,
            }));

        if !reverted.is_empty() {
            self.save_stories()?;
        }
        if released > 0 {
            self.save_locks()?;
        }
        self.dispatch()
    }

    /// (agent id, story id) pairs for everything currently assigned
    pub fn active_assignments(&self) -> Vec<(String, String)> {
        self.registry
            .active_assignments()
            .into_iter()
            .map(|a| (a.agent_id.clone(), a.story_id.clone()))
            .collect()
    }

    // =========================================================================
    // File locks
    // =========================================================================

    /// Try to lock a path for an agent. Returns Ok(false) on contention,
    /// which is an expected outcome, not an error. A refused acquisition
    /// emits file:blocked so the conflict is observable.
    pub fn acquire_lock(
        &mut self,
        path: &str,
        agent_id: &str,
        story_id: Option<String>,
    ) -> Result<bool, CoordinatorError> {
        if !self.registry.contains(agent_id) {
            return Err(CoordinatorError::UnknownAgent(agent_id.to_string()));
        }

        let outcome = self
            .locks
            .acquire(path, agent_id, story_id.clone())
            .map_err(CoordinatorError::Persistence)?;

        match outcome {
            LockAcquire::Acquired | LockAcquire::AlreadyOwned => {
                self.save_locks()?;
                Ok(true)
            }
            LockAcquire::Conflict { owner } => {
                log::warn!(
                    "[Coordinator] Agent '{}' blocked on '{}' (held by '{}')",
                    agent_id,
                    path,
                    owner
                );
                self.bus.emit(CoordinatorEvent::FileBlocked(FileBlockedPayload {
                    path: path.to_string(),
                    owner,
                    requested_by: agent_id.to_string(),
                    story_id,
                }));
                Ok(false)
            }
        }
    }

    /// Release a path if the agent owns it; releasing something else's
    /// lock (or nothing) is a no-op
    pub fn release_lock(&mut self, path: &str, agent_id: &str) -> Result<(), CoordinatorError> {
        if self.locks.release(path, agent_id) {
            self.save_locks()?;
        }
        Ok(())
    }

    pub fn get_lock(&self, path: &str) -> Option<&FileLock> {
        self.locks.get(path)
    }

    // =========================================================================
    // Monitoring
    // =========================================================================

    pub fn stats(&self) -> CoordinatorStats {
        let mut stats = CoordinatorStats {
            total_stories: self.stories.len(),
            ..Default::default()
        };

        for story in self.stories.values() {
            match story.status {
                StoryStatus::Pending => stats.pending += 1,
                StoryStatus::Backlog => stats.backlog += 1,
                StoryStatus::InProgress => stats.in_progress += 1,
                StoryStatus::Testing => stats.testing += 1,
                StoryStatus::Done => stats.done += 1,
                StoryStatus::Failed => {
                    stats.failed += 1;
                    if story.retry_count >= self.config.max_retries {
                        stats.terminal_failures += 1;
                    }
                }
            }
        }

        stats.registered_agents = self.registry.len();
        stats.active_assignments = self.registry.active_assignments().len();
        stats.held_locks = self.locks.len();
        stats
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    // One greedy pass per role. Persists once if anything was assigned.
    fn dispatch(&mut self) -> Result<(), CoordinatorError> {
        let mut assigned_any = false;
        for role in [AgentRole::Coder, AgentRole::Tester] {
            if self.dispatch_role(role) {
                assigned_any = true;
            }
        }

        if assigned_any {
            self.save_stories()?;
        }
        Ok(())
    }

    // Pair ready stories with idle agents of a role, in order on both
    // sides. Returns whether anything was assigned.
    fn dispatch_role(&mut self, role: AgentRole) -> bool {
        let ready: Vec<String> = self
            .get_ready_stories(role)
            .iter()
            .map(|s| s.id.clone())
            .collect();
        if ready.is_empty() {
            return false;
        }

        let idle: Vec<String> = self
            .registry
            .idle_agents(role)
            .iter()
            .map(|a| a.id().to_string())
            .collect();
        if idle.is_empty() {
            return false;
        }

        let mut budget = match self.config.max_parallel {
            Some(cap) => (cap as usize).saturating_sub(self.registry.active_assignments().len()),
            None => usize::MAX,
        };

        let mut assigned_any = false;
        for (story_id, agent_id) in ready.iter().zip(idle.iter()) {
            if budget == 0 {
                log::debug!("[Coordinator] Parallel cap reached, deferring ready stories");
                break;
            }
            if self.assign_story(story_id, agent_id, role) {
                assigned_any = true;
                budget = budget.saturating_sub(1);
            }
        }
        assigned_any
    }

    fn assign_story(&mut self, story_id: &str, agent_id: &str, role: AgentRole) -> bool {
        if self.registry.assign(agent_id, story_id).is_none() {
            return false;
        }

        let (priority, files) = match self.stories.get_mut(story_id) {
            Some(story) => {
                // Coders take intake work into in_progress; testers pick up
                // stories already sitting in testing
                if role == AgentRole::Coder {
                    match state_machine::transition_state(story.status, StoryStatus::InProgress) {
                        Ok(next) => story.status = next,
                        Err(e) => {
                            log::warn!(
                                "[Coordinator] Cannot assign story '{}': {}",
                                story_id,
                                e
                            );
                            self.registry.clear_assignment_for_story(story_id);
                            return false;
                        }
                    }
                }
                story.assigned_to = Some(agent_id.to_string());
                (story.priority, story.files.clone())
            }
            None => {
                self.registry.clear_assignment_for_story(story_id);
                return false;
            }
        };

        log::info!(
            "[Coordinator] Assigned story '{}' to {} '{}'",
            story_id,
            role,
            agent_id
        );
        self.bus.emit(CoordinatorEvent::StoryAssigned(StoryAssignedPayload {
            story_id: story_id.to_string(),
            agent_id: agent_id.to_string(),
            role,
            priority,
            files,
        }));
        true
    }

    // =========================================================================
    // Internals
    // =========================================================================

    // Count a failure against the story's retry budget. The ceiling check
    // runs before the increment so a failure report against an already
    // terminal story cannot re-fire the terminal event.
    fn apply_retry_policy(&mut self, story_id: &str) {
        let max_retries = self.config.max_retries;
        let (retry_count, hit_ceiling) = {
            let story = match self.stories.get_mut(story_id) {
                Some(s) => s,
                None => return,
            };
            if story.retry_count >= max_retries {
                log::debug!(
                    "[Coordinator] Story '{}' is already terminally failed",
                    story_id
                );
                return;
            }
            story.retry_count += 1;
            (story.retry_count, story.retry_count >= max_retries)
        };

        if hit_ceiling {
            log::warn!(
                "[Coordinator] Story '{}' failed {} times, giving up on it",
                story_id,
                retry_count
            );
            self.bus
                .emit(CoordinatorEvent::StoryMaxRetries(StoryMaxRetriesPayload {
                    story_id: story_id.to_string(),
                    retry_count,
                }));
        } else {
            log::info!(
                "[Coordinator] Story '{}' failed (attempt {}/{}), eligible for retry",
                story_id,
                retry_count,
                max_retries
            );
        }
    }

    fn clear_assignment(&mut self, story_id: &str) {
        if let Some(assignment) = self.registry.clear_assignment_for_story(story_id) {
            log::debug!(
                "[Coordinator] Agent '{}' freed from story '{}'",
                assignment.agent_id,
                story_id
            );
        }
        if let Some(story) = self.stories.get_mut(story_id) {
            story.assigned_to = None;
        }
    }

    // Refresh blocked-by for everything downstream of a completed story and
    // emit story:unblocked for each one whose last blocker just cleared
    fn unblock_dependents(&mut self, completed_id: &str) {
        for dependent_id in self.graph.dependents_of(completed_id) {
            let (was_blocked, new_blocked) = match self.stories.get(&dependent_id) {
                Some(dep) => (dep.is_blocked(), compute_blocked_by(dep, &self.stories)),
                None => continue,
            };
            let now_unblocked = was_blocked && new_blocked.is_empty();

            if let Some(dep) = self.stories.get_mut(&dependent_id) {
                dep.blocked_by = new_blocked;
            }

            if now_unblocked {
                log::info!(
                    "[Coordinator] Story '{}' unblocked by completion of '{}'",
                    dependent_id,
                    completed_id
                );
                self.bus
                    .emit(CoordinatorEvent::StoryUnblocked(StoryUnblockedPayload {
                        story_id: dependent_id.clone(),
                        completed_dependency: completed_id.to_string(),
                    }));
            }
        }
    }

    fn recompute_all_blocked_by(&mut self) {
        let updates: Vec<(String, Vec<String>)> = self
            .order
            .iter()
            .filter_map(|id| self.stories.get(id))
            .map(|story| (story.id.clone(), compute_blocked_by(story, &self.stories)))
            .collect();

        for (id, blocked_by) in updates {
            if let Some(story) = self.stories.get_mut(&id) {
                story.blocked_by = blocked_by;
            }
        }
    }

    fn save_stories(&self) -> Result<(), CoordinatorError> {
        let snapshot: Vec<Story> = self
            .order
            .iter()
            .filter_map(|id| self.stories.get(id).cloned())
            .collect();

        file_storage::save_stories(&self.config.project_path, snapshot).map_err(|e| {
            log::error!("[Coordinator] Failed to persist stories: {}", e);
            CoordinatorError::Persistence(e)
        })
    }

    fn save_locks(&self) -> Result<(), CoordinatorError> {
        file_storage::save_locks(&self.config.project_path, self.locks.snapshot()).map_err(|e| {
            log::error!("[Coordinator] Failed to persist locks: {}", e);
            CoordinatorError::Persistence(e)
        })
    }
}

/// Shared, thread-safe handle to a coordinator.
///
/// Every operation runs behind one mutex, which is what keeps concurrent
/// driver threads from interleaving mutations of the story and lock tables.
/// A poisoned mutex is recovered rather than propagated so one panicking
/// driver cannot wedge the whole pool.
#[derive(Clone)]
pub struct CoordinatorHandle {
    inner: Arc<Mutex<Coordinator>>,
}

impl CoordinatorHandle {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            inner: Arc::new(Mutex::new(coordinator)),
        }
    }

    /// Run a closure with exclusive access to the coordinator
    pub fn with<R>(&self, f: impl FnOnce(&mut Coordinator) -> R) -> R {
        let mut guard = lock_mutex_recover(&self.inner);
        f(&mut guard)
    }
}
