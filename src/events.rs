// Event names and payload structures emitted by the coordinator
// An external layer subscribes to these for UI/monitoring; delivery never
// blocks a dispatch decision

use crate::models::{AgentRole, Priority, StoryStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

// Event name constants
pub const EVENT_STORY_ASSIGNED: &str = "story:assigned";
pub const EVENT_STORY_UPDATED: &str = "story:updated";
pub const EVENT_STORY_UNBLOCKED: &str = "story:unblocked";
pub const EVENT_STORY_MAX_RETRIES: &str = "story:maxRetries";
pub const EVENT_FILE_BLOCKED: &str = "file:blocked";
pub const EVENT_AGENT_REGISTERED: &str = "agent:registered";
pub const EVENT_AGENT_UNREGISTERED: &str = "agent:unregistered";

/// Payload for story assignment events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryAssignedPayload {
    pub story_id: String,
    pub agent_id: String,
    pub role: AgentRole,
    pub priority: Priority,
    /// Paths the story declared it will touch (lock-prediction hint)
    pub files: Vec<String>,
}

/// Payload for story status change events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryUpdatedPayload {
    pub story_id: String,
    pub old_status: StoryStatus,
    pub new_status: StoryStatus,
}

/// Payload for story unblocked events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryUnblockedPayload {
    pub story_id: String,
    /// The dependency whose completion cleared the last blocker
    pub completed_dependency: String,
}

/// Payload for terminal failure events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryMaxRetriesPayload {
    pub story_id: String,
    pub retry_count: u32,
}

/// Payload for file lock conflict events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileBlockedPayload {
    pub path: String,
    /// Agent currently holding the lock
    pub owner: String,
    /// Agent whose acquisition was refused
    pub requested_by: String,
    pub story_id: Option<String>,
}

/// Payload for agent registration events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegisteredPayload {
    pub agent_id: String,
    pub role: AgentRole,
    pub port: Option<u16>,
}

/// Payload for agent unregistration events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUnregisteredPayload {
    pub agent_id: String,
    /// Stories reverted to backlog because the agent held them
    pub reverted_stories: Vec<String>,
    /// Number of file locks released
    pub released_locks: u32,
}

/// A coordination event, tagged with its wire name when serialized
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum CoordinatorEvent {
    #[serde(rename = "story:assigned")]
    StoryAssigned(StoryAssignedPayload),
    #[serde(rename = "story:updated")]
    StoryUpdated(StoryUpdatedPayload),
    #[serde(rename = "story:unblocked")]
    StoryUnblocked(StoryUnblockedPayload),
    #[serde(rename = "story:maxRetries")]
    StoryMaxRetries(StoryMaxRetriesPayload),
    #[serde(rename = "file:blocked")]
    FileBlocked(FileBlockedPayload),
    #[serde(rename = "agent:registered")]
    AgentRegistered(AgentRegisteredPayload),
    #[serde(rename = "agent:unregistered")]
    AgentUnregistered(AgentUnregisteredPayload),
}

impl CoordinatorEvent {
    /// The event's wire name, matching the EVENT_* constants
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorEvent::StoryAssigned(_) => EVENT_STORY_ASSIGNED,
            CoordinatorEvent::StoryUpdated(_) => EVENT_STORY_UPDATED,
            CoordinatorEvent::StoryUnblocked(_) => EVENT_STORY_UNBLOCKED,
            CoordinatorEvent::StoryMaxRetries(_) => EVENT_STORY_MAX_RETRIES,
            CoordinatorEvent::FileBlocked(_) => EVENT_FILE_BLOCKED,
            CoordinatorEvent::AgentRegistered(_) => EVENT_AGENT_REGISTERED,
            CoordinatorEvent::AgentUnregistered(_) => EVENT_AGENT_UNREGISTERED,
        }
    }
}

/// Fan-out of coordinator events to telemetry subscribers.
///
/// Sends are non-blocking (unbounded channels); a subscriber that dropped
/// its receiver is pruned on the next emit.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Vec<UnboundedSender<CoordinatorEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    /// Register a new subscriber and return its receiving end
    pub fn subscribe(&mut self) -> UnboundedReceiver<CoordinatorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver an event to every live subscriber
    pub fn emit(&mut self, event: CoordinatorEvent) {
        log::debug!("[EventBus] emit {}", event.name());
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
