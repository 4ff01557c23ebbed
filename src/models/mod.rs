// Core data model for stories, file locks, and worker agents

pub mod state_machine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    Backlog,
    InProgress,
    Testing,
    /// Terminal success. Upstream drivers emit both spellings, so
    /// "completed" is accepted on input and normalized to "done".
    #[serde(alias = "completed")]
    Done,
    Failed,
}

impl StoryStatus {
    /// Returns the string representation of this status
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::Backlog => "backlog",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Testing => "testing",
            StoryStatus::Done => "done",
            StoryStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for StoryStatus {
    fn default() -> Self {
        StoryStatus::Backlog
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Sort rank, lower is more urgent
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(format!(
                "Unknown priority: '{}'. Expected one of: high, medium, low",
                s
            )),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// A unit of work tracked through the coordination lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: StoryStatus,
    /// Agent currently holding this story, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    /// Story ids that must reach done before this one is assignable
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Dependencies not yet done. Derived by the dependency graph and
    /// recomputed on load; the persisted value is a snapshot only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Paths this story expects to touch. A lock-prediction hint, never
    /// a scheduling constraint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// Number of failed attempts so far
    #[serde(default)]
    pub retry_count: u32,
}

impl Story {
    /// Create a new backlog story with default priority and no dependencies
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: StoryStatus::Backlog,
            assigned_to: None,
            dependencies: Vec::new(),
            blocked_by: Vec::new(),
            priority: Priority::default(),
            files: Vec::new(),
            retry_count: 0,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned_to.is_some()
    }

    pub fn is_blocked(&self) -> bool {
        !self.blocked_by.is_empty()
    }
}

/// Exclusive ownership of a file path by one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLock {
    pub path: String,
    /// Agent id of the owner
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    /// Story the owner was working when it took the lock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
}

impl FileLock {
    pub fn new(
        path: impl Into<String>,
        owner: impl Into<String>,
        story_id: Option<String>,
    ) -> Self {
        Self {
            path: path.into(),
            owner: owner.into(),
            acquired_at: Utc::now(),
            story_id,
        }
    }

    /// Age of the lock in seconds. Clock skew can make this negative;
    /// callers treat negative ages as fresh.
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.acquired_at).num_seconds()
    }

    /// A lock older than the threshold may be reclaimed by any contender
    pub fn is_stale(&self, stale_after_secs: u64) -> bool {
        self.age_secs() > stale_after_secs as i64
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coder,
    Tester,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Coder => "coder",
            AgentRole::Tester => "tester",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "coder" => Ok(AgentRole::Coder),
            "tester" => Ok(AgentRole::Tester),
            _ => Err(format!(
                "Unknown agent role: '{}'. Expected one of: coder, tester",
                s
            )),
        }
    }
}

/// A registered worker identity. Agents are transient registry entries and
/// are never persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub role: AgentRole,
    /// Port the agent subprocess listens on, if it runs as one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Agent {
    pub fn new(id: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: id.into(),
            role,
            port: None,
        }
    }

    pub fn coder(id: impl Into<String>) -> Self {
        Self::new(id, AgentRole::Coder)
    }

    pub fn tester(id: impl Into<String>) -> Self {
        Self::new(id, AgentRole::Tester)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}
