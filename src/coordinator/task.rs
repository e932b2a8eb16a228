//! Task records and submission types

use crate::priority::Priority;
use crate::ConclaveError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task lifecycle state
///
/// `pending -> in_progress -> {completed, failed}`; a pending task can also
/// fail directly when its queue entry is rejected or dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Pending and in-progress tasks hold their resource key
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ConclaveError::Other(format!(
                "Invalid task status '{}'. Must be one of: pending, in_progress, completed, failed",
                other
            ))),
        }
    }
}

/// What happens to an in-progress task whose agent goes offline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Keep the task running; the agent may come back
    #[default]
    LeaveRunning,

    /// Fail the task with an "agent offline" reason
    Fail,

    /// Return the task to pending and queue it again
    Reassign,
}

/// One agent's share of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub agent_id: String,

    /// Named at submission rather than added by `start`
    pub candidate: bool,

    /// The agent has begun work
    pub started: bool,

    pub progress: u8,

    /// Result text once the agent completed
    pub result: Option<String>,

    pub reported_at: Option<DateTime<Utc>>,
}

impl Assignment {
    pub fn has_reported(&self) -> bool {
        self.reported_at.is_some()
    }
}

/// A unit of work tracked by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub priority: Priority,
    pub capabilities: Vec<String>,
    pub resource_key: Option<String>,
    pub status: TaskStatus,

    /// Mean of the assigned agents' progress
    pub progress: u8,

    /// Failure reason
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assignments: Vec<Assignment>,
}

impl Task {
    pub fn assignment(&self, agent_id: &str) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.agent_id == agent_id)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.assignments.iter().map(|a| a.agent_id.clone()).collect()
    }

    /// Whether the assignee set was fixed at submission
    pub fn has_candidates(&self) -> bool {
        self.assignments.iter().any(|a| a.candidate)
    }

    pub fn all_reported(&self) -> bool {
        !self.assignments.is_empty() && self.assignments.iter().all(Assignment::has_reported)
    }
}

/// Compact status answer for external callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub agents: Vec<String>,
    pub error: Option<String>,
}

impl From<&Task> for TaskStatusView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            progress: task.progress,
            agents: task.agent_ids(),
            error: task.error.clone(),
        }
    }
}

/// Input to `submit`
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub description: String,
    pub priority: Priority,
    pub capabilities: Vec<String>,

    /// Only one active task may hold a given key
    pub resource_key: Option<String>,

    /// Agents expected to work on the task; every one of them must complete
    pub candidate_agents: Vec<String>,

    /// Skip supervisor approval in the broker
    pub auto_approve: bool,
}

impl SubmitRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_resource(mut self, key: impl Into<String>) -> Self {
        self.resource_key = Some(key.into());
        self
    }

    pub fn with_candidate(mut self, agent_id: impl Into<String>) -> Self {
        self.candidate_agents.push(agent_id.into());
        self
    }

    pub fn auto_approved(mut self) -> Self {
        self.auto_approve = true;
        self
    }
}
