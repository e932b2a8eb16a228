//! Agent representation and liveness states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Agent status indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Ready to take a task
    Idle,

    /// Executing a task
    Busy,

    /// Last task failed; needs a reset or a new assignment
    Error,

    /// Missed its heartbeat deadline
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }

    /// Whether the agent may accept a new assignment
    pub fn is_assignable(&self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = crate::ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "error" => Ok(Self::Error),
            "offline" => Ok(Self::Offline),
            other => Err(crate::ConclaveError::Storage(format!(
                "unknown agent status '{}'",
                other
            ))),
        }
    }
}

/// A registered worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier supplied at registration
    pub id: String,

    /// Declared capabilities (sorted, unique)
    pub capabilities: Vec<String>,

    /// Task currently being executed
    pub current_task: Option<String>,

    pub status: AgentStatus,

    pub last_heartbeat: DateTime<Utc>,

    pub registered_at: DateTime<Utc>,
}

impl Agent {
    /// Whether every required capability is declared by this agent
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|cap| self.capabilities.contains(cap))
    }

    /// Time since the last heartbeat
    pub fn silence(&self) -> chrono::Duration {
        Utc::now() - self.last_heartbeat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(caps: &[&str]) -> Agent {
        Agent {
            id: "a".to_string(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            current_task: None,
            status: AgentStatus::Idle,
            last_heartbeat: Utc::now(),
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_capability_subset() {
        let a = agent(&["build", "test"]);
        assert!(a.has_capabilities(&["build".to_string()]));
        assert!(a.has_capabilities(&[]));
        assert!(!a.has_capabilities(&["deploy".to_string()]));
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            AgentStatus::Idle,
            AgentStatus::Busy,
            AgentStatus::Error,
            AgentStatus::Offline,
        ] {
            assert_eq!(status.as_str().parse::<AgentStatus>().unwrap(), status);
        }
        assert!(AgentStatus::Idle.is_assignable());
        assert!(!AgentStatus::Busy.is_assignable());
        assert!(!AgentStatus::Offline.is_assignable());
    }
}
