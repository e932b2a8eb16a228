//! Events emitted after coordinator and broker state changes commit

use crate::priority::Priority;
use std::sync::{Arc, RwLock};

/// Type alias for event listener collection to reduce complexity
type EventListeners = Arc<RwLock<Vec<Box<dyn Fn(CoordinatorEvent) + Send + Sync>>>>;

/// Events emitted by the coordinator and broker
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    TaskSubmitted {
        task_id: String,
        entry_id: i64,
        priority: Priority,
        agents: Vec<String>,
    },

    TaskStarted { task_id: String, agent_id: String },

    AgentJoined { task_id: String, agent_id: String },

    ProgressReported {
        task_id: String,
        agent_id: String,
        progress: u8,
        agents: Vec<String>,
    },

    /// One agent finished; others are still working
    AgentReported {
        task_id: String,
        agent_id: String,
        remaining: usize,
    },

    TaskCompleted { task_id: String, agents: Vec<String> },

    TaskFailed {
        task_id: String,
        agents: Vec<String>,
        reason: String,
    },

    /// Task went back to pending after losing its agents
    TaskRequeued { task_id: String, reason: String },

    EntryApproved {
        entry_id: i64,
        task_id: String,
        approver: String,
    },

    EntryDeadLettered {
        entry_id: i64,
        task_id: String,
        retry_count: u32,
    },

    AgentOffline {
        agent_id: String,
        task_id: Option<String>,
    },

    MessageDelivered {
        message_id: String,
        owner: String,
        sender: String,
        subject: String,
    },
}

impl CoordinatorEvent {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskSubmitted { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::AgentJoined { task_id, .. }
            | Self::ProgressReported { task_id, .. }
            | Self::AgentReported { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskRequeued { task_id, .. }
            | Self::EntryApproved { task_id, .. }
            | Self::EntryDeadLettered { task_id, .. } => Some(task_id),
            Self::AgentOffline { task_id, .. } => task_id.as_deref(),
            Self::MessageDelivered { .. } => None,
        }
    }
}

/// Shared listener list; clones see the same listeners
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: EventListeners,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event listener
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(CoordinatorEvent) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(Box::new(listener));
        }
    }

    /// Emit an event to all listeners
    pub fn emit(&self, event: CoordinatorEvent) {
        if let Ok(listeners) = self.listeners.read() {
            for listener in listeners.iter() {
                listener(event.clone());
            }
        }
    }
}
