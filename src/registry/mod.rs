//! Agent Registry
//!
//! Tracks each agent's identity, capability set, current task, status and
//! last heartbeat.
//!
//! # Overview
//!
//! - **Registration**: agents register once with a capability set
//! - **Liveness**: heartbeats refresh `last_heartbeat`; a periodic sweep marks
//!   silent agents offline
//! - **Assignment**: binding an agent to a task moves it to `busy`
//!
//! This module is the only writer of agent status. Other components change
//! status through the `*_in` functions, which run inside the caller's
//! transaction.

mod agent;

pub use agent::{Agent, AgentStatus};

use crate::store::{decode_capabilities, encode_capabilities, fmt_ts, now_ts, parse_ts, Store};
use crate::{ConclaveError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const AGENT_COLUMNS: &str =
    "id, capabilities, current_task, status, last_heartbeat, registered_at";

fn row_to_agent(row: &Row) -> rusqlite::Result<Agent> {
    let status: String = row.get(3)?;
    Ok(Agent {
        id: row.get(0)?,
        capabilities: decode_capabilities(&row.get::<_, String>(1)?),
        current_task: row.get(2)?,
        status: status.parse().unwrap_or(AgentStatus::Error),
        last_heartbeat: parse_ts(&row.get::<_, String>(4)?),
        registered_at: parse_ts(&row.get::<_, String>(5)?),
    })
}

/// Load one agent inside an existing connection or transaction
pub(crate) fn load_in(conn: &Connection, agent_id: &str) -> Result<Agent> {
    conn.query_row(
        &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
        params![agent_id],
        row_to_agent,
    )
    .optional()?
    .ok_or_else(|| ConclaveError::not_found("agent", agent_id))
}

fn set_status_in(
    conn: &Connection,
    agent_id: &str,
    status: AgentStatus,
    current_task: Option<&str>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE agents SET status = ?2, current_task = ?3 WHERE id = ?1",
        params![agent_id, status.as_str(), current_task],
    )?;
    if changed == 0 {
        return Err(ConclaveError::not_found("agent", agent_id));
    }
    Ok(())
}

/// Bind an agent to a task and mark it busy.
///
/// Fails with `AgentBusy` when the agent is busy with a different task and
/// with `AgentUnavailable` when it is offline.
pub(crate) fn assign_in(conn: &Connection, agent_id: &str, task_id: &str) -> Result<()> {
    let agent = load_in(conn, agent_id)?;

    match agent.status {
        AgentStatus::Busy => {
            if agent.current_task.as_deref() != Some(task_id) {
                return Err(ConclaveError::AgentBusy {
                    agent_id: agent_id.to_string(),
                    current_task: agent.current_task.unwrap_or_default(),
                });
            }
            Ok(())
        }
        AgentStatus::Offline => Err(ConclaveError::AgentUnavailable(agent_id.to_string())),
        AgentStatus::Idle | AgentStatus::Error => {
            set_status_in(conn, agent_id, AgentStatus::Busy, Some(task_id))?;
            debug!(agent = agent_id, task = task_id, "Agent assigned");
            Ok(())
        }
    }
}

/// Return an agent to idle once its task reached a terminal state.
///
/// Offline agents stay offline; only their task binding is cleared.
pub(crate) fn release_in(conn: &Connection, agent_id: &str, task_id: &str) -> Result<()> {
    let agent = load_in(conn, agent_id)?;
    if agent.current_task.is_some() && agent.current_task.as_deref() != Some(task_id) {
        // Already moved on to something else
        return Ok(());
    }

    let status = match agent.status {
        AgentStatus::Offline => AgentStatus::Offline,
        _ => AgentStatus::Idle,
    };
    set_status_in(conn, agent_id, status, None)
}

fn task_in_progress_in(conn: &Connection, task_id: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1 AND status = 'in_progress')",
        params![task_id],
        |row| row.get(0),
    )?)
}

/// Put an agent into the error state after it failed its task
pub(crate) fn mark_error_in(conn: &Connection, agent_id: &str) -> Result<()> {
    set_status_in(conn, agent_id, AgentStatus::Error, None)?;
    warn!(agent = agent_id, "Agent entered error state");
    Ok(())
}

/// Agent Registry backed by the shared store
#[derive(Clone)]
pub struct AgentRegistry {
    store: Arc<Store>,
}

impl AgentRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Register a new agent with its capabilities
    pub fn register(&self, agent_id: &str, capabilities: &[String]) -> Result<Agent> {
        if agent_id.trim().is_empty() {
            return Err(ConclaveError::Other("agent id must not be empty".to_string()));
        }
        let caps = encode_capabilities(capabilities)?;

        let agent = self.store.write(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM agents WHERE id = ?1)",
                params![agent_id],
                |row| row.get(0),
            )?;
            if exists {
                return Err(ConclaveError::DuplicateAgent(agent_id.to_string()));
            }

            let now = now_ts();
            conn.execute(
                "INSERT INTO agents (id, capabilities, current_task, status, last_heartbeat, registered_at)
                 VALUES (?1, ?2, NULL, 'idle', ?3, ?3)",
                params![agent_id, caps, now],
            )?;
            load_in(conn, agent_id)
        })?;

        info!(agent = agent_id, capabilities = ?agent.capabilities, "Registered agent");
        Ok(agent)
    }

    /// Refresh an agent's heartbeat.
    ///
    /// An offline agent whose task is still in progress comes back as busy
    /// with that task; otherwise it comes back idle with no task.
    pub fn heartbeat(&self, agent_id: &str) -> Result<Agent> {
        self.store.write(|conn| {
            let agent = load_in(conn, agent_id)?;
            let now = now_ts();

            if agent.status == AgentStatus::Offline {
                let running = match agent.current_task.as_deref() {
                    Some(task_id) => task_in_progress_in(conn, task_id)?,
                    None => false,
                };
                let (status, current_task) = if running {
                    (AgentStatus::Busy, agent.current_task.as_deref())
                } else {
                    (AgentStatus::Idle, None)
                };
                conn.execute(
                    "UPDATE agents SET last_heartbeat = ?2, status = ?3, current_task = ?4
                     WHERE id = ?1",
                    params![agent_id, now, status.as_str(), current_task],
                )?;
                info!(agent = agent_id, status = %status.as_str(), "Agent back online");
            } else {
                conn.execute(
                    "UPDATE agents SET last_heartbeat = ?2 WHERE id = ?1",
                    params![agent_id, now],
                )?;
            }
            load_in(conn, agent_id)
        })
    }

    /// Mark a single agent offline
    pub fn mark_offline(&self, agent_id: &str) -> Result<Agent> {
        self.store.write(|conn| {
            let agent = load_in(conn, agent_id)?;
            set_status_in(
                conn,
                agent_id,
                AgentStatus::Offline,
                agent.current_task.as_deref(),
            )?;
            load_in(conn, agent_id)
        })
    }

    /// Mark every agent silent for longer than `timeout` as offline.
    ///
    /// Returns the agents that changed state, with their `current_task`
    /// intact so the caller can apply an orphan policy.
    pub fn sweep_offline(&self, timeout: Duration) -> Result<Vec<Agent>> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| ConclaveError::Config(format!("heartbeat timeout out of range: {}", e)))?;
        let cutoff = fmt_ts(Utc::now() - timeout);

        let swept = self.store.write(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM agents WHERE status != 'offline' AND last_heartbeat < ?1",
                AGENT_COLUMNS
            ))?;
            let stale = stmt
                .query_map(params![cutoff], row_to_agent)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for agent in &stale {
                conn.execute(
                    "UPDATE agents SET status = 'offline' WHERE id = ?1",
                    params![agent.id],
                )?;
            }
            Ok(stale)
        })?;

        if !swept.is_empty() {
            warn!(
                count = swept.len(),
                agents = ?swept.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
                "Heartbeat timeout, agents marked offline"
            );
            crate::metrics::record_agents_offline(swept.len());
        }
        Ok(swept)
    }

    /// Bind an agent to a task
    pub fn assign(&self, agent_id: &str, task_id: &str) -> Result<()> {
        self.store.write(|conn| assign_in(conn, agent_id, task_id))
    }

    /// Clear an error state so the agent can take work again
    pub fn reset(&self, agent_id: &str) -> Result<Agent> {
        self.store.write(|conn| {
            let agent = load_in(conn, agent_id)?;
            if agent.status != AgentStatus::Error {
                return Err(ConclaveError::InvalidTransition {
                    entity: "agent",
                    id: agent_id.to_string(),
                    from: agent.status.to_string(),
                    to: AgentStatus::Idle.to_string(),
                });
            }
            set_status_in(conn, agent_id, AgentStatus::Idle, None)?;
            load_in(conn, agent_id)
        })
    }

    /// Get an agent by ID
    pub fn get(&self, agent_id: &str) -> Result<Agent> {
        self.store.read(|conn| load_in(conn, agent_id))
    }

    /// Get an agent that may take new work.
    ///
    /// Fails with `AgentBusy` while it holds a task and with
    /// `AgentUnavailable` while it is offline.
    pub fn available(&self, agent_id: &str) -> Result<Agent> {
        let agent = self.get(agent_id)?;
        match agent.status {
            AgentStatus::Busy => Err(ConclaveError::AgentBusy {
                agent_id: agent.id,
                current_task: agent.current_task.unwrap_or_default(),
            }),
            AgentStatus::Offline => Err(ConclaveError::AgentUnavailable(agent.id)),
            AgentStatus::Idle | AgentStatus::Error => Ok(agent),
        }
    }

    /// All agents, ordered by ID
    pub fn list(&self) -> Result<Vec<Agent>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM agents ORDER BY id",
                AGENT_COLUMNS
            ))?;
            let agents = stmt
                .query_map([], row_to_agent)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(agents)
        })
    }

    /// Agents in a given status
    pub fn list_by_status(&self, status: AgentStatus) -> Result<Vec<Agent>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|a| a.status == status)
            .collect())
    }

    /// Idle agents declaring every required capability
    pub fn capable_agents(&self, required: &[String]) -> Result<Vec<Agent>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|a| a.status.is_assignable() && a.has_capabilities(required))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_register_and_get() {
        let registry = registry();
        let agent = registry.register("builder", &caps(&["build", "test"])).unwrap();

        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.capabilities, caps(&["build", "test"]));
        assert_eq!(registry.get("builder").unwrap(), agent);
    }

    #[test]
    fn test_register_duplicate() {
        let registry = registry();
        registry.register("builder", &caps(&["build"])).unwrap();

        let err = registry.register("builder", &caps(&["build"])).unwrap_err();
        assert!(matches!(err, ConclaveError::DuplicateAgent(id) if id == "builder"));
    }

    #[test]
    fn test_assign_busy_conflict() {
        let registry = registry();
        registry.register("a", &[]).unwrap();

        registry.assign("a", "task-1").unwrap();
        // Re-assigning the same task is a no-op
        registry.assign("a", "task-1").unwrap();

        let err = registry.assign("a", "task-2").unwrap_err();
        assert!(matches!(
            err,
            ConclaveError::AgentBusy { ref current_task, .. } if current_task == "task-1"
        ));
    }

    #[test]
    fn test_sweep_and_heartbeat_recovery() {
        let registry = registry();
        registry.register("a", &[]).unwrap();
        registry.register("b", &[]).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        registry.heartbeat("b").unwrap();

        let swept = registry.sweep_offline(Duration::from_millis(10)).unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, "a");
        assert_eq!(registry.get("a").unwrap().status, AgentStatus::Offline);
        assert_eq!(registry.get("b").unwrap().status, AgentStatus::Idle);

        // Already-offline agents are not reported twice
        assert!(registry
            .sweep_offline(Duration::from_secs(3600))
            .unwrap()
            .is_empty());

        let back = registry.heartbeat("a").unwrap();
        assert_eq!(back.status, AgentStatus::Idle);
    }

    fn insert_task(registry: &AgentRegistry, task_id: &str, status: &str) {
        registry
            .store
            .write(|conn| {
                conn.execute(
                    "INSERT INTO tasks (id, description, priority, capabilities, status, created_at)
                     VALUES (?1, 'x', 2, '[]', ?2, ?3)",
                    params![task_id, status, now_ts()],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_heartbeat_restores_busy_agent() {
        let registry = registry();
        registry.register("a", &[]).unwrap();
        insert_task(&registry, "task-1", "in_progress");
        registry.assign("a", "task-1").unwrap();
        registry.mark_offline("a").unwrap();

        let back = registry.heartbeat("a").unwrap();
        assert_eq!(back.status, AgentStatus::Busy);
        assert_eq!(back.current_task.as_deref(), Some("task-1"));

        let err = registry.assign("a", "task-2").unwrap_err();
        assert!(matches!(err, ConclaveError::AgentBusy { .. }));
    }

    #[test]
    fn test_heartbeat_clears_finished_task() {
        let registry = registry();
        registry.register("a", &[]).unwrap();
        insert_task(&registry, "task-1", "failed");
        registry.assign("a", "task-1").unwrap();
        registry.mark_offline("a").unwrap();

        let back = registry.heartbeat("a").unwrap();
        assert_eq!(back.status, AgentStatus::Idle);
        assert_eq!(back.current_task, None);
    }

    #[test]
    fn test_offline_agent_cannot_be_assigned() {
        let registry = registry();
        registry.register("a", &[]).unwrap();
        registry.mark_offline("a").unwrap();

        let err = registry.assign("a", "task-1").unwrap_err();
        assert!(matches!(err, ConclaveError::AgentUnavailable(_)));
    }

    #[test]
    fn test_capable_agents_filters_status_and_caps() {
        let registry = registry();
        registry.register("builder", &caps(&["build"])).unwrap();
        registry.register("tester", &caps(&["test"])).unwrap();
        registry.register("both", &caps(&["build", "test"])).unwrap();
        registry.assign("both", "task-1").unwrap();

        let capable = registry.capable_agents(&caps(&["build"])).unwrap();
        let ids: Vec<_> = capable.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["builder"]);
    }

    #[test]
    fn test_reset_requires_error_state() {
        let registry = registry();
        registry.register("a", &[]).unwrap();
        assert!(registry.reset("a").is_err());

        registry
            .store
            .write(|conn| mark_error_in(conn, "a"))
            .unwrap();
        assert_eq!(registry.reset("a").unwrap().status, AgentStatus::Idle);
    }
}
