//! Task Coordinator
//!
//! The state machine tracking task ownership, multi-agent completion and
//! the routing of results into the inbox.
//!
//! # Overview
//!
//! - **Submit** checks resource conflicts, validates candidate agents and
//!   enqueues a broker entry, all in one immediate transaction
//! - **Start / join** bind agents to a task through the registry
//! - **Progress** is tracked per agent; the task's progress is their mean
//! - **Complete** waits for every assigned agent; **fail** is fail-fast
//!
//! Terminal tasks are appended to a bounded history log and produce a
//! message in the results owner's inbox. Every committed change is emitted
//! as a [`CoordinatorEvent`].

mod event;
mod task;

pub use event::{CoordinatorEvent, EventBus};
pub use task::{Assignment, OrphanPolicy, SubmitRequest, Task, TaskStatus, TaskStatusView};

use crate::broker::{self, Broker};
use crate::config::{CoordinatorConfig, InboxConfig};
use crate::inbox::{self, DeliverRequest};
use crate::priority::Priority;
use crate::registry::{self, Agent};
use crate::store::{decode_capabilities, encode_capabilities, now_ts, parse_ts, parse_ts_opt, Store};
use crate::{metrics, ConclaveError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sender name on coordinator-generated messages
pub const COORDINATOR_SENDER: &str = "coordinator";

/// Settings needed wherever a task reaches a terminal state
#[derive(Debug, Clone, Default)]
pub struct TaskSettings {
    pub coordinator: CoordinatorConfig,
    pub inbox: InboxConfig,
}

/// Outcome of a terminal transition, for event emission after commit
pub(crate) struct Finished {
    pub task: Task,
    pub message_id: String,
}

const TASK_COLUMNS: &str = "id, description, priority, capabilities, resource_key, status, \
     progress, error, created_at, started_at, completed_at";

pub(crate) fn load_task_in(conn: &Connection, task_id: &str) -> Result<Task> {
    let mut task = conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![task_id],
            |row| {
                let status: String = row.get(5)?;
                Ok(Task {
                    id: row.get(0)?,
                    description: row.get(1)?,
                    priority: Priority::from_rank(row.get(2)?),
                    capabilities: decode_capabilities(&row.get::<_, String>(3)?),
                    resource_key: row.get(4)?,
                    status: status.parse().unwrap_or(TaskStatus::Failed),
                    progress: row.get(6)?,
                    error: row.get(7)?,
                    created_at: parse_ts(&row.get::<_, String>(8)?),
                    started_at: parse_ts_opt(row.get(9)?),
                    completed_at: parse_ts_opt(row.get(10)?),
                    assignments: Vec::new(),
                })
            },
        )
        .optional()?
        .ok_or_else(|| ConclaveError::not_found("task", task_id))?;

    let mut stmt = conn.prepare(
        "SELECT agent_id, candidate, started, progress, result, reported_at
         FROM task_assignments WHERE task_id = ?1 ORDER BY rowid",
    )?;
    task.assignments = stmt
        .query_map(params![task_id], |row| {
            Ok(Assignment {
                agent_id: row.get(0)?,
                candidate: row.get(1)?,
                started: row.get(2)?,
                progress: row.get(3)?,
                result: row.get(4)?,
                reported_at: parse_ts_opt(row.get(5)?),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(task)
}

fn invalid_transition(task: &Task, to: TaskStatus) -> ConclaveError {
    ConclaveError::InvalidTransition {
        entity: "task",
        id: task.id.clone(),
        from: task.status.to_string(),
        to: to.to_string(),
    }
}

fn not_assigned(task_id: &str, agent_id: &str) -> ConclaveError {
    ConclaveError::NotAssigned {
        task_id: task_id.to_string(),
        agent_id: agent_id.to_string(),
    }
}

fn recompute_progress_in(conn: &Connection, task_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET progress = COALESCE(
             (SELECT CAST(AVG(progress) AS INTEGER) FROM task_assignments WHERE task_id = ?1), 0)
         WHERE id = ?1",
        params![task_id],
    )?;
    Ok(())
}

fn mark_started_in(conn: &Connection, task_id: &str, agent_id: &str) -> Result<()> {
    registry::assign_in(conn, agent_id, task_id)?;
    conn.execute(
        "UPDATE task_assignments SET started = 1 WHERE task_id = ?1 AND agent_id = ?2",
        params![task_id, agent_id],
    )?;
    Ok(())
}

fn append_history_in(conn: &Connection, task: &Task, history_limit: usize) -> Result<()> {
    conn.execute(
        "INSERT INTO task_history (task_id, status, snapshot, recorded_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            task.id,
            task.status.as_str(),
            serde_json::to_string(task)?,
            now_ts()
        ],
    )?;
    conn.execute(
        "DELETE FROM task_history
         WHERE seq NOT IN (SELECT seq FROM task_history ORDER BY seq DESC LIMIT ?1)",
        params![history_limit as i64],
    )?;
    Ok(())
}

fn deliver_outcome_in(
    conn: &Connection,
    settings: &TaskSettings,
    task: &Task,
    subject: String,
    body: String,
) -> Result<String> {
    let request = DeliverRequest::new(
        settings.coordinator.results_owner.clone(),
        COORDINATOR_SENDER,
        subject,
        body,
    )
    .with_thread(task.id.clone())
    .with_priority(task.priority)
    .with_header("X-Conclave-Task", task.id.clone())
    .with_header("X-Conclave-Status", task.status.as_str())
    .with_tag("task-result");

    inbox::deliver_in(conn, &settings.inbox, &request)
}

/// Fail a task immediately.
///
/// `agent_id` is the reporting agent, which goes to the error state even if
/// it never started; every other started agent returns to idle. Broker-initiated failures pass
/// `None`.
pub(crate) fn fail_in(
    conn: &Connection,
    settings: &TaskSettings,
    task_id: &str,
    agent_id: Option<&str>,
    reason: &str,
) -> Result<Finished> {
    let task = load_task_in(conn, task_id)?;
    if task.status.is_terminal() {
        return Err(invalid_transition(&task, TaskStatus::Failed));
    }

    conn.execute(
        "UPDATE tasks SET status = 'failed', error = ?2, completed_at = ?3 WHERE id = ?1",
        params![task_id, reason, now_ts()],
    )?;

    for assignment in &task.assignments {
        if Some(assignment.agent_id.as_str()) == agent_id {
            // An unstarted reporter busy elsewhere keeps its other task
            let agent = registry::load_in(conn, &assignment.agent_id)?;
            let elsewhere = agent
                .current_task
                .as_deref()
                .is_some_and(|current| current != task_id);
            if assignment.started || !elsewhere {
                registry::mark_error_in(conn, &assignment.agent_id)?;
            }
        } else if assignment.started {
            registry::release_in(conn, &assignment.agent_id, task_id)?;
        }
    }
    let task = load_task_in(conn, task_id)?;
    append_history_in(conn, &task, settings.coordinator.history_limit)?;

    let message_id = deliver_outcome_in(
        conn,
        settings,
        &task,
        format!("Task {} failed", task.id),
        format!("{}\n\nReason: {}\n", task.description, reason),
    )?;

    Ok(Finished { task, message_id })
}

/// Return an in-progress task to pending, releasing its agents and
/// dropping assignments that `start` added. Returns whether anything changed.
pub(crate) fn reset_to_pending_in(conn: &Connection, task_id: &str) -> Result<bool> {
    let task = load_task_in(conn, task_id)?;
    if task.status != TaskStatus::InProgress {
        return Ok(false);
    }

    for assignment in task.assignments.iter().filter(|a| a.started) {
        registry::release_in(conn, &assignment.agent_id, task_id)?;
    }
    conn.execute(
        "DELETE FROM task_assignments WHERE task_id = ?1 AND candidate = 0",
        params![task_id],
    )?;
    conn.execute(
        "UPDATE task_assignments
         SET started = 0, progress = 0, result = NULL, reported_at = NULL
         WHERE task_id = ?1",
        params![task_id],
    )?;
    conn.execute(
        "UPDATE tasks SET status = 'pending', progress = 0, started_at = NULL WHERE id = ?1",
        params![task_id],
    )?;
    Ok(true)
}

fn announce_message(events: &EventBus, settings: &TaskSettings, task: &Task, message_id: String) {
    events.emit(CoordinatorEvent::MessageDelivered {
        message_id,
        owner: settings.coordinator.results_owner.clone(),
        sender: COORDINATOR_SENDER.to_string(),
        subject: format!("Task {} {}", task.id, task.status),
    });
}

/// Emit the events for a committed failure
pub(crate) fn announce_failure(events: &EventBus, settings: &TaskSettings, finished: Finished) {
    metrics::record_task_finished(TaskStatus::Failed);
    events.emit(CoordinatorEvent::TaskFailed {
        task_id: finished.task.id.clone(),
        agents: finished.task.agent_ids(),
        reason: finished.task.error.clone().unwrap_or_default(),
    });
    announce_message(events, settings, &finished.task, finished.message_id);
}

/// Task Coordinator
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<Store>,
    broker: Broker,
    settings: TaskSettings,
    events: EventBus,
}

impl Coordinator {
    pub fn new(
        store: Arc<Store>,
        broker: Broker,
        config: CoordinatorConfig,
        inbox: InboxConfig,
    ) -> Self {
        let settings = TaskSettings {
            coordinator: config,
            inbox,
        };
        let events = EventBus::new();
        Self {
            broker: broker
                .with_task_settings(settings.clone())
                .with_events(events.clone()),
            store,
            settings,
            events,
        }
    }

    /// Share an event bus with the broker and other components
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.broker = self.broker.with_events(events.clone());
        self.events = events;
        self
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.settings.coordinator
    }

    /// Create a pending task and enqueue it.
    ///
    /// Fails with `Conflict` when another pending or in-progress task holds
    /// the same resource key.
    pub fn submit(&self, req: SubmitRequest) -> Result<Task> {
        let caps = encode_capabilities(&req.capabilities)?;
        let auto_approve = req.auto_approve || !self.broker.config().require_manual_approval;

        let (task, entry_id) = self.store.write(|conn| {
            if let Some(key) = &req.resource_key {
                let holder: Option<String> = conn
                    .query_row(
                        "SELECT id FROM tasks
                         WHERE resource_key = ?1 AND status IN ('pending', 'in_progress')
                         ORDER BY created_at LIMIT 1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(task_id) = holder {
                    return Err(ConclaveError::Conflict {
                        task_id,
                        resource_key: key.clone(),
                    });
                }
            }

            for agent in &req.candidate_agents {
                registry::load_in(conn, agent)?;
            }

            let task_id = uuid::Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO tasks (id, description, priority, capabilities, resource_key,
                                    status, progress, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6)",
                params![
                    task_id,
                    req.description,
                    req.priority.rank(),
                    caps,
                    req.resource_key,
                    now_ts()
                ],
            )?;
            for agent in &req.candidate_agents {
                conn.execute(
                    "INSERT OR IGNORE INTO task_assignments (task_id, agent_id, candidate)
                     VALUES (?1, ?2, 1)",
                    params![task_id, agent],
                )?;
            }

            let entry_id = broker::enqueue_in(conn, &task_id, req.priority, &caps, auto_approve)?;
            Ok((load_task_in(conn, &task_id)?, entry_id))
        })?;

        info!(
            task = %task.id,
            priority = %task.priority,
            entry = entry_id,
            auto_approve,
            "Task submitted"
        );
        metrics::record_enqueued(task.priority);
        self.events.emit(CoordinatorEvent::TaskSubmitted {
            task_id: task.id.clone(),
            entry_id,
            priority: task.priority,
            agents: task.agent_ids(),
        });
        Ok(task)
    }

    /// Move a pending task to in-progress under `agent_id`
    pub fn start(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let task = self.store.write(|conn| {
            let task = load_task_in(conn, task_id)?;
            if task.status != TaskStatus::Pending {
                return Err(invalid_transition(&task, TaskStatus::InProgress));
            }

            if task.has_candidates() {
                if task.assignment(agent_id).is_none() {
                    return Err(not_assigned(task_id, agent_id));
                }
            } else {
                conn.execute(
                    "INSERT OR IGNORE INTO task_assignments (task_id, agent_id, candidate)
                     VALUES (?1, ?2, 0)",
                    params![task_id, agent_id],
                )?;
            }

            mark_started_in(conn, task_id, agent_id)?;
            conn.execute(
                "UPDATE tasks SET status = 'in_progress', started_at = ?2 WHERE id = ?1",
                params![task_id, now_ts()],
            )?;
            load_task_in(conn, task_id)
        })?;

        info!(task = task_id, agent = agent_id, "Task started");
        self.events.emit(CoordinatorEvent::TaskStarted {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
        });
        Ok(task)
    }

    /// Another assigned agent begins work on an in-progress task
    pub fn join(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let (task, joined) = self.store.write(|conn| {
            let task = load_task_in(conn, task_id)?;
            if task.status != TaskStatus::InProgress {
                return Err(invalid_transition(&task, TaskStatus::InProgress));
            }
            let assignment = task
                .assignment(agent_id)
                .ok_or_else(|| not_assigned(task_id, agent_id))?;
            if assignment.started {
                return Ok((task, false));
            }

            mark_started_in(conn, task_id, agent_id)?;
            Ok((load_task_in(conn, task_id)?, true))
        })?;

        if joined {
            debug!(task = task_id, agent = agent_id, "Agent joined task");
            self.events.emit(CoordinatorEvent::AgentJoined {
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
            });
        }
        Ok(task)
    }

    /// Record an agent's progress.
    ///
    /// `percent` must lie in [0, 100] and never decrease for the same agent;
    /// otherwise nothing changes and `InvalidProgress` is returned.
    pub fn report_progress(&self, task_id: &str, agent_id: &str, percent: i64) -> Result<Task> {
        let task = self.store.write(|conn| {
            let task = load_task_in(conn, task_id)?;
            if task.status != TaskStatus::InProgress {
                return Err(invalid_transition(&task, TaskStatus::InProgress));
            }
            let assignment = task
                .assignment(agent_id)
                .ok_or_else(|| not_assigned(task_id, agent_id))?;
            if assignment.has_reported() {
                return Err(ConclaveError::AlreadyReported {
                    task_id: task_id.to_string(),
                    agent_id: agent_id.to_string(),
                });
            }
            if !(0..=100).contains(&percent) || percent < assignment.progress as i64 {
                return Err(ConclaveError::InvalidProgress {
                    task_id: task_id.to_string(),
                    current: assignment.progress,
                    requested: percent,
                });
            }

            if !assignment.started {
                mark_started_in(conn, task_id, agent_id)?;
            }
            conn.execute(
                "UPDATE task_assignments SET progress = ?3 WHERE task_id = ?1 AND agent_id = ?2",
                params![task_id, agent_id, percent],
            )?;
            recompute_progress_in(conn, task_id)?;
            load_task_in(conn, task_id)
        })?;

        debug!(task = task_id, agent = agent_id, percent, progress = task.progress, "Progress reported");
        self.events.emit(CoordinatorEvent::ProgressReported {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            progress: task.progress,
            agents: task.agent_ids(),
        });
        Ok(task)
    }

    /// Record an agent's result. The task completes once every assigned
    /// agent has reported.
    pub fn complete(&self, task_id: &str, agent_id: &str, result: &str) -> Result<Task> {
        let settings = &self.settings;

        let (task, message_id) = self.store.write(|conn| {
            let task = load_task_in(conn, task_id)?;
            if task.status != TaskStatus::InProgress {
                return Err(invalid_transition(&task, TaskStatus::Completed));
            }
            let assignment = task
                .assignment(agent_id)
                .ok_or_else(|| not_assigned(task_id, agent_id))?;
            if assignment.has_reported() {
                return Err(ConclaveError::AlreadyReported {
                    task_id: task_id.to_string(),
                    agent_id: agent_id.to_string(),
                });
            }

            if !assignment.started {
                mark_started_in(conn, task_id, agent_id)?;
            }
            conn.execute(
                "UPDATE task_assignments SET progress = 100, result = ?3, reported_at = ?4
                 WHERE task_id = ?1 AND agent_id = ?2",
                params![task_id, agent_id, result, now_ts()],
            )?;
            recompute_progress_in(conn, task_id)?;

            let task = load_task_in(conn, task_id)?;
            if !task.all_reported() {
                return Ok((task, None));
            }

            conn.execute(
                "UPDATE tasks SET status = 'completed', progress = 100, completed_at = ?2
                 WHERE id = ?1",
                params![task_id, now_ts()],
            )?;
            for assignment in &task.assignments {
                registry::release_in(conn, &assignment.agent_id, task_id)?;
            }

            let task = load_task_in(conn, task_id)?;
            append_history_in(conn, &task, settings.coordinator.history_limit)?;

            let mut body = format!("{}\n\n", task.description);
            for assignment in &task.assignments {
                body.push_str(&format!(
                    "[{}] {}\n",
                    assignment.agent_id,
                    assignment.result.as_deref().unwrap_or("")
                ));
            }
            let message_id = deliver_outcome_in(
                conn,
                settings,
                &task,
                format!("Task {} completed", task.id),
                body,
            )?;
            Ok((task, Some(message_id)))
        })?;

        match message_id {
            Some(message_id) => {
                info!(task = task_id, agents = task.assignments.len(), "Task completed");
                metrics::record_task_finished(TaskStatus::Completed);
                self.events.emit(CoordinatorEvent::TaskCompleted {
                    task_id: task_id.to_string(),
                    agents: task.agent_ids(),
                });
                announce_message(&self.events, &self.settings, &task, message_id);
            }
            None => {
                let remaining = task.assignments.iter().filter(|a| !a.has_reported()).count();
                debug!(task = task_id, agent = agent_id, remaining, "Agent reported");
                self.events.emit(CoordinatorEvent::AgentReported {
                    task_id: task_id.to_string(),
                    agent_id: agent_id.to_string(),
                    remaining,
                });
            }
        }
        Ok(task)
    }

    /// Fail a task on behalf of one of its agents
    pub fn fail(&self, task_id: &str, agent_id: &str, reason: &str) -> Result<Task> {
        let settings = &self.settings;

        let finished = self.store.write(|conn| {
            let task = load_task_in(conn, task_id)?;
            if task.status.is_terminal() {
                return Err(invalid_transition(&task, TaskStatus::Failed));
            }
            if task.assignment(agent_id).is_none() {
                return Err(not_assigned(task_id, agent_id));
            }
            fail_in(conn, settings, task_id, Some(agent_id), reason)
        })?;

        warn!(task = task_id, agent = agent_id, reason, "Task failed");
        announce_failure(&self.events, &self.settings, finished);
        Ok(self.get_task(task_id)?)
    }

    /// Apply the configured orphan policy to agents that just went offline.
    /// Returns the ids of tasks that were failed or re-queued.
    pub fn handle_offline_agents(&self, agents: &[Agent]) -> Result<Vec<String>> {
        let policy = self.settings.coordinator.orphan_policy;
        let mut affected = Vec::new();

        for agent in agents {
            self.events.emit(CoordinatorEvent::AgentOffline {
                agent_id: agent.id.clone(),
                task_id: agent.current_task.clone(),
            });

            let Some(task_id) = agent.current_task.as_deref() else {
                continue;
            };

            match policy {
                OrphanPolicy::LeaveRunning => {
                    info!(task = task_id, agent = %agent.id, "Agent offline, leaving task running");
                }
                OrphanPolicy::Fail => {
                    let reason = format!("agent {} went offline", agent.id);
                    let settings = &self.settings;
                    let finished = self.store.write(|conn| {
                        let task = load_task_in(conn, task_id)?;
                        if task.status != TaskStatus::InProgress {
                            return Ok(None);
                        }
                        fail_in(conn, settings, task_id, None, &reason).map(Some)
                    })?;
                    if let Some(finished) = finished {
                        warn!(task = task_id, agent = %agent.id, "Orphaned task failed");
                        announce_failure(&self.events, &self.settings, finished);
                        affected.push(task_id.to_string());
                    }
                }
                OrphanPolicy::Reassign => {
                    let requeued = self.store.write(|conn| {
                        if !reset_to_pending_in(conn, task_id)? {
                            return Ok(false);
                        }
                        let task = load_task_in(conn, task_id)?;
                        broker::reopen_in(conn, &task)?;
                        Ok(true)
                    })?;
                    if requeued {
                        warn!(task = task_id, agent = %agent.id, "Orphaned task re-queued");
                        self.events.emit(CoordinatorEvent::TaskRequeued {
                            task_id: task_id.to_string(),
                            reason: format!("agent {} went offline", agent.id),
                        });
                        affected.push(task_id.to_string());
                    }
                }
            }
        }

        Ok(affected)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        self.store.read(|conn| load_task_in(conn, task_id))
    }

    pub fn get_task_status(&self, task_id: &str) -> Result<TaskStatusView> {
        Ok(TaskStatusView::from(&self.get_task(task_id)?))
    }

    /// Tasks in creation order, optionally filtered by status
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM tasks WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at, rowid",
            )?;
            let ids = stmt
                .query_map(params![status.map(|s| s.as_str())], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            ids.iter().map(|id| load_task_in(conn, id)).collect()
        })
    }

    /// Most recent terminal tasks, newest first
    pub fn history(&self, limit: usize) -> Result<Vec<Task>> {
        self.store.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT snapshot FROM task_history ORDER BY seq DESC LIMIT ?1")?;
            let snapshots = stmt
                .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            snapshots
                .iter()
                .map(|s| serde_json::from_str(s).map_err(ConclaveError::from))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::inbox::{FolderType, InboxStore};
    use crate::registry::{AgentRegistry, AgentStatus};
    use std::sync::Mutex;

    struct Fixture {
        store: Arc<Store>,
        registry: AgentRegistry,
        coordinator: Coordinator,
    }

    fn fixture_with(config: CoordinatorConfig) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let broker = Broker::new(store.clone(), BrokerConfig::default());
        let coordinator = Coordinator::new(store.clone(), broker, config, InboxConfig::default());
        let registry = AgentRegistry::new(store.clone());
        for agent in ["a", "b", "c"] {
            registry.register(agent, &["build".to_string()]).unwrap();
        }
        Fixture {
            store,
            registry,
            coordinator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CoordinatorConfig::default())
    }

    #[test]
    fn test_submit_creates_pending_task_and_entry() {
        let f = fixture();
        let task = f
            .coordinator
            .submit(SubmitRequest::new("compile").with_capability("build"))
            .unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.capabilities, vec!["build"]);
        let entry = f.coordinator.broker().dequeue(&["build".to_string()]).unwrap();
        assert_eq!(entry.unwrap().task_id, task.id);
    }

    #[test]
    fn test_resource_conflict_names_holder() {
        let f = fixture();
        let first = f
            .coordinator
            .submit(SubmitRequest::new("migrate").with_resource("users-table"))
            .unwrap();

        let err = f
            .coordinator
            .submit(SubmitRequest::new("backfill").with_resource("users-table"))
            .unwrap_err();
        match err {
            ConclaveError::Conflict {
                task_id,
                resource_key,
            } => {
                assert_eq!(task_id, first.id);
                assert_eq!(resource_key, "users-table");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(f.coordinator.list_tasks(None).unwrap().len(), 1);
    }

    #[test]
    fn test_resource_released_after_terminal_state() {
        let f = fixture();
        let first = f
            .coordinator
            .submit(SubmitRequest::new("migrate").with_resource("users-table"))
            .unwrap();
        f.coordinator.start(&first.id, "a").unwrap();
        f.coordinator.complete(&first.id, "a", "ok").unwrap();

        assert!(f
            .coordinator
            .submit(SubmitRequest::new("again").with_resource("users-table"))
            .is_ok());
    }

    #[test]
    fn test_unknown_candidate_rejected() {
        let f = fixture();
        let err = f
            .coordinator
            .submit(SubmitRequest::new("x").with_candidate("ghost"))
            .unwrap_err();
        assert!(matches!(err, ConclaveError::NotFound { entity: "agent", .. }));
        assert!(f.coordinator.list_tasks(None).unwrap().is_empty());
    }

    #[test]
    fn test_progress_must_not_regress() {
        let f = fixture();
        let task = f.coordinator.submit(SubmitRequest::new("x")).unwrap();
        f.coordinator.start(&task.id, "a").unwrap();

        f.coordinator.report_progress(&task.id, "a", 30).unwrap();
        f.coordinator.report_progress(&task.id, "a", 70).unwrap();
        let err = f.coordinator.report_progress(&task.id, "a", 30).unwrap_err();
        assert!(matches!(
            err,
            ConclaveError::InvalidProgress {
                current: 70,
                requested: 30,
                ..
            }
        ));
        assert!(f.coordinator.report_progress(&task.id, "a", 101).is_err());
        assert_eq!(f.coordinator.get_task(&task.id).unwrap().progress, 70);
    }

    #[test]
    fn test_multi_agent_completion() {
        let f = fixture();
        let task = f
            .coordinator
            .submit(SubmitRequest::new("x").with_candidate("a").with_candidate("b"))
            .unwrap();

        assert!(matches!(
            f.coordinator.start(&task.id, "c").unwrap_err(),
            ConclaveError::NotAssigned { .. }
        ));
        f.coordinator.start(&task.id, "a").unwrap();
        f.coordinator.join(&task.id, "b").unwrap();
        f.coordinator.report_progress(&task.id, "b", 50).unwrap();

        let after_a = f.coordinator.complete(&task.id, "a", "half").unwrap();
        assert_eq!(after_a.status, TaskStatus::InProgress);
        assert_eq!(after_a.progress, 75);
        assert!(matches!(
            f.coordinator.complete(&task.id, "a", "again").unwrap_err(),
            ConclaveError::AlreadyReported { .. }
        ));

        let done = f.coordinator.complete(&task.id, "b", "rest").unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());
        assert_eq!(f.registry.get("a").unwrap().status, AgentStatus::Idle);
        assert_eq!(f.registry.get("b").unwrap().status, AgentStatus::Idle);

        let inbox = InboxStore::new(f.store.clone(), InboxConfig::default());
        let results = inbox.system_folder("controller", FolderType::Inbox).unwrap();
        assert_eq!(results.message_count, 1);
        let thread = inbox.thread("controller", &task.id).unwrap();
        assert!(thread[0].body.contains("[a] half"));
        assert!(thread[0].body.contains("[b] rest"));
    }

    #[test]
    fn test_fail_is_fail_fast() {
        let f = fixture();
        let task = f
            .coordinator
            .submit(SubmitRequest::new("x").with_candidate("a").with_candidate("b"))
            .unwrap();
        f.coordinator.start(&task.id, "a").unwrap();
        f.coordinator.join(&task.id, "b").unwrap();

        let failed = f.coordinator.fail(&task.id, "b", "disk full").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("disk full"));
        assert_eq!(f.registry.get("a").unwrap().status, AgentStatus::Idle);
        assert_eq!(f.registry.get("b").unwrap().status, AgentStatus::Error);

        assert!(matches!(
            f.coordinator.complete(&task.id, "a", "late").unwrap_err(),
            ConclaveError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn test_unstarted_candidate_failing_enters_error() {
        let f = fixture();
        let task = f
            .coordinator
            .submit(SubmitRequest::new("x").with_candidate("a").with_candidate("b"))
            .unwrap();
        f.coordinator.start(&task.id, "a").unwrap();

        f.coordinator.fail(&task.id, "b", "cannot reach host").unwrap();
        assert_eq!(f.registry.get("a").unwrap().status, AgentStatus::Idle);
        assert_eq!(f.registry.get("b").unwrap().status, AgentStatus::Error);
    }

    #[test]
    fn test_not_assigned_agent_cannot_act() {
        let f = fixture();
        let task = f.coordinator.submit(SubmitRequest::new("x")).unwrap();
        f.coordinator.start(&task.id, "a").unwrap();

        assert!(matches!(
            f.coordinator.report_progress(&task.id, "b", 10).unwrap_err(),
            ConclaveError::NotAssigned { .. }
        ));
        assert!(matches!(
            f.coordinator.fail(&task.id, "b", "nope").unwrap_err(),
            ConclaveError::NotAssigned { .. }
        ));
    }

    #[test]
    fn test_busy_agent_cannot_start_second_task() {
        let f = fixture();
        let one = f.coordinator.submit(SubmitRequest::new("one")).unwrap();
        let two = f.coordinator.submit(SubmitRequest::new("two")).unwrap();
        f.coordinator.start(&one.id, "a").unwrap();

        assert!(matches!(
            f.coordinator.start(&two.id, "a").unwrap_err(),
            ConclaveError::AgentBusy { .. }
        ));
        assert_eq!(f.coordinator.get_task(&two.id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_history_is_bounded() {
        let f = fixture_with(CoordinatorConfig {
            history_limit: 2,
            ..Default::default()
        });
        for i in 0..3 {
            let task = f.coordinator.submit(SubmitRequest::new(format!("t{}", i))).unwrap();
            f.coordinator.start(&task.id, "a").unwrap();
            f.coordinator.complete(&task.id, "a", "ok").unwrap();
        }

        let history = f.coordinator.history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].description, "t2");
        assert_eq!(history[1].description, "t1");
    }

    #[test]
    fn test_orphan_policies() {
        let f = fixture_with(CoordinatorConfig {
            orphan_policy: OrphanPolicy::Reassign,
            ..Default::default()
        });
        let task = f.coordinator.submit(SubmitRequest::new("x")).unwrap();
        let entry = f.coordinator.broker().dequeue_as("a", &[]).unwrap().unwrap();
        f.coordinator.start(&task.id, "a").unwrap();

        let offline = f.registry.mark_offline("a").unwrap();
        let affected = f.coordinator.handle_offline_agents(&[offline]).unwrap();
        assert_eq!(affected, vec![task.id.clone()]);

        let requeued = f.coordinator.get_task(&task.id).unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert!(requeued.assignments.is_empty());
        assert!(f.registry.get("a").unwrap().current_task.is_none());

        // The claim was released, so another worker can pick it up
        let again = f.coordinator.broker().dequeue_as("b", &[]).unwrap().unwrap();
        assert_eq!(again.id, entry.id);
        assert_eq!(again.retry_count, 0);

        let f = fixture_with(CoordinatorConfig {
            orphan_policy: OrphanPolicy::Fail,
            ..Default::default()
        });
        let task = f.coordinator.submit(SubmitRequest::new("y")).unwrap();
        f.coordinator.start(&task.id, "a").unwrap();
        let offline = f.registry.mark_offline("a").unwrap();
        f.coordinator.handle_offline_agents(&[offline]).unwrap();

        let failed = f.coordinator.get_task(&task.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.error.unwrap().contains("offline"));
        assert_eq!(f.registry.get("a").unwrap().status, AgentStatus::Offline);
    }

    #[test]
    fn test_events_are_emitted_after_commit() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.coordinator
            .events()
            .add_listener(move |e| sink.lock().unwrap().push(e));

        let task = f.coordinator.submit(SubmitRequest::new("x")).unwrap();
        f.coordinator.start(&task.id, "a").unwrap();
        f.coordinator.complete(&task.id, "a", "ok").unwrap();
        let _ = f.coordinator.start(&task.id, "b");

        let seen = seen.lock().unwrap();
        assert!(matches!(seen[0], CoordinatorEvent::TaskSubmitted { .. }));
        assert!(matches!(seen[1], CoordinatorEvent::TaskStarted { .. }));
        assert!(matches!(seen[2], CoordinatorEvent::TaskCompleted { .. }));
        assert!(matches!(seen[3], CoordinatorEvent::MessageDelivered { .. }));
        assert_eq!(seen.len(), 4);
    }
}
