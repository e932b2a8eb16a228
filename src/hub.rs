//! One handle over every component sharing a store
//!
//! Callers identify themselves explicitly: every operation performed on
//! behalf of an agent takes the agent id as a parameter. The CLI injects it
//! once from `--agent`.

use crate::broker::{Broker, NackOutcome, QueueEntry};
use crate::config::ConclaveConfig;
use crate::coordinator::{
    Coordinator, CoordinatorEvent, EventBus, SubmitRequest, Task, TaskStatusView,
};
use crate::inbox::{DeliverRequest, InboxStore, StatusFlag};
use crate::notify::Notifier;
use crate::registry::{Agent, AgentRegistry};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::{ConclaveError, Priority, Result};
use std::sync::Arc;

/// Wired set of components over one database
#[derive(Clone)]
pub struct Hub {
    config: ConclaveConfig,
    store: Arc<Store>,
    registry: AgentRegistry,
    inbox: InboxStore,
    coordinator: Coordinator,
    events: EventBus,
    notifier: Option<Notifier>,
}

impl Hub {
    /// Open the configured database and build the components
    pub fn open(config: &ConclaveConfig) -> Result<Self> {
        let store = Arc::new(Store::open(&config.store)?);
        Ok(Self::with_store(config, store))
    }

    /// Build the components over an existing store
    pub fn with_store(config: &ConclaveConfig, store: Arc<Store>) -> Self {
        let events = EventBus::new();
        let registry = AgentRegistry::new(store.clone());
        let inbox = InboxStore::new(store.clone(), config.inbox.clone());
        let broker = Broker::new(store.clone(), config.broker.clone());
        let coordinator = Coordinator::new(
            store.clone(),
            broker,
            config.coordinator.clone(),
            config.inbox.clone(),
        )
        .with_events(events.clone());

        Self {
            config: config.clone(),
            store,
            registry,
            inbox,
            coordinator,
            events,
            notifier: None,
        }
    }

    /// Push events into agent sessions through `notifier`
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        notifier.attach(&self.events);
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &ConclaveConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn inbox(&self) -> &InboxStore {
        &self.inbox
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn broker(&self) -> &Broker {
        self.coordinator.broker()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn notifier(&self) -> Option<&Notifier> {
        self.notifier.as_ref()
    }

    /// Scheduler running the sweeps over this hub's components
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.registry.clone(),
            self.coordinator.clone(),
            self.config.scheduler.clone(),
            &self.config.registry,
            &self.config.broker,
        )
    }

    // Agents

    /// Register an agent and give it a mailbox
    pub fn register_agent(&self, agent_id: &str, capabilities: &[String]) -> Result<Agent> {
        let agent = self.registry.register(agent_id, capabilities)?;
        self.inbox.ensure_owner(agent_id, agent_id)?;
        Ok(agent)
    }

    pub fn heartbeat(&self, agent_id: &str) -> Result<Agent> {
        self.registry.heartbeat(agent_id)
    }

    // Tasks

    pub fn submit_task(&self, req: SubmitRequest) -> Result<Task> {
        self.coordinator.submit(req)
    }

    pub fn start_task(&self, agent_id: &str, task_id: &str) -> Result<Task> {
        self.coordinator.start(task_id, agent_id)
    }

    pub fn join_task(&self, agent_id: &str, task_id: &str) -> Result<Task> {
        self.coordinator.join(task_id, agent_id)
    }

    pub fn report_progress(&self, agent_id: &str, task_id: &str, percent: i64) -> Result<Task> {
        self.coordinator.report_progress(task_id, agent_id, percent)
    }

    pub fn complete_task(&self, agent_id: &str, task_id: &str, result: &str) -> Result<Task> {
        self.coordinator.complete(task_id, agent_id, result)
    }

    pub fn fail_task(&self, agent_id: &str, task_id: &str, reason: &str) -> Result<Task> {
        self.coordinator.fail(task_id, agent_id, reason)
    }

    pub fn get_task_status(&self, task_id: &str) -> Result<TaskStatusView> {
        self.coordinator.get_task_status(task_id)
    }

    // Queue

    /// Queue another entry for an existing task
    pub fn enqueue(&self, task_id: &str, priority: Priority, auto_approve: bool) -> Result<QueueEntry> {
        self.broker().enqueue(task_id, priority, auto_approve)
    }

    pub fn approve(&self, approver: &str, entry_id: i64) -> Result<QueueEntry> {
        self.broker().approve(entry_id, approver)
    }

    pub fn reject(&self, entry_id: i64, reason: &str) -> Result<QueueEntry> {
        self.broker().reject(entry_id, reason)
    }

    /// Claim the next entry this agent's capabilities allow.
    ///
    /// Busy and offline agents are refused before anything is claimed.
    pub fn dequeue(&self, agent_id: &str) -> Result<Option<QueueEntry>> {
        let agent = self.registry.available(agent_id)?;
        self.broker().dequeue_as(agent_id, &agent.capabilities)
    }

    /// Claim the next entry and start its task under `agent_id`.
    ///
    /// When the agent turns out not to be allowed or able to start the task,
    /// the claim is handed back without spending a retry. Any other start
    /// failure counts as a failed attempt. The start error is returned in
    /// both cases.
    pub fn claim_next(&self, agent_id: &str) -> Result<Option<(QueueEntry, Task)>> {
        let Some(entry) = self.dequeue(agent_id)? else {
            return Ok(None);
        };

        match self.coordinator.start(&entry.task_id, agent_id) {
            Ok(task) => Ok(Some((entry, task))),
            Err(
                e @ (ConclaveError::NotAssigned { .. }
                | ConclaveError::AgentBusy { .. }
                | ConclaveError::AgentUnavailable(_)),
            ) => {
                tracing::debug!(entry = entry.id, agent = agent_id, error = %e, "Claim handed back");
                self.broker().release_claim(entry.id, &e.to_string())?;
                Err(e)
            }
            Err(e) => {
                tracing::warn!(entry = entry.id, agent = agent_id, error = %e, "Claimed task could not start");
                self.broker().nack(entry.id, &e.to_string())?;
                Err(e)
            }
        }
    }

    pub fn ack(&self, entry_id: i64) -> Result<()> {
        self.broker().ack(entry_id)
    }

    pub fn nack(&self, entry_id: i64, error: &str) -> Result<NackOutcome> {
        self.broker().nack(entry_id, error)
    }

    // Inbox

    /// Deliver a message and announce it to the owner's session
    pub fn deliver_message(&self, req: DeliverRequest) -> Result<String> {
        let owner = req.owner.clone();
        let sender = req.sender.clone();
        let subject = req.subject.clone();
        let message_id = self.inbox.deliver_message(req)?;

        self.events.emit(CoordinatorEvent::MessageDelivered {
            message_id: message_id.clone(),
            owner,
            sender,
            subject,
        });
        Ok(message_id)
    }

    pub fn update_status(&self, message_id: &str, flag: StatusFlag, value: bool) -> Result<()> {
        self.inbox.update_status(message_id, flag, value)
    }

    pub fn move_message(&self, message_id: &str, folder_id: i64) -> Result<()> {
        self.inbox.move_message(message_id, folder_id)
    }

    pub fn archive(&self, message_id: &str) -> Result<()> {
        self.inbox.archive(message_id)
    }

    pub fn search(&self, owner: &str, query: &str) -> Result<Vec<String>> {
        self.inbox.search(owner, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::TaskStatus;
    use crate::inbox::FolderType;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn open_hub() -> (Hub, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = ConclaveConfig::with_db_path(dir.path().join("hub.db"));
        (Hub::open(&config).unwrap(), dir)
    }

    #[test]
    fn test_register_creates_mailbox() {
        let (hub, _dir) = open_hub();
        hub.register_agent("builder", &["build".to_string()]).unwrap();

        let folders = hub.inbox().folders("builder").unwrap();
        assert_eq!(folders.len(), FolderType::SYSTEM.len());
    }

    #[test]
    fn test_claim_next_runs_worker_flow() {
        let (hub, _dir) = open_hub();
        hub.register_agent("builder", &["build".to_string()]).unwrap();
        let task = hub
            .submit_task(SubmitRequest::new("compile").with_capability("build"))
            .unwrap();

        let (entry, started) = hub.claim_next("builder").unwrap().unwrap();
        assert_eq!(entry.task_id, task.id);
        assert_eq!(started.status, TaskStatus::InProgress);

        hub.report_progress("builder", &task.id, 50).unwrap();
        hub.complete_task("builder", &task.id, "ok").unwrap();
        hub.ack(entry.id).unwrap();

        assert_eq!(
            hub.get_task_status(&task.id).unwrap().status,
            TaskStatus::Completed
        );
        assert!(hub.claim_next("builder").unwrap().is_none());
    }

    #[test]
    fn test_claim_next_skips_tasks_pinned_to_others() {
        let (hub, _dir) = open_hub();
        hub.register_agent("builder", &[]).unwrap();
        hub.register_agent("other", &[]).unwrap();
        let task = hub
            .submit_task(SubmitRequest::new("pinned").with_candidate("builder"))
            .unwrap();

        for _ in 0..4 {
            assert!(hub.claim_next("other").unwrap().is_none());
        }

        let entries = hub.broker().list().unwrap();
        assert_eq!(entries[0].retry_count, 0);
        assert!(!entries[0].is_claimed());
        assert_eq!(hub.get_task_status(&task.id).unwrap().status, TaskStatus::Pending);

        let (_, started) = hub.claim_next("builder").unwrap().unwrap();
        assert_eq!(started.id, task.id);
    }

    #[test]
    fn test_busy_agent_cannot_claim() {
        let (hub, _dir) = open_hub();
        hub.register_agent("builder", &[]).unwrap();
        hub.submit_task(SubmitRequest::new("one")).unwrap();
        let two = hub.submit_task(SubmitRequest::new("two")).unwrap();
        hub.claim_next("builder").unwrap().unwrap();

        for _ in 0..4 {
            assert!(matches!(
                hub.claim_next("builder").unwrap_err(),
                ConclaveError::AgentBusy { .. }
            ));
        }

        assert_eq!(hub.get_task_status(&two.id).unwrap().status, TaskStatus::Pending);
        let waiting: Vec<_> = hub
            .broker()
            .list()
            .unwrap()
            .into_iter()
            .filter(|e| e.task_id == two.id)
            .collect();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].retry_count, 0);
        assert!(!waiting[0].is_claimed());
    }

    #[test]
    fn test_returning_agent_keeps_its_task() {
        let (hub, _dir) = open_hub();
        hub.register_agent("builder", &[]).unwrap();
        let one = hub.submit_task(SubmitRequest::new("one")).unwrap();
        let two = hub.submit_task(SubmitRequest::new("two")).unwrap();
        hub.start_task("builder", &one.id).unwrap();

        hub.registry().mark_offline("builder").unwrap();
        hub.heartbeat("builder").unwrap();

        assert!(matches!(
            hub.start_task("builder", &two.id).unwrap_err(),
            ConclaveError::AgentBusy { .. }
        ));
        assert_eq!(hub.get_task_status(&two.id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_deliver_emits_event() {
        let (hub, _dir) = open_hub();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.events().add_listener(move |e| sink.lock().unwrap().push(e));

        let id = hub
            .deliver_message(DeliverRequest::new("reviewer", "builder", "PR ready", "see #12"))
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|e| matches!(
            e,
            CoordinatorEvent::MessageDelivered { message_id, .. } if *message_id == id
        )));
        assert_eq!(hub.search("reviewer", "PR").unwrap(), vec![id.clone()]);
    }
}
