//! Priority Broker
//!
//! Queues work for agents with approval, retry and dead-letter handling.
//!
//! # Overview
//!
//! - **Ordering**: priority DESC, then enqueue sequence ASC (FIFO within a
//!   priority class)
//! - **Approval**: entries are either auto-approved or wait for a
//!   supervisor; rejected entries are never handed out
//! - **Retries**: a failed attempt re-queues the entry with exponential
//!   backoff; past `max_retries` it becomes a dead letter and its task fails
//!
//! Delivery is at-least-once. Every entry carries its task id and entry id
//! so executors can detect duplicates.

mod entry;

pub use entry::{Approval, NackOutcome, QueueEntry, QueueEvent, QueueStats};

use crate::config::BrokerConfig;
use crate::coordinator::{self, CoordinatorEvent, EventBus, Finished, Task, TaskSettings, TaskStatus};
use crate::priority::Priority;
use crate::store::{fmt_ts, now_ts, parse_ts, Store};
use crate::{metrics, ConclaveError, Result};
use chrono::Utc;
use entry::{row_to_entry, ENTRY_COLUMNS};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Worker name recorded for anonymous `dequeue` claims
pub const ANONYMOUS_WORKER: &str = "anonymous";

fn record_in(
    conn: &Connection,
    entry_id: i64,
    task_id: &str,
    event: &str,
    detail: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO queue_history (entry_id, task_id, event, detail, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![entry_id, task_id, event, detail, now_ts()],
    )?;
    Ok(())
}

fn load_entry_in(conn: &Connection, entry_id: i64) -> Result<QueueEntry> {
    conn.query_row(
        &format!("SELECT {} FROM queue_entries WHERE id = ?1", ENTRY_COLUMNS),
        params![entry_id],
        row_to_entry,
    )
    .optional()?
    .ok_or_else(|| ConclaveError::not_found("queue entry", entry_id))
}

fn query_entries_in(
    conn: &Connection,
    sql_where: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<QueueEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM queue_entries WHERE {} ORDER BY priority DESC, id",
        ENTRY_COLUMNS, sql_where
    ))?;
    let entries = stmt
        .query_map(args, row_to_entry)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Dead entries cannot be acted on any more
fn ensure_live(entry: &QueueEntry) -> Result<()> {
    if entry.dead_letter {
        return Err(ConclaveError::RetryExhausted {
            entry_id: entry.id,
            retry_count: entry.retry_count,
        });
    }
    Ok(())
}

/// Only claimed entries can be acked, nacked or released
fn ensure_claimed(entry: &QueueEntry, to: &str) -> Result<()> {
    if !entry.is_claimed() {
        return Err(ConclaveError::InvalidTransition {
            entity: "queue entry",
            id: entry.id.to_string(),
            from: "unclaimed".to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}

fn task_status_in(conn: &Connection, task_id: &str) -> Result<TaskStatus> {
    let status: String = conn
        .query_row(
            "SELECT status FROM tasks WHERE id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| ConclaveError::not_found("task", task_id))?;
    status.parse()
}

/// Add an entry for a task inside the caller's transaction.
/// `capabilities` is the task's encoded capability list.
pub(crate) fn enqueue_in(
    conn: &Connection,
    task_id: &str,
    priority: Priority,
    capabilities: &str,
    auto_approve: bool,
) -> Result<i64> {
    let approval = if auto_approve {
        Approval::AutoApproved
    } else {
        Approval::Pending
    };
    let now = now_ts();

    conn.execute(
        "INSERT INTO queue_entries (task_id, priority, capabilities, approval, available_at, enqueued_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![task_id, priority.rank(), capabilities, approval.as_str(), now],
    )?;
    let entry_id = conn.last_insert_rowid();
    record_in(conn, entry_id, task_id, "enqueued", Some(approval.as_str()))?;
    Ok(entry_id)
}

/// Make a re-queued task eligible again: release the claim on its live
/// entry, or enqueue a fresh auto-approved entry if none is left.
pub(crate) fn reopen_in(conn: &Connection, task: &Task) -> Result<i64> {
    let live: Option<i64> = conn
        .query_row(
            "SELECT id FROM queue_entries
             WHERE task_id = ?1 AND dead_letter = 0 AND approval != 'rejected'
             ORDER BY id LIMIT 1",
            params![task.id],
            |row| row.get(0),
        )
        .optional()?;

    match live {
        Some(entry_id) => {
            conn.execute(
                "UPDATE queue_entries
                 SET claimed_by = NULL, claimed_at = NULL, available_at = ?2
                 WHERE id = ?1",
                params![entry_id, now_ts()],
            )?;
            record_in(conn, entry_id, &task.id, "reopened", None)?;
            Ok(entry_id)
        }
        None => {
            let caps = crate::store::encode_capabilities(&task.capabilities)?;
            enqueue_in(conn, &task.id, task.priority, &caps, true)
        }
    }
}

/// What a nack did inside its transaction
struct NackResult {
    outcome: NackOutcome,
    finished: Option<Finished>,
    requeued: bool,
}

fn nack_in(
    conn: &Connection,
    config: &BrokerConfig,
    settings: &TaskSettings,
    entry: &QueueEntry,
    error: &str,
) -> Result<NackResult> {
    if task_status_in(conn, &entry.task_id)?.is_terminal() {
        conn.execute("DELETE FROM queue_entries WHERE id = ?1", params![entry.id])?;
        record_in(conn, entry.id, &entry.task_id, "discarded", Some(error))?;
        return Ok(NackResult {
            outcome: NackOutcome::Discarded,
            finished: None,
            requeued: false,
        });
    }

    let retry_count = entry.retry_count + 1;

    if retry_count > config.max_retries {
        conn.execute(
            "UPDATE queue_entries
             SET retry_count = ?2, dead_letter = 1, last_error = ?3,
                 claimed_by = NULL, claimed_at = NULL
             WHERE id = ?1",
            params![entry.id, retry_count, error],
        )?;
        record_in(conn, entry.id, &entry.task_id, "dead_lettered", Some(error))?;

        let reason = format!("retry exhausted: {}", error);
        let finished = coordinator::fail_in(conn, settings, &entry.task_id, None, &reason)?;
        return Ok(NackResult {
            outcome: NackOutcome::DeadLettered { retry_count },
            finished: Some(finished),
            requeued: false,
        });
    }

    let delay = chrono::Duration::from_std(config.backoff_duration(retry_count))
        .map_err(|e| ConclaveError::Config(format!("retry delay out of range: {}", e)))?;
    let available_at = fmt_ts(Utc::now() + delay);

    conn.execute(
        "UPDATE queue_entries
         SET retry_count = ?2, last_error = ?3, available_at = ?4,
             claimed_by = NULL, claimed_at = NULL
         WHERE id = ?1",
        params![entry.id, retry_count, error, available_at],
    )?;
    record_in(conn, entry.id, &entry.task_id, "retry_scheduled", Some(error))?;
    let requeued = coordinator::reset_to_pending_in(conn, &entry.task_id)?;

    Ok(NackResult {
        outcome: NackOutcome::Retrying {
            retry_count,
            available_at: parse_ts(&available_at),
        },
        finished: None,
        requeued,
    })
}

/// Priority broker backed by the shared store
#[derive(Clone)]
pub struct Broker {
    store: Arc<Store>,
    config: BrokerConfig,
    settings: TaskSettings,
    events: EventBus,
}

impl Broker {
    pub fn new(store: Arc<Store>, config: BrokerConfig) -> Self {
        Self {
            store,
            config,
            settings: TaskSettings::default(),
            events: EventBus::new(),
        }
    }

    /// Settings used when a rejection or dead letter fails a task
    pub fn with_task_settings(mut self, settings: TaskSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Queue an existing task. Auto-approved entries are eligible
    /// immediately; others wait for `approve`.
    pub fn enqueue(&self, task_id: &str, priority: Priority, auto_approve: bool) -> Result<QueueEntry> {
        let entry = self.store.write(|conn| {
            let caps: String = conn
                .query_row(
                    "SELECT capabilities FROM tasks WHERE id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| ConclaveError::not_found("task", task_id))?;
            let entry_id = enqueue_in(conn, task_id, priority, &caps, auto_approve)?;
            load_entry_in(conn, entry_id)
        })?;

        debug!(entry = entry.id, task = task_id, priority = %priority, "Entry enqueued");
        metrics::record_enqueued(priority);
        Ok(entry)
    }

    /// Approve an entry waiting for a supervisor
    pub fn approve(&self, entry_id: i64, approver: &str) -> Result<QueueEntry> {
        let entry = self.store.write(|conn| {
            let entry = load_entry_in(conn, entry_id)?;
            ensure_live(&entry)?;
            if entry.approval != Approval::Pending {
                return Err(ConclaveError::InvalidTransition {
                    entity: "queue entry",
                    id: entry_id.to_string(),
                    from: entry.approval.to_string(),
                    to: Approval::Approved.to_string(),
                });
            }

            conn.execute(
                "UPDATE queue_entries SET approval = 'approved', approved_by = ?2 WHERE id = ?1",
                params![entry_id, approver],
            )?;
            record_in(conn, entry_id, &entry.task_id, "approved", Some(approver))?;
            load_entry_in(conn, entry_id)
        })?;

        info!(entry = entry_id, approver, "Entry approved");
        self.events.emit(CoordinatorEvent::EntryApproved {
            entry_id,
            task_id: entry.task_id.clone(),
            approver: approver.to_string(),
        });
        Ok(entry)
    }

    /// Reject an entry. It is never dequeued and its task fails with
    /// "rejected: <reason>".
    pub fn reject(&self, entry_id: i64, reason: &str) -> Result<QueueEntry> {
        let settings = &self.settings;

        let (entry, finished) = self.store.write(|conn| {
            let entry = load_entry_in(conn, entry_id)?;
            ensure_live(&entry)?;
            let rejectable = match entry.approval {
                Approval::Pending => true,
                Approval::AutoApproved | Approval::Approved => !entry.is_claimed(),
                Approval::Rejected => false,
            };
            if !rejectable {
                return Err(ConclaveError::InvalidTransition {
                    entity: "queue entry",
                    id: entry_id.to_string(),
                    from: entry.approval.to_string(),
                    to: Approval::Rejected.to_string(),
                });
            }

            conn.execute(
                "UPDATE queue_entries SET approval = 'rejected', reject_reason = ?2 WHERE id = ?1",
                params![entry_id, reason],
            )?;
            record_in(conn, entry_id, &entry.task_id, "rejected", Some(reason))?;

            let finished = if task_status_in(conn, &entry.task_id)?.is_active() {
                let reason = format!("rejected: {}", reason);
                Some(coordinator::fail_in(conn, settings, &entry.task_id, None, &reason)?)
            } else {
                None
            };
            Ok((load_entry_in(conn, entry_id)?, finished))
        })?;

        warn!(entry = entry_id, task = %entry.task_id, reason, "Entry rejected");
        if let Some(finished) = finished {
            coordinator::announce_failure(&self.events, &self.settings, finished);
        }
        Ok(entry)
    }

    /// Claim the next eligible entry for an anonymous worker
    pub fn dequeue(&self, capabilities: &[String]) -> Result<Option<QueueEntry>> {
        self.dequeue_as(ANONYMOUS_WORKER, capabilities)
    }

    /// Claim the highest-priority eligible entry whose required capabilities
    /// are all declared by the worker. Non-blocking.
    ///
    /// A named worker never receives a task whose candidate list leaves it
    /// out. Anonymous claims skip that check.
    pub fn dequeue_as(&self, worker: &str, capabilities: &[String]) -> Result<Option<QueueEntry>> {
        const ELIGIBLE: &str = "dead_letter = 0
             AND approval IN ('auto_approved', 'approved')
             AND claimed_by IS NULL
             AND available_at <= ?1
             AND task_id IN (SELECT id FROM tasks WHERE status = 'pending')";
        const CANDIDATE_OF: &str = "AND (NOT EXISTS (SELECT 1 FROM task_assignments a
                       WHERE a.task_id = queue_entries.task_id AND a.candidate = 1)
                  OR EXISTS (SELECT 1 FROM task_assignments a
                       WHERE a.task_id = queue_entries.task_id AND a.candidate = 1
                         AND a.agent_id = ?2))";

        let claimed = self.store.write(|conn| {
            let now = now_ts();
            let candidates = if worker == ANONYMOUS_WORKER {
                query_entries_in(conn, ELIGIBLE, params![now])?
            } else {
                query_entries_in(
                    conn,
                    &format!("{} {}", ELIGIBLE, CANDIDATE_OF),
                    params![now, worker],
                )?
            };

            let Some(entry) = candidates
                .into_iter()
                .find(|e| e.capabilities.iter().all(|c| capabilities.contains(c)))
            else {
                return Ok(None);
            };

            conn.execute(
                "UPDATE queue_entries SET claimed_by = ?2, claimed_at = ?3
                 WHERE id = ?1 AND claimed_by IS NULL",
                params![entry.id, worker, now],
            )?;
            record_in(conn, entry.id, &entry.task_id, "claimed", Some(worker))?;
            Ok(Some(load_entry_in(conn, entry.id)?))
        })?;

        if let Some(entry) = &claimed {
            debug!(entry = entry.id, task = %entry.task_id, worker, "Entry claimed");
        }
        Ok(claimed)
    }

    /// Successful processing: remove the entry
    pub fn ack(&self, entry_id: i64) -> Result<()> {
        self.store.write(|conn| {
            let entry = load_entry_in(conn, entry_id)?;
            ensure_live(&entry)?;
            ensure_claimed(&entry, "acked")?;
            conn.execute("DELETE FROM queue_entries WHERE id = ?1", params![entry_id])?;
            record_in(conn, entry_id, &entry.task_id, "acked", entry.claimed_by.as_deref())?;
            Ok(())
        })?;
        debug!(entry = entry_id, "Entry acknowledged");
        Ok(())
    }

    /// Failed attempt: retry with backoff or dead-letter past `max_retries`
    pub fn nack(&self, entry_id: i64, error: &str) -> Result<NackOutcome> {
        let result = self.store.write(|conn| {
            let entry = load_entry_in(conn, entry_id)?;
            ensure_live(&entry)?;
            ensure_claimed(&entry, "nacked")?;
            let result = nack_in(conn, &self.config, &self.settings, &entry, error)?;
            Ok((entry.task_id, result))
        })?;

        let (task_id, result) = result;
        let outcome = result.outcome.clone();
        self.announce_nack(entry_id, &task_id, result, error);
        Ok(outcome)
    }

    /// Give a claim back untouched. The entry becomes eligible again at once
    /// and its retry count does not change, since nothing was attempted.
    pub fn release_claim(&self, entry_id: i64, reason: &str) -> Result<QueueEntry> {
        let entry = self.store.write(|conn| {
            let entry = load_entry_in(conn, entry_id)?;
            ensure_live(&entry)?;
            ensure_claimed(&entry, "released")?;
            conn.execute(
                "UPDATE queue_entries SET claimed_by = NULL, claimed_at = NULL WHERE id = ?1",
                params![entry_id],
            )?;
            record_in(conn, entry_id, &entry.task_id, "released", Some(reason))?;
            load_entry_in(conn, entry_id)
        })?;

        debug!(entry = entry_id, reason, "Claim released");
        Ok(entry)
    }

    fn announce_nack(&self, entry_id: i64, task_id: &str, result: NackResult, error: &str) {
        match &result.outcome {
            NackOutcome::Retrying {
                retry_count,
                available_at,
            } => {
                info!(entry = entry_id, retry_count, %available_at, error, "Entry scheduled for retry");
                if result.requeued {
                    self.events.emit(CoordinatorEvent::TaskRequeued {
                        task_id: task_id.to_string(),
                        reason: error.to_string(),
                    });
                }
            }
            NackOutcome::DeadLettered { retry_count } => {
                warn!(entry = entry_id, task = task_id, retry_count, error, "Entry dead-lettered");
                metrics::record_dead_lettered();
                self.events.emit(CoordinatorEvent::EntryDeadLettered {
                    entry_id,
                    task_id: task_id.to_string(),
                    retry_count: *retry_count,
                });
            }
            NackOutcome::Discarded => {
                debug!(entry = entry_id, task = task_id, "Entry discarded, task already finished");
            }
        }
        if let Some(finished) = result.finished {
            coordinator::announce_failure(&self.events, &self.settings, finished);
        }
    }

    /// Treat claims older than `timeout` on still-pending tasks as failed
    /// attempts. Claims on finished tasks are dropped; claims on in-progress
    /// tasks are left to the heartbeat sweep.
    pub fn requeue_stale_claims(&self, timeout: Duration) -> Result<Vec<(i64, NackOutcome)>> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| ConclaveError::Config(format!("claim timeout out of range: {}", e)))?;
        let cutoff = fmt_ts(Utc::now() - timeout);

        let results = self.store.write(|conn| {
            let stale = query_entries_in(
                conn,
                "dead_letter = 0 AND claimed_by IS NOT NULL AND claimed_at < ?1",
                params![cutoff],
            )?;

            let mut results = Vec::new();
            for entry in stale {
                if task_status_in(conn, &entry.task_id)? == TaskStatus::InProgress {
                    continue;
                }
                let error = format!(
                    "claim by {} expired",
                    entry.claimed_by.as_deref().unwrap_or(ANONYMOUS_WORKER)
                );
                let result = nack_in(conn, &self.config, &self.settings, &entry, &error)?;
                results.push((entry, error, result));
            }
            Ok(results)
        })?;

        Ok(results
            .into_iter()
            .map(|(entry, error, result)| {
                let outcome = result.outcome.clone();
                self.announce_nack(entry.id, &entry.task_id, result, &error);
                (entry.id, outcome)
            })
            .collect())
    }

    pub fn get(&self, entry_id: i64) -> Result<QueueEntry> {
        self.store.read(|conn| load_entry_in(conn, entry_id))
    }

    /// Live entries (not dead, not rejected) in dequeue order
    pub fn list(&self) -> Result<Vec<QueueEntry>> {
        self.store.read(|conn| {
            query_entries_in(conn, "dead_letter = 0 AND approval != 'rejected'", params![])
        })
    }

    /// Entries waiting for a supervisor
    pub fn awaiting_approval(&self) -> Result<Vec<QueueEntry>> {
        self.store
            .read(|conn| query_entries_in(conn, "dead_letter = 0 AND approval = 'pending'", params![]))
    }

    pub fn dead_letters(&self) -> Result<Vec<QueueEntry>> {
        self.store
            .read(|conn| query_entries_in(conn, "dead_letter = 1", params![]))
    }

    /// Permanently remove a dead letter
    pub fn purge_dead_letter(&self, entry_id: i64) -> Result<()> {
        self.store.write(|conn| {
            let entry = load_entry_in(conn, entry_id)?;
            if !entry.dead_letter {
                return Err(ConclaveError::InvalidTransition {
                    entity: "queue entry",
                    id: entry_id.to_string(),
                    from: "live".to_string(),
                    to: "purged".to_string(),
                });
            }
            conn.execute("DELETE FROM queue_entries WHERE id = ?1", params![entry_id])?;
            record_in(conn, entry_id, &entry.task_id, "purged", None)?;
            Ok(())
        })
    }

    /// Audit trail of one entry, oldest first
    pub fn history(&self, entry_id: i64) -> Result<Vec<QueueEvent>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entry_id, task_id, event, detail, recorded_at
                 FROM queue_history WHERE entry_id = ?1 ORDER BY id",
            )?;
            let events = stmt
                .query_map(params![entry_id], |row| {
                    Ok(QueueEvent {
                        entry_id: row.get(0)?,
                        task_id: row.get(1)?,
                        event: row.get(2)?,
                        detail: row.get(3)?,
                        recorded_at: parse_ts(&row.get::<_, String>(4)?),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(events)
        })
    }

    /// Drop unclaimed live entries whose task already finished outside the
    /// queue (started directly, or failed by the orphan policy)
    pub fn discard_finished(&self) -> Result<usize> {
        let discarded = self.store.write(|conn| {
            let stale = query_entries_in(
                conn,
                "dead_letter = 0 AND claimed_by IS NULL AND approval != 'rejected'
                 AND task_id IN (SELECT id FROM tasks WHERE status IN ('completed', 'failed'))",
                params![],
            )?;
            for entry in &stale {
                conn.execute("DELETE FROM queue_entries WHERE id = ?1", params![entry.id])?;
                record_in(conn, entry.id, &entry.task_id, "discarded", Some("task finished"))?;
            }
            Ok(stale.len())
        })?;

        if discarded > 0 {
            debug!(count = discarded, "Discarded entries of finished tasks");
        }
        Ok(discarded)
    }

    /// Occupancy counts; also refreshes the queue depth gauge
    pub fn stats(&self) -> Result<QueueStats> {
        let stats = self.store.read(|conn| {
            Ok(conn.query_row(
                "SELECT
                     COALESCE(SUM(dead_letter = 0 AND approval = 'pending'), 0),
                     COALESCE(SUM(dead_letter = 0 AND approval IN ('auto_approved', 'approved')
                                  AND claimed_by IS NULL AND available_at <= ?1), 0),
                     COALESCE(SUM(dead_letter = 0 AND approval IN ('auto_approved', 'approved')
                                  AND claimed_by IS NULL AND available_at > ?1), 0),
                     COALESCE(SUM(dead_letter = 0 AND claimed_by IS NOT NULL), 0),
                     COALESCE(SUM(dead_letter = 1), 0),
                     COALESCE(SUM(dead_letter = 0 AND approval = 'rejected'), 0)
                 FROM queue_entries",
                params![now_ts()],
                |row| {
                    Ok(QueueStats {
                        awaiting_approval: row.get(0)?,
                        ready: row.get(1)?,
                        delayed: row.get(2)?,
                        claimed: row.get(3)?,
                        dead_letters: row.get(4)?,
                        rejected: row.get(5)?,
                    })
                },
            )?)
        })?;

        metrics::set_queue_depth(stats.depth());
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinatorConfig, InboxConfig};
    use crate::coordinator::{Coordinator, SubmitRequest};

    fn setup(config: BrokerConfig) -> (Coordinator, Broker) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let broker = Broker::new(store.clone(), config);
        let coordinator = Coordinator::new(
            store,
            broker,
            CoordinatorConfig::default(),
            InboxConfig::default(),
        );
        let broker = coordinator.broker().clone();
        (coordinator, broker)
    }

    fn fast() -> BrokerConfig {
        BrokerConfig {
            max_retries: 2,
            base_delay_ms: 0,
            max_delay_ms: 0,
            ..Default::default()
        }
    }

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_priority_then_fifo_ordering() {
        let (coordinator, broker) = setup(BrokerConfig::default());
        let low = coordinator
            .submit(SubmitRequest::new("low").with_priority(Priority::Low))
            .unwrap();
        let normal_1 = coordinator.submit(SubmitRequest::new("n1")).unwrap();
        let normal_2 = coordinator.submit(SubmitRequest::new("n2")).unwrap();
        let emergency = coordinator
            .submit(SubmitRequest::new("e").with_priority(Priority::Emergency))
            .unwrap();

        let order: Vec<_> = std::iter::from_fn(|| broker.dequeue(&[]).unwrap())
            .map(|e| e.task_id)
            .collect();
        assert_eq!(order, vec![emergency.id, normal_1.id, normal_2.id, low.id]);
    }

    #[test]
    fn test_capability_filter() {
        let (coordinator, broker) = setup(BrokerConfig::default());
        let gpu = coordinator
            .submit(SubmitRequest::new("train").with_capability("gpu"))
            .unwrap();

        assert!(broker.dequeue(&caps(&["build"])).unwrap().is_none());
        let entry = broker.dequeue_as("w", &caps(&["build", "gpu"])).unwrap().unwrap();
        assert_eq!(entry.task_id, gpu.id);
        assert_eq!(entry.claimed_by.as_deref(), Some("w"));
        assert!(broker.dequeue(&caps(&["build", "gpu"])).unwrap().is_none());
    }

    #[test]
    fn test_manual_approval_and_reject() {
        let (coordinator, broker) = setup(BrokerConfig {
            require_manual_approval: true,
            ..Default::default()
        });
        let first = coordinator.submit(SubmitRequest::new("a")).unwrap();
        let second = coordinator.submit(SubmitRequest::new("b")).unwrap();
        assert!(broker.dequeue(&[]).unwrap().is_none());

        let pending = broker.awaiting_approval().unwrap();
        assert_eq!(pending.len(), 2);

        broker.approve(pending[0].id, "lead").unwrap();
        assert!(broker.approve(pending[0].id, "lead").is_err());
        let rejected = broker.reject(pending[1].id, "not now").unwrap();
        assert_eq!(rejected.approval, Approval::Rejected);
        assert_eq!(rejected.reject_reason.as_deref(), Some("not now"));

        let task = coordinator.get_task(&second.id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("rejected: not now"));

        let entry = broker.dequeue(&[]).unwrap().unwrap();
        assert_eq!(entry.task_id, first.id);
        assert!(broker.dequeue(&[]).unwrap().is_none());
    }

    #[test]
    fn test_nack_retries_then_dead_letters() {
        let (coordinator, broker) = setup(fast());
        let task = coordinator.submit(SubmitRequest::new("flaky")).unwrap();

        for attempt in 1..=2u32 {
            let entry = broker.dequeue(&[]).unwrap().unwrap();
            let outcome = broker.nack(entry.id, "boom").unwrap();
            assert!(matches!(
                outcome,
                NackOutcome::Retrying { retry_count, .. } if retry_count == attempt
            ));
        }

        let entry = broker.dequeue(&[]).unwrap().unwrap();
        let outcome = broker.nack(entry.id, "boom").unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered { retry_count: 3 });

        assert!(broker.dequeue(&[]).unwrap().is_none());
        assert_eq!(broker.dead_letters().unwrap().len(), 1);
        let failed = coordinator.get_task(&task.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("retry exhausted: boom"));

        assert!(matches!(
            broker.ack(entry.id).unwrap_err(),
            ConclaveError::RetryExhausted { .. }
        ));
        broker.purge_dead_letter(entry.id).unwrap();
        assert!(broker.dead_letters().unwrap().is_empty());
    }

    #[test]
    fn test_nack_applies_backoff() {
        let (coordinator, broker) = setup(BrokerConfig {
            base_delay_ms: 60_000,
            max_delay_ms: 120_000,
            ..Default::default()
        });
        coordinator.submit(SubmitRequest::new("slow")).unwrap();
        let entry = broker.dequeue(&[]).unwrap().unwrap();

        match broker.nack(entry.id, "later").unwrap() {
            NackOutcome::Retrying { available_at, .. } => {
                assert!(available_at > Utc::now() + chrono::Duration::seconds(50));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(broker.dequeue(&[]).unwrap().is_none());
        assert_eq!(broker.stats().unwrap().delayed, 1);
    }

    #[test]
    fn test_nack_returns_started_task_to_pending() {
        let (coordinator, broker) = setup(fast());
        let store = coordinator.broker().store.clone();
        crate::registry::AgentRegistry::new(store)
            .register("w", &[])
            .unwrap();
        let task = coordinator.submit(SubmitRequest::new("x")).unwrap();

        let entry = broker.dequeue_as("w", &[]).unwrap().unwrap();
        coordinator.start(&task.id, "w").unwrap();
        broker.nack(entry.id, "crashed").unwrap();

        assert_eq!(coordinator.get_task(&task.id).unwrap().status, TaskStatus::Pending);
        let again = broker.dequeue_as("w", &[]).unwrap().unwrap();
        assert_eq!(again.id, entry.id);
        coordinator.start(&task.id, "w").unwrap();
    }

    #[test]
    fn test_ack_removes_entry_and_keeps_history() {
        let (coordinator, broker) = setup(BrokerConfig::default());
        coordinator.submit(SubmitRequest::new("x")).unwrap();
        let entry = broker.dequeue_as("w", &[]).unwrap().unwrap();

        broker.ack(entry.id).unwrap();
        assert!(broker.get(entry.id).is_err());

        let events: Vec<_> = broker
            .history(entry.id)
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(events, vec!["enqueued", "claimed", "acked"]);
    }

    #[test]
    fn test_stale_claims_count_as_attempts() {
        let (coordinator, broker) = setup(fast());
        coordinator.submit(SubmitRequest::new("x")).unwrap();
        let entry = broker.dequeue_as("w", &[]).unwrap().unwrap();

        assert!(broker
            .requeue_stale_claims(Duration::from_secs(3600))
            .unwrap()
            .is_empty());

        std::thread::sleep(Duration::from_millis(5));
        let requeued = broker.requeue_stale_claims(Duration::ZERO).unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].0, entry.id);
        assert_eq!(broker.get(entry.id).unwrap().retry_count, 1);
        assert!(broker.dequeue(&[]).unwrap().is_some());
    }

    #[test]
    fn test_discard_entries_of_finished_tasks() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = crate::registry::AgentRegistry::new(store.clone());
        registry.register("builder", &[]).unwrap();
        let coordinator = Coordinator::new(
            store.clone(),
            Broker::new(store, BrokerConfig::default()),
            CoordinatorConfig::default(),
            InboxConfig::default(),
        );
        let broker = coordinator.broker().clone();

        // Started directly, never dequeued
        let task = coordinator.submit(SubmitRequest::new("hotfix")).unwrap();
        coordinator.start(&task.id, "builder").unwrap();
        assert_eq!(broker.discard_finished().unwrap(), 0);
        coordinator.complete(&task.id, "builder", "done").unwrap();

        assert_eq!(broker.discard_finished().unwrap(), 1);
        assert!(broker.list().unwrap().is_empty());
        assert_eq!(broker.stats().unwrap().depth(), 0);
    }

    #[test]
    fn test_unclaimed_entries_cannot_be_acked_or_nacked() {
        let (coordinator, broker) = setup(BrokerConfig {
            require_manual_approval: true,
            ..fast()
        });
        let task = coordinator.submit(SubmitRequest::new("gated")).unwrap();
        let entry = broker.awaiting_approval().unwrap().remove(0);

        for _ in 0..4 {
            assert!(matches!(
                broker.nack(entry.id, "boom").unwrap_err(),
                ConclaveError::InvalidTransition { .. }
            ));
        }
        assert!(matches!(
            broker.ack(entry.id).unwrap_err(),
            ConclaveError::InvalidTransition { .. }
        ));

        let entry = broker.get(entry.id).unwrap();
        assert_eq!(entry.retry_count, 0);
        assert!(!entry.dead_letter);
        assert_eq!(coordinator.get_task(&task.id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_release_claim_keeps_retry_count() {
        let (coordinator, broker) = setup(BrokerConfig::default());
        coordinator.submit(SubmitRequest::new("x")).unwrap();
        let entry = broker.dequeue_as("w", &[]).unwrap().unwrap();

        let released = broker.release_claim(entry.id, "not mine").unwrap();
        assert!(!released.is_claimed());
        assert_eq!(released.retry_count, 0);
        assert!(broker.release_claim(entry.id, "again").is_err());

        let again = broker.dequeue_as("v", &[]).unwrap().unwrap();
        assert_eq!(again.id, entry.id);
        let events: Vec<_> = broker
            .history(entry.id)
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(events, vec!["enqueued", "claimed", "released", "claimed"]);
    }

    #[test]
    fn test_named_worker_skips_tasks_pinned_elsewhere() {
        let (coordinator, broker) = setup(BrokerConfig::default());
        let store = coordinator.broker().store.clone();
        let registry = crate::registry::AgentRegistry::new(store);
        registry.register("a", &[]).unwrap();
        registry.register("b", &[]).unwrap();
        let pinned = coordinator
            .submit(SubmitRequest::new("pinned").with_candidate("a"))
            .unwrap();

        assert!(broker.dequeue_as("b", &[]).unwrap().is_none());
        let entry = broker.dequeue_as("a", &[]).unwrap().unwrap();
        assert_eq!(entry.task_id, pinned.id);
    }

    #[test]
    fn test_stats_counts() {
        let (coordinator, broker) = setup(BrokerConfig::default());
        coordinator.submit(SubmitRequest::new("a")).unwrap();
        coordinator.submit(SubmitRequest::new("b")).unwrap();
        broker.dequeue(&[]).unwrap();

        let stats = broker.stats().unwrap();
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.depth(), 2);
    }
}
