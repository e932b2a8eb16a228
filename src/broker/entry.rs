//! Queue entry records

use crate::priority::Priority;
use crate::store::{decode_capabilities, parse_ts, parse_ts_opt};
use crate::ConclaveError;
use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Approval state of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    /// Waiting for a supervisor
    Pending,
    AutoApproved,
    Approved,
    /// Never dequeued
    Rejected,
}

impl Approval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AutoApproved => "auto_approved",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Whether entries in this state may be dequeued
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::AutoApproved | Self::Approved)
    }
}

impl fmt::Display for Approval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Approval {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "auto_approved" => Ok(Self::AutoApproved),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(ConclaveError::Storage(format!(
                "unknown approval state '{}'",
                other
            ))),
        }
    }
}

/// A queued unit of work referencing a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Monotonic enqueue sequence
    pub id: i64,
    pub task_id: String,
    pub priority: Priority,
    /// Capabilities a worker must declare to receive this entry
    pub capabilities: Vec<String>,
    pub approval: Approval,
    pub approved_by: Option<String>,
    pub reject_reason: Option<String>,
    pub retry_count: u32,
    pub dead_letter: bool,
    /// Not eligible before this time (retry backoff)
    pub available_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }
}

pub(crate) const ENTRY_COLUMNS: &str = "id, task_id, priority, capabilities, approval, \
     approved_by, reject_reason, retry_count, dead_letter, available_at, claimed_by, claimed_at, \
     last_error, enqueued_at";

pub(crate) fn row_to_entry(row: &Row) -> rusqlite::Result<QueueEntry> {
    let approval: String = row.get(4)?;
    Ok(QueueEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        priority: Priority::from_rank(row.get(2)?),
        capabilities: decode_capabilities(&row.get::<_, String>(3)?),
        approval: approval.parse().unwrap_or(Approval::Pending),
        approved_by: row.get(5)?,
        reject_reason: row.get(6)?,
        retry_count: row.get(7)?,
        dead_letter: row.get(8)?,
        available_at: parse_ts(&row.get::<_, String>(9)?),
        claimed_by: row.get(10)?,
        claimed_at: parse_ts_opt(row.get(11)?),
        last_error: row.get(12)?,
        enqueued_at: parse_ts(&row.get::<_, String>(13)?),
    })
}

/// Result of a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    /// Re-queued; eligible again at `available_at`
    Retrying {
        retry_count: u32,
        available_at: DateTime<Utc>,
    },

    /// Retries exhausted; the task has been failed
    DeadLettered { retry_count: u32 },

    /// The task already reached a terminal state; the entry was dropped
    Discarded,
}

/// One line of an entry's audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub entry_id: i64,
    pub task_id: String,
    pub event: String,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub awaiting_approval: i64,
    /// Approved, unclaimed and available now
    pub ready: i64,
    /// Approved but still in retry backoff
    pub delayed: i64,
    pub claimed: i64,
    pub dead_letters: i64,
    pub rejected: i64,
}

impl QueueStats {
    /// Entries that will still be handed to a worker
    pub fn depth(&self) -> i64 {
        self.awaiting_approval + self.ready + self.delayed + self.claimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_eligibility() {
        assert!(Approval::AutoApproved.is_eligible());
        assert!(Approval::Approved.is_eligible());
        assert!(!Approval::Pending.is_eligible());
        assert!(!Approval::Rejected.is_eligible());
        assert_eq!("auto_approved".parse::<Approval>().unwrap(), Approval::AutoApproved);
    }

    #[test]
    fn test_stats_depth_excludes_terminal_entries() {
        let stats = QueueStats {
            awaiting_approval: 1,
            ready: 2,
            delayed: 3,
            claimed: 4,
            dead_letters: 5,
            rejected: 6,
        };
        assert_eq!(stats.depth(), 10);
    }
}
