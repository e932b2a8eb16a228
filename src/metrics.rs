//! Prometheus metrics for the coordinator, broker and notifier
//!
//! Provides observability metrics for monitoring a Conclave hub in production.

use crate::coordinator::TaskStatus;
use crate::priority::Priority;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};

lazy_static! {
    /// Counter: tasks reaching a terminal state
    pub static ref TASKS_FINISHED: CounterVec = register_counter_vec!(
        "conclave_tasks_finished_total",
        "Tasks reaching a terminal state by status",
        &["status"]
    )
    .expect("Failed to create tasks_finished metric");

    /// Counter: queue entries created, by priority
    pub static ref ENTRIES_ENQUEUED: CounterVec = register_counter_vec!(
        "conclave_queue_enqueued_total",
        "Queue entries enqueued by priority",
        &["priority"]
    )
    .expect("Failed to create queue_enqueued metric");

    /// Counter: entries moved to the dead-letter set
    pub static ref ENTRIES_DEAD_LETTERED: Counter = register_counter!(
        "conclave_queue_dead_lettered_total",
        "Queue entries that exhausted their retries"
    )
    .expect("Failed to create queue_dead_lettered metric");

    /// Gauge: entries still to be handed to a worker
    pub static ref QUEUE_DEPTH: Gauge = register_gauge!(
        "conclave_queue_depth",
        "Current depth of the priority queue"
    )
    .expect("Failed to create queue_depth metric");

    /// Counter: notification outcomes
    pub static ref NOTIFICATIONS: CounterVec = register_counter_vec!(
        "conclave_notifications_total",
        "Notifications by outcome",
        &["outcome"]
    )
    .expect("Failed to create notifications metric");

    /// Counter: agents marked offline by the heartbeat sweep
    pub static ref AGENTS_OFFLINE: Counter = register_counter!(
        "conclave_agents_marked_offline_total",
        "Agents marked offline after missing heartbeats"
    )
    .expect("Failed to create agents_offline metric");
}

pub fn record_task_finished(status: TaskStatus) {
    TASKS_FINISHED.with_label_values(&[status.as_str()]).inc();
}

pub fn record_enqueued(priority: Priority) {
    ENTRIES_ENQUEUED
        .with_label_values(&[priority.as_str()])
        .inc();
}

pub fn record_dead_lettered() {
    ENTRIES_DEAD_LETTERED.inc();
}

/// Set queue depth
pub fn set_queue_depth(depth: i64) {
    QUEUE_DEPTH.set(depth as f64);
}

pub fn record_notification_delivered() {
    NOTIFICATIONS.with_label_values(&["delivered"]).inc();
}

pub fn record_notification_dropped() {
    NOTIFICATIONS.with_label_values(&["dropped"]).inc();
}

pub fn record_agents_offline(count: usize) {
    AGENTS_OFFLINE.inc_by(count as f64);
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> crate::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::ConclaveError::Other(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::ConclaveError::Other(format!("Metrics are not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        record_task_finished(TaskStatus::Completed);
        record_enqueued(Priority::Emergency);
        record_dead_lettered();
        set_queue_depth(3);
        record_notification_delivered();
        record_notification_dropped();
        record_agents_offline(2);

        let output = encode_metrics().unwrap();
        assert!(output.contains("conclave_tasks_finished_total"));
        assert!(output.contains("conclave_queue_enqueued_total"));
        assert!(output.contains("conclave_queue_depth"));
    }
}
