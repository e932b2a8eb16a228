//! Notification delivery into agent sessions
//!
//! Coordinator events are rendered as single lines and pushed to the session
//! of each affected agent (or inbox owner). Every destination has its own
//! FIFO queue drained by one tokio task, so lines for one session never
//! interleave while different sessions proceed independently. Delivery is
//! best effort: failures are logged, counted and dropped.

mod sink;

pub use sink::{MemorySink, SessionSink, TmuxSink};

use crate::config::NotifyConfig;
use crate::coordinator::{CoordinatorEvent, EventBus};
use crate::{metrics, ConclaveError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lower bound for the pause between typing a line and submitting it
pub const MIN_SUBMIT_DELAY: Duration = Duration::from_millis(50);

const MAX_LINE_CHARS: usize = 240;

/// One line bound for one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub destination: String,
    pub line: String,
}

impl Notification {
    pub fn new(destination: impl Into<String>, line: impl AsRef<str>) -> Self {
        Self {
            destination: destination.into(),
            line: sanitize_line(line.as_ref()),
        }
    }

    /// Notifications produced by an event; empty for bookkeeping events
    pub fn from_event(event: &CoordinatorEvent) -> Vec<Notification> {
        let fan_out = |agents: &[String], line: String| {
            agents
                .iter()
                .map(|agent| Notification::new(agent.clone(), &line))
                .collect::<Vec<_>>()
        };

        match event {
            CoordinatorEvent::TaskSubmitted {
                task_id,
                priority,
                agents,
                ..
            } => fan_out(
                agents,
                format!("[conclave] task {} assigned to you ({})", task_id, priority),
            ),
            CoordinatorEvent::TaskCompleted { task_id, agents } => {
                fan_out(agents, format!("[conclave] task {} completed", task_id))
            }
            CoordinatorEvent::TaskFailed {
                task_id,
                agents,
                reason,
            } => fan_out(
                agents,
                format!("[conclave] task {} failed: {}", task_id, reason),
            ),
            CoordinatorEvent::MessageDelivered {
                message_id,
                owner,
                sender,
                subject,
            } => vec![Notification::new(
                owner.clone(),
                format!(
                    "[conclave] new message {} from {}: {}",
                    message_id, sender, subject
                ),
            )],
            _ => Vec::new(),
        }
    }
}

/// Collapse control characters and whitespace runs into single spaces and
/// cap the length, so a line can never submit itself early
pub fn sanitize_line(raw: &str) -> String {
    let flat: String = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let collapsed = flat.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= MAX_LINE_CHARS {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(MAX_LINE_CHARS - 3).collect();
    cut.truncate(cut.trim_end().len());
    cut.push_str("...");
    cut
}

struct Worker {
    id: u64,
    sender: mpsc::Sender<String>,
    handle: JoinHandle<()>,
}

type Sessions = Arc<RwLock<HashMap<String, String>>>;
type Workers = Arc<Mutex<HashMap<String, Worker>>>;

fn resolve_session(sessions: &Sessions, destination: &str) -> String {
    sessions
        .read()
        .ok()
        .and_then(|s| s.get(destination).cloned())
        .unwrap_or_else(|| destination.to_string())
}

/// Outcome of an idle timeout, decided under the workers lock
enum Idle {
    Line(String),
    Retired,
}

/// Take one more line if any raced in, otherwise remove this worker from
/// the map. `notify` sends under the same lock, so nothing can arrive after
/// the entry is gone.
fn retire_if_idle(
    workers: &Workers,
    destination: &str,
    id: u64,
    receiver: &mut mpsc::Receiver<String>,
) -> Idle {
    let Ok(mut map) = workers.lock() else {
        return Idle::Retired;
    };
    if let Ok(line) = receiver.try_recv() {
        return Idle::Line(line);
    }
    if map.get(destination).is_some_and(|w| w.id == id) {
        map.remove(destination);
    }
    Idle::Retired
}

/// Per-destination notification queues over a [`SessionSink`]
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn SessionSink>,
    submit_delay: Duration,
    idle_timeout: Duration,
    capacity: usize,
    runtime: Handle,
    sessions: Sessions,
    workers: Workers,
    next_worker_id: Arc<AtomicU64>,
}

impl Notifier {
    /// Create a notifier bound to the current tokio runtime
    pub fn new(sink: Arc<dyn SessionSink>, config: &NotifyConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            ConclaveError::Other(format!("Notifier requires a tokio runtime: {}", e))
        })?;

        Ok(Self {
            sink,
            submit_delay: config.submit_delay(),
            idle_timeout: config.worker_idle(),
            capacity: config.queue_capacity.max(1),
            runtime,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            next_worker_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Notifier driving tmux panes
    pub fn tmux(config: &NotifyConfig) -> Result<Self> {
        Self::new(Arc::new(TmuxSink::new(&config.tmux_binary)), config)
    }

    pub fn submit_delay(&self) -> Duration {
        self.submit_delay
    }

    /// Route a destination to a session target. Unmapped destinations use
    /// their own name as the target. Takes effect from the next line
    /// delivered, including lines already queued.
    pub fn map_session(&self, destination: impl Into<String>, session: impl Into<String>) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(destination.into(), session.into());
        }
    }

    /// Session target a line for `destination` goes to right now
    pub fn session_for(&self, destination: &str) -> String {
        resolve_session(&self.sessions, destination)
    }

    /// Destinations that currently have a running worker
    pub fn active_destinations(&self) -> Vec<String> {
        let mut active: Vec<String> = self
            .workers
            .lock()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        active.sort();
        active
    }

    /// Subscribe to an event bus; every event is rendered and queued
    pub fn attach(&self, bus: &EventBus) {
        let notifier = self.clone();
        bus.add_listener(move |event| notifier.handle_event(&event));
    }

    pub fn handle_event(&self, event: &CoordinatorEvent) {
        for notification in Notification::from_event(event) {
            if let Err(e) = self.notify(notification) {
                warn!(error = %e, "Notification dropped");
            }
        }
    }

    /// Queue one notification without blocking
    ///
    /// # Errors
    /// `DeliveryDropped` when the destination queue is full or closed
    pub fn notify(&self, notification: Notification) -> Result<()> {
        let Notification { destination, line } = notification;
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| ConclaveError::Other("notifier lock poisoned".to_string()))?;

        let worker = workers
            .entry(destination.clone())
            .or_insert_with(|| self.spawn_worker(&destination));

        worker.sender.try_send(line).map_err(|e| {
            metrics::record_notification_dropped();
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "queue closed",
            };
            ConclaveError::DeliveryDropped {
                destination: destination.clone(),
                reason: reason.to_string(),
            }
        })
    }

    fn spawn_worker(&self, destination: &str) -> Worker {
        let (sender, mut receiver) = mpsc::channel::<String>(self.capacity);
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let sink = self.sink.clone();
        let sessions = self.sessions.clone();
        let workers = self.workers.clone();
        let delay = self.submit_delay;
        let idle_timeout = self.idle_timeout;
        let destination = destination.to_string();

        let handle = self.runtime.spawn(async move {
            loop {
                let line = match tokio::time::timeout(idle_timeout, receiver.recv()).await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(_) => match retire_if_idle(&workers, &destination, id, &mut receiver) {
                        Idle::Line(line) => line,
                        Idle::Retired => {
                            debug!(destination = %destination, "Idle notification worker stopped");
                            break;
                        }
                    },
                };

                let session = resolve_session(&sessions, &destination);
                match deliver(sink.as_ref(), &session, &line, delay).await {
                    Ok(()) => {
                        metrics::record_notification_delivered();
                        debug!(destination = %destination, session = %session, "Notification delivered");
                    }
                    Err(e) => {
                        metrics::record_notification_dropped();
                        warn!(destination = %destination, error = %e, "Notification dropped");
                    }
                }
            }
        });

        Worker { id, sender, handle }
    }

    /// Close every queue and wait until already-queued lines are delivered
    pub async fn drain(&self) {
        let workers: Vec<Worker> = match self.workers.lock() {
            Ok(mut map) => map.drain().map(|(_, w)| w).collect(),
            Err(_) => return,
        };

        for Worker { sender, handle, .. } in workers {
            drop(sender);
            if let Err(e) = handle.await {
                warn!(error = %e, "Notification worker ended abnormally");
            }
        }
    }
}

async fn deliver(sink: &dyn SessionSink, session: &str, line: &str, delay: Duration) -> Result<()> {
    sink.send_text(session, line).await?;
    sink.wait_ready(session, delay).await?;
    sink.submit(session).await
}
