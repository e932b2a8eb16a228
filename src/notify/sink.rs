//! Session sinks: where notification lines end up

use crate::{ConclaveError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::trace;

/// Two-phase delivery target.
///
/// A line is typed into the session with `send_text`, the sink waits until
/// the session has taken it in, and `submit` sends the enter signal. The
/// default `wait_ready` is a fixed pause; sinks that can observe the
/// session override it with a real handshake.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn send_text(&self, session: &str, text: &str) -> Result<()>;

    async fn wait_ready(&self, _session: &str, min_delay: Duration) -> Result<()> {
        tokio::time::sleep(min_delay).await;
        Ok(())
    }

    async fn submit(&self, session: &str) -> Result<()>;
}

fn dropped(session: &str, reason: impl Into<String>) -> ConclaveError {
    ConclaveError::DeliveryDropped {
        destination: session.to_string(),
        reason: reason.into(),
    }
}

/// Types into tmux panes with `send-keys`
#[derive(Debug, Clone)]
pub struct TmuxSink {
    binary: String,
}

impl TmuxSink {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn send_keys(&self, session: &str, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.binary)
            .arg("send-keys")
            .arg("-t")
            .arg(session)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    dropped(session, format!("{} not found", self.binary))
                } else {
                    dropped(session, e.to_string())
                }
            })?;

        if !output.status.success() {
            return Err(dropped(
                session,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TmuxSink {
    fn default() -> Self {
        Self::new("tmux")
    }
}

#[async_trait]
impl SessionSink for TmuxSink {
    async fn send_text(&self, session: &str, text: &str) -> Result<()> {
        trace!(session, "tmux send-keys -l");
        self.send_keys(session, &["-l", text]).await
    }

    async fn submit(&self, session: &str) -> Result<()> {
        self.send_keys(session, &["Enter"]).await
    }
}

/// In-memory sink that records submitted lines per session
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    typed: Arc<Mutex<HashMap<String, String>>>,
    submitted: Arc<Mutex<HashMap<String, Vec<String>>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery to `session` fail
    pub fn fail_session(&self, session: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(session.to_string());
        }
    }

    /// Lines submitted to `session`, in order
    pub fn lines(&self, session: &str) -> Vec<String> {
        self.submitted
            .lock()
            .map(|s| s.get(session).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn check(&self, session: &str) -> Result<()> {
        let failing = self
            .failing
            .lock()
            .map(|f| f.contains(session))
            .unwrap_or(false);
        if failing {
            return Err(dropped(session, "session unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionSink for MemorySink {
    async fn send_text(&self, session: &str, text: &str) -> Result<()> {
        self.check(session)?;
        let mut typed = self
            .typed
            .lock()
            .map_err(|_| dropped(session, "sink poisoned"))?;
        typed.entry(session.to_string()).or_default().push_str(text);
        Ok(())
    }

    async fn submit(&self, session: &str) -> Result<()> {
        self.check(session)?;
        let line = self
            .typed
            .lock()
            .map_err(|_| dropped(session, "sink poisoned"))?
            .remove(session)
            .unwrap_or_default();
        self.submitted
            .lock()
            .map_err(|_| dropped(session, "sink poisoned"))?
            .entry(session.to_string())
            .or_default()
            .push(line);
        Ok(())
    }
}
