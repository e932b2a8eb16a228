//! Background sweeps
//!
//! Heartbeat timeouts and stale queue claims are detected by polling. The
//! scheduler owns both sweeps and runs them on their configured cadence as a
//! tokio event loop, until it receives a shutdown command or a signal.

use crate::broker::{NackOutcome, QueueStats};
use crate::config::{BrokerConfig, RegistryConfig, SchedulerConfig};
use crate::coordinator::Coordinator;
use crate::registry::AgentRegistry;
use crate::{metrics, ConclaveError, Result};
use std::time::Duration;
use tokio::sync::mpsc;

/// Commands that can be sent to a running scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// Run both sweeps immediately
    SweepNow,

    /// Stop the loop
    Shutdown,
}

enum CommandResult {
    Continue,
    Stop,
}

/// What one heartbeat sweep did
#[derive(Debug, Clone, Default)]
pub struct HeartbeatSweep {
    /// Agents newly marked offline
    pub offline_agents: Vec<String>,
    /// Tasks failed or re-queued by the orphan policy
    pub affected_tasks: Vec<String>,
}

/// Outcome of a full [`Scheduler::tick`]
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub heartbeat: HeartbeatSweep,
    /// Stale claims that were counted as failed attempts
    pub requeued: Vec<(i64, NackOutcome)>,
    pub stats: QueueStats,
}

/// Polling sweeps over the registry and the broker
pub struct Scheduler {
    registry: AgentRegistry,
    coordinator: Coordinator,
    config: SchedulerConfig,
    heartbeat_timeout: Duration,
    claim_timeout: Duration,
    command_rx: Option<mpsc::Receiver<SchedulerCommand>>,
    command_tx: mpsc::Sender<SchedulerCommand>,
}

impl Scheduler {
    pub fn new(
        registry: AgentRegistry,
        coordinator: Coordinator,
        config: SchedulerConfig,
        registry_config: &RegistryConfig,
        broker_config: &BrokerConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(10);
        Self {
            registry,
            coordinator,
            config,
            heartbeat_timeout: registry_config.heartbeat_timeout(),
            claim_timeout: broker_config.claim_timeout(),
            command_rx: Some(command_rx),
            command_tx,
        }
    }

    /// Get a command sender
    pub fn command_sender(&self) -> mpsc::Sender<SchedulerCommand> {
        self.command_tx.clone()
    }

    /// Mark silent agents offline and apply the orphan policy to their tasks
    pub fn sweep_heartbeats(&self) -> Result<HeartbeatSweep> {
        let offline = self.registry.sweep_offline(self.heartbeat_timeout)?;
        let affected_tasks = self.coordinator.handle_offline_agents(&offline)?;
        Ok(HeartbeatSweep {
            offline_agents: offline.into_iter().map(|a| a.id).collect(),
            affected_tasks,
        })
    }

    /// Count stale claims as failed attempts, drop entries of finished
    /// tasks and refresh the depth gauge
    pub fn sweep_queue(&self) -> Result<(Vec<(i64, NackOutcome)>, QueueStats)> {
        let broker = self.coordinator.broker();
        let requeued = broker.requeue_stale_claims(self.claim_timeout)?;
        broker.discard_finished()?;
        let stats = broker.stats()?;
        Ok((requeued, stats))
    }

    /// Run one pass of every sweep
    pub fn tick(&self) -> Result<TickReport> {
        let heartbeat = self.sweep_heartbeats()?;
        let (requeued, stats) = self.sweep_queue()?;

        tracing::debug!(
            offline = heartbeat.offline_agents.len(),
            affected = heartbeat.affected_tasks.len(),
            requeued = requeued.len(),
            depth = stats.depth(),
            "Scheduler tick"
        );

        Ok(TickReport {
            heartbeat,
            requeued,
            stats,
        })
    }

    /// Run the sweep loop until shutdown
    pub async fn run(&mut self) -> Result<()> {
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| ConclaveError::Config("Scheduler already running".to_string()))?;

        let mut heartbeat_interval = tokio::time::interval(self.config.heartbeat_sweep_interval());
        let mut queue_interval = tokio::time::interval(self.config.queue_sweep_interval());

        tracing::info!(
            heartbeat_secs = self.config.heartbeat_sweep_secs,
            queue_secs = self.config.queue_sweep_secs,
            "Scheduler started"
        );

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
                ConclaveError::Other(format!("Failed to set up SIGTERM handler: {}", e))
            })?;

            loop {
                tokio::select! {
                    _ = heartbeat_interval.tick() => self.log_heartbeat_sweep(),
                    _ = queue_interval.tick() => self.log_queue_sweep(),
                    Some(cmd) = command_rx.recv() => {
                        if let CommandResult::Stop = self.handle_command(cmd) {
                            break;
                        }
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, stopping scheduler");
                        break;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Received SIGINT, stopping scheduler");
                        break;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            loop {
                tokio::select! {
                    _ = heartbeat_interval.tick() => self.log_heartbeat_sweep(),
                    _ = queue_interval.tick() => self.log_queue_sweep(),
                    Some(cmd) = command_rx.recv() => {
                        if let CommandResult::Stop = self.handle_command(cmd) {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Received Ctrl+C, stopping scheduler");
                        break;
                    }
                }
            }
        }

        self.command_rx = Some(command_rx);
        tracing::info!("Scheduler stopped");
        Ok(())
    }

    fn handle_command(&self, cmd: SchedulerCommand) -> CommandResult {
        match cmd {
            SchedulerCommand::SweepNow => {
                self.log_heartbeat_sweep();
                self.log_queue_sweep();
                CommandResult::Continue
            }
            SchedulerCommand::Shutdown => {
                tracing::info!("Shutdown requested");
                CommandResult::Stop
            }
        }
    }

    // Sweep failures are logged and retried on the next interval
    fn log_heartbeat_sweep(&self) {
        match self.sweep_heartbeats() {
            Ok(sweep) if !sweep.offline_agents.is_empty() => tracing::info!(
                offline = ?sweep.offline_agents,
                affected = ?sweep.affected_tasks,
                "Heartbeat sweep"
            ),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Heartbeat sweep failed"),
        }
    }

    fn log_queue_sweep(&self) {
        match self.sweep_queue() {
            Ok((requeued, stats)) => {
                if !requeued.is_empty() {
                    tracing::info!(count = requeued.len(), "Stale claims requeued");
                }
                metrics::set_queue_depth(stats.depth());
            }
            Err(e) => tracing::error!(error = %e, "Queue sweep failed"),
        }
    }
}
