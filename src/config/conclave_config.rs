//! Conclave configuration file handling
//!
//! Loads and manages the ~/.config/conclave/config.yaml file. Every section
//! and field carries a serde default so partial files are valid.

use crate::coordinator::OrphanPolicy;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn config_dir() -> PathBuf {
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("conclave");
    path
}

/// Persistent store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the shared SQLite database
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Enable WAL mode for concurrent readers across processes
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// How long a writer waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    config_dir().join("conclave.db")
}

fn default_true() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            wal_mode: true,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Store config pointing at a specific file
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Agent registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Seconds without a heartbeat before an agent is marked offline
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

fn default_heartbeat_timeout_secs() -> u64 {
    90
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Task coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Number of terminal tasks kept in the history log
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// What happens to an in-progress task whose agent goes offline
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,

    /// Inbox owner that receives task result messages
    #[serde(default = "default_results_owner")]
    pub results_owner: String,
}

fn default_history_limit() -> usize {
    50
}

fn default_results_owner() -> String {
    "controller".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            orphan_policy: OrphanPolicy::default(),
            results_owner: default_results_owner(),
        }
    }
}

/// Priority broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Failed attempts allowed before an entry is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the exponential retry delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Require a supervisor to approve entries that are not auto-approved
    #[serde(default)]
    pub require_manual_approval: bool,

    /// Seconds a claimed entry may stay unacknowledged before it counts as a failed attempt
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_claim_timeout_secs() -> u64 {
    600
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            require_manual_approval: false,
            claim_timeout_secs: default_claim_timeout_secs(),
        }
    }
}

impl BrokerConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    /// Backoff before the attempt following `retry_count` failures:
    /// `base_delay * 2^(retry_count - 1)`, capped at `max_delay`
    pub fn backoff_duration(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        let base = self.base_delay().as_secs_f64() * 2f64.powi(exponent as i32);
        Duration::from_secs_f64(base.min(self.max_delay().as_secs_f64()))
    }
}

/// Inbox store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxConfig {
    /// Maximum folder nesting depth
    #[serde(default = "default_max_folder_depth")]
    pub max_folder_depth: usize,

    /// Characters kept in a generated snippet
    #[serde(default = "default_snippet_length")]
    pub snippet_length: usize,
}

fn default_max_folder_depth() -> usize {
    10
}

fn default_snippet_length() -> usize {
    100
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            max_folder_depth: default_max_folder_depth(),
            snippet_length: default_snippet_length(),
        }
    }
}

/// Notification delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Pause between sending a line and the submit signal; clamped to
    /// [`crate::notify::MIN_SUBMIT_DELAY`]
    #[serde(default = "default_submit_delay_ms")]
    pub submit_delay_ms: u64,

    /// Pending notifications buffered per destination
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// tmux executable used by the terminal sink
    #[serde(default = "default_tmux_binary")]
    pub tmux_binary: String,

    /// A destination worker with nothing queued for this long shuts down;
    /// the next line for it starts a fresh one
    #[serde(default = "default_worker_idle_ms")]
    pub worker_idle_ms: u64,
}

fn default_submit_delay_ms() -> u64 {
    300
}

fn default_queue_capacity() -> usize {
    256
}

fn default_tmux_binary() -> String {
    "tmux".to_string()
}

fn default_worker_idle_ms() -> u64 {
    300_000
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            submit_delay_ms: default_submit_delay_ms(),
            queue_capacity: default_queue_capacity(),
            tmux_binary: default_tmux_binary(),
            worker_idle_ms: default_worker_idle_ms(),
        }
    }
}

impl NotifyConfig {
    pub fn submit_delay(&self) -> Duration {
        Duration::from_millis(self.submit_delay_ms).max(crate::notify::MIN_SUBMIT_DELAY)
    }

    pub fn worker_idle(&self) -> Duration {
        Duration::from_millis(self.worker_idle_ms.max(1))
    }
}

/// Polling cadence for background sweeps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between heartbeat-timeout sweeps
    #[serde(default = "default_heartbeat_sweep_secs")]
    pub heartbeat_sweep_secs: u64,

    /// Interval between stale-claim sweeps of the queue
    #[serde(default = "default_queue_sweep_secs")]
    pub queue_sweep_secs: u64,
}

fn default_heartbeat_sweep_secs() -> u64 {
    30
}

fn default_queue_sweep_secs() -> u64 {
    15
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_sweep_secs: default_heartbeat_sweep_secs(),
            queue_sweep_secs: default_queue_sweep_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_sweep_secs)
    }

    pub fn queue_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.queue_sweep_secs)
    }
}

/// Conclave configuration
///
/// Represents the complete ~/.config/conclave/config.yaml file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConclaveConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub inbox: InboxConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl ConclaveConfig {
    /// Create a configuration with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with the database placed at `path`
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig::at(path),
            ..Default::default()
        }
    }

    /// Load configuration from the default path (~/.config/conclave/config.yaml)
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        Self::load(&path)
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::ConclaveError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading Conclave configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            db = %config.store.path.display(),
            max_retries = config.broker.max_retries,
            orphan_policy = ?config.coordinator.orphan_policy,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save_default(&self) -> Result<()> {
        let path = Self::default_path();
        self.save(&path)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving Conclave configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/conclave/config.yaml)
    pub fn default_path() -> PathBuf {
        config_dir().join("config.yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = ConclaveConfig::with_db_path(dir.path().join("c.db"));
        config.broker.max_retries = 5;
        config.coordinator.orphan_policy = OrphanPolicy::Reassign;
        config.save(&path).unwrap();

        let loaded = ConclaveConfig::load(&path).unwrap();
        assert_eq!(loaded.broker.max_retries, 5);
        assert_eq!(loaded.coordinator.orphan_policy, OrphanPolicy::Reassign);
        assert_eq!(loaded.store.path, dir.path().join("c.db"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ConclaveConfig = serde_yaml::from_str("broker:\n  max_retries: 7\n").unwrap();
        assert_eq!(config.broker.max_retries, 7);
        assert_eq!(config.broker.base_delay_ms, 1000);
        assert_eq!(config.coordinator.history_limit, 50);
        assert_eq!(config.inbox.max_folder_depth, 10);
        assert_eq!(config.coordinator.orphan_policy, OrphanPolicy::LeaveRunning);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = ConclaveConfig::load(dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, crate::ConclaveError::Config(_)));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let broker = BrokerConfig {
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            ..Default::default()
        };
        assert_eq!(broker.backoff_duration(1), Duration::from_secs(1));
        assert_eq!(broker.backoff_duration(2), Duration::from_secs(2));
        assert_eq!(broker.backoff_duration(3), Duration::from_secs(4));
        assert_eq!(broker.backoff_duration(4), Duration::from_secs(5));
        assert_eq!(broker.backoff_duration(40), Duration::from_secs(5));
    }

    #[test]
    fn test_submit_delay_is_clamped() {
        let notify = NotifyConfig {
            submit_delay_ms: 0,
            ..Default::default()
        };
        assert_eq!(notify.submit_delay(), crate::notify::MIN_SUBMIT_DELAY);
    }
}
