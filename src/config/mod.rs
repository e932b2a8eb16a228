//! Configuration system
//!
//! Loads ~/.config/conclave/config.yaml with sections for:
//! - The shared SQLite store
//! - Agent heartbeat timeouts
//! - Coordinator history and orphan policy
//! - Broker retries, backoff and approval
//! - Inbox folder depth and snippets
//! - Notification pacing
//! - Scheduler sweep cadence

mod conclave_config;
pub mod validation;

pub use conclave_config::{
    BrokerConfig, ConclaveConfig, CoordinatorConfig, InboxConfig, NotifyConfig, RegistryConfig,
    SchedulerConfig, StoreConfig,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
