//! Configuration validation
//!
//! Validates Conclave configuration for correctness:
//! - Retry and backoff values are usable
//! - Folder depth and snippet length are non-zero
//! - Queue capacity is non-zero (a short submit delay is only warned about)
//! - Sweep intervals are non-zero

use super::conclave_config::ConclaveConfig;
use crate::notify::MIN_SUBMIT_DELAY;
use crate::ConclaveError;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub section: Option<String>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            section: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn in_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref section) = self.section {
            write!(f, "[{}] {}: {}", section, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a Conclave configuration
pub fn validate_config(config: &ConclaveConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.store.path.as_os_str().is_empty() {
        errors.push(ValidationError::new("path", "Database path must not be empty").in_section("store"));
    }

    if config.registry.heartbeat_timeout_secs == 0 {
        errors.push(
            ValidationError::new("heartbeat_timeout_secs", "Must be greater than 0")
                .in_section("registry"),
        );
    }

    if config.coordinator.history_limit == 0 {
        errors.push(
            ValidationError::new("history_limit", "Must keep at least one history entry")
                .in_section("coordinator"),
        );
    }

    if config.coordinator.results_owner.trim().is_empty() {
        errors.push(
            ValidationError::new("results_owner", "Results owner must not be empty")
                .in_section("coordinator"),
        );
    }

    if config.broker.base_delay_ms == 0 {
        errors.push(ValidationError::new("base_delay_ms", "Must be greater than 0").in_section("broker"));
    }

    if config.broker.max_delay_ms < config.broker.base_delay_ms {
        errors.push(
            ValidationError::new(
                "max_delay_ms",
                format!(
                    "Must be at least base_delay_ms ({})",
                    config.broker.base_delay_ms
                ),
            )
            .in_section("broker"),
        );
    }

    if config.broker.claim_timeout_secs == 0 {
        errors.push(
            ValidationError::new("claim_timeout_secs", "Must be greater than 0").in_section("broker"),
        );
    }

    if config.inbox.max_folder_depth == 0 {
        errors.push(
            ValidationError::new("max_folder_depth", "Must allow at least one level")
                .in_section("inbox"),
        );
    }

    if config.inbox.snippet_length == 0 {
        errors.push(ValidationError::new("snippet_length", "Must be greater than 0").in_section("inbox"));
    }

    // Clamped at use, so only worth a warning
    if (config.notify.submit_delay_ms as u128) < MIN_SUBMIT_DELAY.as_millis() {
        tracing::warn!(
            configured_ms = config.notify.submit_delay_ms,
            min_ms = MIN_SUBMIT_DELAY.as_millis() as u64,
            "notify.submit_delay_ms below lower bound, clamping"
        );
    }

    if config.notify.queue_capacity == 0 {
        errors.push(ValidationError::new("queue_capacity", "Must be greater than 0").in_section("notify"));
    }

    if config.scheduler.heartbeat_sweep_secs == 0 || config.scheduler.queue_sweep_secs == 0 {
        errors.push(
            ValidationError::new("interval", "Sweep intervals must be greater than 0")
                .in_section("scheduler"),
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate configuration and return a Result
pub fn validate_config_result(config: &ConclaveConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        ConclaveError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ConclaveConfig::new();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_short_submit_delay_is_not_an_error() {
        let mut config = ConclaveConfig::new();
        config.notify.submit_delay_ms = 0;
        assert!(validate_config(&config).is_ok());

        config.notify.queue_capacity = 0;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "queue_capacity");
        assert!(errors[0].to_string().starts_with("[notify]"));
    }

    #[test]
    fn test_collects_multiple_errors() {
        let mut config = ConclaveConfig::new();
        config.coordinator.history_limit = 0;
        config.broker.base_delay_ms = 10_000;
        config.broker.max_delay_ms = 1_000;
        config.inbox.max_folder_depth = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_result_wraps_config_error() {
        let mut config = ConclaveConfig::new();
        config.scheduler.queue_sweep_secs = 0;

        let err = validate_config_result(&config).unwrap_err();
        assert!(matches!(err, ConclaveError::Config(msg) if msg.contains("scheduler")));
    }
}
