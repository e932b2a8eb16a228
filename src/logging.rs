//! Logging configuration using tracing
//!
//! Structured logging to stderr with support for the RUST_LOG environment variable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber
///
/// Sets up structured logging with:
/// - Filtering via RUST_LOG (defaults to "warn" for quiet CLI output)
/// - Formatted output to stderr with targets and thread ids
///
/// # Example RUST_LOG values
/// - `RUST_LOG=info` - lifecycle events (task started, completed, entry approved)
/// - `RUST_LOG=conclave::broker=debug` - every claim, ack and retry
/// - `RUST_LOG=conclave=debug,rusqlite=warn` - different levels per crate
///
/// # Errors
/// Returns an error if the subscriber has already been initialized
pub fn init() -> crate::Result<()> {
    init_with_default("warn")
}

/// Like [`init`], with a different fallback filter when RUST_LOG is unset
pub fn init_with_default(default_filter: &str) -> crate::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| crate::ConclaveError::Other(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init();
}
