//! Conclave - coordination for cooperating agent processes
//!
//! Conclave lets independent agent processes share work through one SQLite
//! database: a task coordinator tracks who is doing what, a priority broker
//! hands out work with retries and approval gates, and every agent gets a
//! folder-structured inbox. State changes are pushed into agent terminal
//! sessions as one-line notifications.
//!
//! # Architecture
//!
//! - **store**: Shared SQLite database, schema and counter triggers
//! - **registry**: Agent registration, heartbeats and availability
//! - **coordinator**: Task lifecycle, progress aggregation and history
//! - **broker**: Priority queue with approval, backoff and dead letters
//! - **inbox**: Folders, messages, flags, tags and search
//! - **notify**: Per-session delivery of event lines (tmux)
//! - **scheduler**: Heartbeat and stale-claim sweeps
//! - **hub**: All of the above wired over one store

// Core modules
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod priority;
pub mod store;
pub mod style;

// Components
pub mod broker;
pub mod coordinator;
pub mod hub;
pub mod inbox;
pub mod notify;
pub mod registry;
pub mod scheduler;

// Re-exports
pub use error::{ConclaveError, Result};
pub use hub::Hub;
pub use priority::Priority;
