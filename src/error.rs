//! Error types for Conclave
//!
//! Defines one error enum covering the coordination, broker and inbox failure
//! modes plus the infrastructure errors they wrap. Uses thiserror for
//! ergonomic error handling.

use thiserror::Error;

/// Result type alias for Conclave operations
pub type Result<T> = std::result::Result<T, ConclaveError>;

/// Comprehensive error type for Conclave operations
#[derive(Error, Debug)]
pub enum ConclaveError {
    /// Two tasks claim the same resource key
    #[error("Conflict: resource '{resource_key}' is already claimed by task {task_id}")]
    Conflict {
        /// The task that already holds the resource
        task_id: String,
        resource_key: String,
    },

    /// Agent acting outside its task assignment
    #[error("Agent '{agent_id}' is not assigned to task {task_id}")]
    NotAssigned { task_id: String, agent_id: String },

    /// Progress value regressed or is out of range
    #[error("Invalid progress for task {task_id}: {requested}% (current {current}%)")]
    InvalidProgress {
        task_id: String,
        current: u8,
        requested: i64,
    },

    /// Folder cycle or depth violation
    #[error("Invalid folder hierarchy: {0}")]
    InvalidHierarchy(String),

    /// Queue entry moved to the dead-letter set
    #[error("Retries exhausted for queue entry {entry_id} after {retry_count} attempts")]
    RetryExhausted { entry_id: i64, retry_count: u32 },

    /// Agent timed out or went offline
    #[error("Agent '{0}' is unavailable")]
    AgentUnavailable(String),

    /// Agent already busy with another task
    #[error("Agent '{agent_id}' is busy with task {current_task}")]
    AgentBusy {
        agent_id: String,
        current_task: String,
    },

    /// Agent registered twice
    #[error("Agent '{0}' is already registered")]
    DuplicateAgent(String),

    /// Notification could not reach a destination session
    #[error("Notification to '{destination}' dropped: {reason}")]
    DeliveryDropped { destination: String, reason: String },

    /// Operation not valid in the current lifecycle state
    #[error("Invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// Agent already recorded a result for the task
    #[error("Agent '{agent_id}' already reported a result for task {task_id}")]
    AlreadyReported { task_id: String, agent_id: String },

    /// System folders cannot be removed
    #[error("Folder {0} is a system folder")]
    SystemFolder(i64),

    /// Folder still holds messages or subfolders
    #[error("Folder {0} is not empty")]
    FolderNotEmpty(i64),

    /// Message or folder belongs to a different owner
    #[error("'{resource}' does not belong to owner '{owner}'")]
    OwnershipMismatch { resource: String, owner: String },

    /// Entity not found
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage errors that are not raw SQLite errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl ConclaveError {
    /// Shorthand for a missing entity
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the error is a structural rejection (no partial mutation, do
    /// not retry) as opposed to a transient infrastructure failure
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::NotAssigned { .. }
                | Self::InvalidProgress { .. }
                | Self::InvalidHierarchy(_)
                | Self::InvalidTransition { .. }
                | Self::AlreadyReported { .. }
                | Self::SystemFolder(_)
                | Self::FolderNotEmpty(_)
                | Self::OwnershipMismatch { .. }
                | Self::DuplicateAgent(_)
                | Self::AgentBusy { .. }
        )
    }

    /// Whether a retry of the same operation could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::Io(_) | Self::DeliveryDropped { .. } | Self::AgentUnavailable(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_task() {
        let err = ConclaveError::Conflict {
            task_id: "task-1".to_string(),
            resource_key: "users-table".to_string(),
        };
        assert!(err.to_string().contains("task-1"));
        assert!(err.to_string().contains("users-table"));
        assert!(err.is_structural());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_busy_database_is_transient() {
        let err = ConclaveError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(err.is_transient());
        assert!(!err.is_structural());
    }
}
