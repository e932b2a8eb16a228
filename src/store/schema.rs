//! Relational schema for the shared store
//!
//! Folder counters and system-folder protection live in triggers so they
//! fire synchronously with the write that causes them.

use crate::Result;
use rusqlite::Connection;

/// Bumped whenever the DDL below changes shape
pub const SCHEMA_VERSION: i64 = 1;

const TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    capabilities TEXT NOT NULL,
    current_task TEXT,
    status TEXT NOT NULL,
    last_heartbeat TEXT NOT NULL,
    registered_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    priority INTEGER NOT NULL,
    capabilities TEXT NOT NULL,
    resource_key TEXT,
    status TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_resource ON tasks(resource_key, status);

CREATE TABLE IF NOT EXISTS task_assignments (
    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    agent_id TEXT NOT NULL,
    candidate INTEGER NOT NULL DEFAULT 0,
    started INTEGER NOT NULL DEFAULT 0,
    progress INTEGER NOT NULL DEFAULT 0,
    result TEXT,
    reported_at TEXT,
    PRIMARY KEY (task_id, agent_id)
);
CREATE INDEX IF NOT EXISTS idx_assignments_agent ON task_assignments(agent_id);

CREATE TABLE IF NOT EXISTS task_history (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    status TEXT NOT NULL,
    snapshot TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    priority INTEGER NOT NULL,
    capabilities TEXT NOT NULL,
    approval TEXT NOT NULL,
    approved_by TEXT,
    reject_reason TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    dead_letter INTEGER NOT NULL DEFAULT 0,
    available_at TEXT NOT NULL,
    claimed_by TEXT,
    claimed_at TEXT,
    last_error TEXT,
    enqueued_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_ready
    ON queue_entries(dead_letter, approval, priority DESC, id);
CREATE INDEX IF NOT EXISTS idx_queue_task ON queue_entries(task_id);

CREATE TABLE IF NOT EXISTS queue_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_id INTEGER NOT NULL,
    task_id TEXT NOT NULL,
    event TEXT NOT NULL,
    detail TEXT,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS folders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner TEXT NOT NULL REFERENCES users(id),
    parent_id INTEGER REFERENCES folders(id),
    name TEXT NOT NULL,
    folder_type TEXT NOT NULL,
    is_system INTEGER NOT NULL DEFAULT 0,
    message_count INTEGER NOT NULL DEFAULT 0,
    unread_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_folders_unique_name
    ON folders(owner, COALESCE(parent_id, 0), name);
CREATE INDEX IF NOT EXISTS idx_folders_owner ON folders(owner, folder_type);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    thread_id TEXT,
    sender TEXT NOT NULL,
    owner TEXT NOT NULL REFERENCES users(id),
    folder_id INTEGER NOT NULL REFERENCES folders(id),
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    body_format TEXT NOT NULL,
    snippet TEXT NOT NULL,
    size INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    has_attachments INTEGER NOT NULL DEFAULT 0,
    is_read INTEGER NOT NULL DEFAULT 0,
    is_starred INTEGER NOT NULL DEFAULT 0,
    is_important INTEGER NOT NULL DEFAULT 0,
    is_draft INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,
    sent_at TEXT NOT NULL,
    received_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_folder ON messages(folder_id, is_deleted);
CREATE INDEX IF NOT EXISTS idx_messages_owner ON messages(owner, received_at);
CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(owner, thread_id);

CREATE TABLE IF NOT EXISTS recipients (
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    address TEXT NOT NULL,
    kind TEXT NOT NULL,
    PRIMARY KEY (message_id, address, kind)
);

CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    filename TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    UNIQUE (owner, name)
);

CREATE TABLE IF NOT EXISTS message_tags (
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (message_id, tag_id)
);

CREATE TABLE IF NOT EXISTS headers (
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    value TEXT NOT NULL
);
"#;

const TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS trg_messages_insert_counts
AFTER INSERT ON messages
BEGIN
    UPDATE folders SET
        message_count = message_count + (NEW.is_deleted = 0),
        unread_count = unread_count + (NEW.is_deleted = 0 AND NEW.is_read = 0)
    WHERE id = NEW.folder_id;
END;

CREATE TRIGGER IF NOT EXISTS trg_messages_update_counts
AFTER UPDATE OF folder_id, is_read, is_deleted ON messages
BEGIN
    UPDATE folders SET
        message_count = message_count - (OLD.is_deleted = 0),
        unread_count = unread_count - (OLD.is_deleted = 0 AND OLD.is_read = 0)
    WHERE id = OLD.folder_id;
    UPDATE folders SET
        message_count = message_count + (NEW.is_deleted = 0),
        unread_count = unread_count + (NEW.is_deleted = 0 AND NEW.is_read = 0)
    WHERE id = NEW.folder_id;
END;

CREATE TRIGGER IF NOT EXISTS trg_messages_delete_counts
AFTER DELETE ON messages
BEGIN
    UPDATE folders SET
        message_count = message_count - (OLD.is_deleted = 0),
        unread_count = unread_count - (OLD.is_deleted = 0 AND OLD.is_read = 0)
    WHERE id = OLD.folder_id;
END;

CREATE TRIGGER IF NOT EXISTS trg_folders_protect_system
BEFORE DELETE ON folders
WHEN OLD.is_system = 1
BEGIN
    SELECT RAISE(ABORT, 'system folder cannot be removed');
END;

CREATE TRIGGER IF NOT EXISTS trg_folders_pin_system
BEFORE UPDATE OF parent_id ON folders
WHEN OLD.is_system = 1 AND NEW.parent_id IS NOT OLD.parent_id
BEGIN
    SELECT RAISE(ABORT, 'system folder cannot be moved');
END;

CREATE TRIGGER IF NOT EXISTS trg_folders_no_self_parent
BEFORE UPDATE OF parent_id ON folders
WHEN NEW.parent_id = NEW.id
BEGIN
    SELECT RAISE(ABORT, 'folder cannot be its own parent');
END;
"#;

/// Create tables, indexes and triggers if they do not exist yet
pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(TABLES)?;
    conn.execute_batch(TRIGGERS)?;

    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tracing::debug!(from = version, to = SCHEMA_VERSION, "Schema version updated");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_expected_tables_exist() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();

        for table in [
            "users",
            "agents",
            "tasks",
            "task_assignments",
            "task_history",
            "queue_entries",
            "queue_history",
            "folders",
            "messages",
            "recipients",
            "attachments",
            "tags",
            "message_tags",
            "headers",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }

    #[test]
    fn test_system_folder_delete_aborts() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        conn.execute(
            "INSERT INTO users (id, display_name, created_at) VALUES ('u', 'U', 'now')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO folders (owner, name, folder_type, is_system, created_at)
             VALUES ('u', 'Inbox', 'inbox', 1, 'now')",
            [],
        )
        .unwrap();

        let result = conn.execute("DELETE FROM folders WHERE owner = 'u'", []);
        assert!(result.is_err());
    }
}
