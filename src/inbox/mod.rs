//! Inbox Store
//!
//! Persists addressed messages into per-owner folder trees.
//!
//! # Overview
//!
//! - **Owners** get the system folders (Inbox, Sent, Drafts, Trash, Archive)
//!   the first time they are seen
//! - **Folders** form a tree per owner with bounded depth and no cycles
//! - **Messages** carry recipients, attachments, tags and headers as child
//!   records and are soft-deleted before they are purged
//!
//! Folder `message_count` / `unread_count` are maintained by store triggers
//! in the same transaction as the message write, so they always equal the
//! live and live-unread message counts.

mod folder;
mod message;

pub use folder::{Folder, FolderType};
pub use message::{
    make_snippet, Attachment, BodyFormat, DeliverRequest, Message, Recipient, RecipientKind,
    StatusFlag,
};

use crate::config::InboxConfig;
use crate::store::{now_ts, Store};
use crate::{ConclaveError, Result};
use folder::{
    chain_depth_in, load_folder_in, row_to_folder, subtree_height_in, system_folder_in,
    FOLDER_COLUMNS,
};
use message::{row_to_message, MESSAGE_COLUMNS};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Folder whose stored counters disagree with its messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterDrift {
    pub folder_id: i64,
    pub stored_total: i64,
    pub actual_total: i64,
    pub stored_unread: i64,
    pub actual_unread: i64,
}

/// Create the user row and system folders if missing
pub(crate) fn ensure_owner_in(conn: &Connection, owner: &str, display_name: &str) -> Result<()> {
    if owner.trim().is_empty() {
        return Err(ConclaveError::Other("owner must not be empty".to_string()));
    }
    let now = now_ts();

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO users (id, display_name, created_at) VALUES (?1, ?2, ?3)",
        params![owner, display_name, now],
    )?;

    for folder_type in FolderType::SYSTEM {
        conn.execute(
            "INSERT OR IGNORE INTO folders (owner, parent_id, name, folder_type, is_system, created_at)
             VALUES (?1, NULL, ?2, ?3, 1, ?4)",
            params![owner, folder_type.default_name(), folder_type.as_str(), now],
        )?;
    }

    if inserted > 0 {
        info!(owner, "Created mailbox");
    }
    Ok(())
}

fn insert_message_in(
    conn: &Connection,
    req: &DeliverRequest,
    owner: &str,
    folder_id: i64,
    snippet: &str,
    is_read: bool,
    now: &str,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let size = (req.subject.len() + req.body.len()) as i64;

    conn.execute(
        "INSERT INTO messages (id, thread_id, sender, owner, folder_id, subject, body, body_format,
                               snippet, size, priority, has_attachments, is_read, sent_at, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
        params![
            id,
            req.thread_id,
            req.sender,
            owner,
            folder_id,
            req.subject,
            req.body,
            req.body_format.as_str(),
            snippet,
            size,
            req.priority.rank(),
            !req.attachments.is_empty(),
            is_read,
            now,
        ],
    )?;

    for recipient in &req.recipients {
        conn.execute(
            "INSERT OR IGNORE INTO recipients (message_id, address, kind) VALUES (?1, ?2, ?3)",
            params![id, recipient.address, recipient.kind.as_str()],
        )?;
    }
    for attachment in &req.attachments {
        conn.execute(
            "INSERT INTO attachments (message_id, filename, content_type, size)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, attachment.filename, attachment.content_type, attachment.size],
        )?;
    }
    for (name, value) in &req.headers {
        conn.execute(
            "INSERT INTO headers (message_id, name, value) VALUES (?1, ?2, ?3)",
            params![id, name, value],
        )?;
    }

    Ok(id)
}

fn tag_in(conn: &Connection, owner: &str, message_id: &str, tag: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO tags (owner, name) VALUES (?1, ?2)",
        params![owner, tag],
    )?;
    let tag_id: i64 = conn.query_row(
        "SELECT id FROM tags WHERE owner = ?1 AND name = ?2",
        params![owner, tag],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO message_tags (message_id, tag_id) VALUES (?1, ?2)",
        params![message_id, tag_id],
    )?;
    Ok(())
}

/// Deliver a message inside an existing transaction. Returns the new id.
pub(crate) fn deliver_in(
    conn: &Connection,
    config: &InboxConfig,
    req: &DeliverRequest,
) -> Result<String> {
    ensure_owner_in(conn, &req.owner, &req.owner)?;

    let folder = match req.folder_id {
        Some(id) => {
            let folder = load_folder_in(conn, id)?;
            if folder.owner != req.owner {
                return Err(ConclaveError::OwnershipMismatch {
                    resource: format!("folder {}", id),
                    owner: req.owner.clone(),
                });
            }
            folder
        }
        None => system_folder_in(conn, &req.owner, FolderType::Inbox)?,
    };

    let snippet = match &req.snippet {
        Some(s) => s.clone(),
        None => make_snippet(&req.body, config.snippet_length),
    };
    let now = now_ts();

    let id = insert_message_in(conn, req, &req.owner, folder.id, &snippet, false, &now)?;
    for tag in &req.tags {
        tag_in(conn, &req.owner, &id, tag)?;
    }

    if req.copy_to_sent {
        ensure_owner_in(conn, &req.sender, &req.sender)?;
        let sent = system_folder_in(conn, &req.sender, FolderType::Sent)?;
        let copy_id = insert_message_in(conn, req, &req.sender, sent.id, &snippet, true, &now)?;
        debug!(message = %copy_id, sender = %req.sender, "Filed sent copy");
    }

    debug!(
        message = %id,
        owner = %req.owner,
        folder = folder.id,
        subject = %req.subject,
        "Message delivered"
    );
    Ok(id)
}

fn load_message_in(conn: &Connection, message_id: &str) -> Result<Message> {
    let mut message = conn
        .query_row(
            &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
            params![message_id],
            row_to_message,
        )
        .optional()?
        .ok_or_else(|| ConclaveError::not_found("message", message_id))?;

    let mut stmt =
        conn.prepare("SELECT address, kind FROM recipients WHERE message_id = ?1 ORDER BY rowid")?;
    message.recipients = stmt
        .query_map(params![message_id], |row| {
            Ok(Recipient {
                address: row.get(0)?,
                kind: RecipientKind::parse(&row.get::<_, String>(1)?),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT filename, content_type, size FROM attachments WHERE message_id = ?1 ORDER BY id",
    )?;
    message.attachments = stmt
        .query_map(params![message_id], |row| {
            Ok(Attachment {
                filename: row.get(0)?,
                content_type: row.get(1)?,
                size: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT t.name FROM tags t JOIN message_tags mt ON mt.tag_id = t.id
         WHERE mt.message_id = ?1 ORDER BY t.name",
    )?;
    message.tags = stmt
        .query_map(params![message_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt =
        conn.prepare("SELECT name, value FROM headers WHERE message_id = ?1 ORDER BY rowid")?;
    message.headers = stmt
        .query_map(params![message_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(message)
}

fn load_messages_in(conn: &Connection, ids: Vec<String>) -> Result<Vec<Message>> {
    ids.iter().map(|id| load_message_in(conn, id)).collect()
}

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Structured inbox store backed by the shared database
#[derive(Clone)]
pub struct InboxStore {
    store: Arc<Store>,
    config: InboxConfig,
}

impl InboxStore {
    pub fn new(store: Arc<Store>, config: InboxConfig) -> Self {
        Self { store, config }
    }

    /// Register an owner and create its system folders; idempotent
    pub fn ensure_owner(&self, owner: &str, display_name: &str) -> Result<Vec<Folder>> {
        self.store
            .write(|conn| ensure_owner_in(conn, owner, display_name))?;
        self.folders(owner)
    }

    /// All folders of an owner, system folders first
    pub fn folders(&self, owner: &str) -> Result<Vec<Folder>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM folders WHERE owner = ?1 ORDER BY is_system DESC, id",
                FOLDER_COLUMNS
            ))?;
            let folders = stmt
                .query_map(params![owner], row_to_folder)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(folders)
        })
    }

    pub fn folder(&self, folder_id: i64) -> Result<Folder> {
        self.store.read(|conn| load_folder_in(conn, folder_id))
    }

    pub fn system_folder(&self, owner: &str, folder_type: FolderType) -> Result<Folder> {
        self.store
            .read(|conn| system_folder_in(conn, owner, folder_type))
    }

    /// Create a custom folder, optionally under `parent`
    pub fn create_folder(&self, owner: &str, name: &str, parent: Option<i64>) -> Result<Folder> {
        let max_depth = self.config.max_folder_depth;

        self.store.write(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                params![owner],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(ConclaveError::not_found("owner", owner));
            }

            if let Some(parent_id) = parent {
                let parent = load_folder_in(conn, parent_id)?;
                if parent.owner != owner {
                    return Err(ConclaveError::OwnershipMismatch {
                        resource: format!("folder {}", parent_id),
                        owner: owner.to_string(),
                    });
                }
                let depth = chain_depth_in(conn, parent_id, None, max_depth)?;
                if depth + 1 > max_depth {
                    return Err(ConclaveError::InvalidHierarchy(format!(
                        "folder '{}' would exceed maximum depth {}",
                        name, max_depth
                    )));
                }
            }

            let taken: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM folders
                 WHERE owner = ?1 AND COALESCE(parent_id, 0) = COALESCE(?2, 0) AND name = ?3)",
                params![owner, parent, name],
                |row| row.get(0),
            )?;
            if taken {
                return Err(ConclaveError::InvalidHierarchy(format!(
                    "folder '{}' already exists at that level",
                    name
                )));
            }

            conn.execute(
                "INSERT INTO folders (owner, parent_id, name, folder_type, is_system, created_at)
                 VALUES (?1, ?2, ?3, 'custom', 0, ?4)",
                params![owner, parent, name, now_ts()],
            )?;
            load_folder_in(conn, conn.last_insert_rowid())
        })
    }

    /// Re-parent a folder. `None` moves it to the top level.
    pub fn move_folder(&self, folder_id: i64, new_parent: Option<i64>) -> Result<Folder> {
        let max_depth = self.config.max_folder_depth;

        self.store.write(|conn| {
            let folder = load_folder_in(conn, folder_id)?;
            if folder.is_system {
                return Err(ConclaveError::SystemFolder(folder_id));
            }

            let parent_depth = match new_parent {
                Some(parent_id) => {
                    let parent = load_folder_in(conn, parent_id)?;
                    if parent.owner != folder.owner {
                        return Err(ConclaveError::OwnershipMismatch {
                            resource: format!("folder {}", parent_id),
                            owner: folder.owner.clone(),
                        });
                    }
                    chain_depth_in(conn, parent_id, Some(folder_id), max_depth)?
                }
                None => 0,
            };

            let height = subtree_height_in(conn, folder_id, max_depth)?;
            if parent_depth + height > max_depth {
                return Err(ConclaveError::InvalidHierarchy(format!(
                    "moving folder {} would exceed maximum depth {}",
                    folder_id, max_depth
                )));
            }

            conn.execute(
                "UPDATE folders SET parent_id = ?2 WHERE id = ?1",
                params![folder_id, new_parent],
            )?;
            load_folder_in(conn, folder_id)
        })
    }

    pub fn rename_folder(&self, folder_id: i64, name: &str) -> Result<Folder> {
        self.store.write(|conn| {
            let folder = load_folder_in(conn, folder_id)?;
            if folder.is_system {
                return Err(ConclaveError::SystemFolder(folder_id));
            }
            conn.execute(
                "UPDATE folders SET name = ?2 WHERE id = ?1",
                params![folder_id, name],
            )?;
            load_folder_in(conn, folder_id)
        })
    }

    /// Delete an empty custom folder
    pub fn delete_folder(&self, folder_id: i64) -> Result<()> {
        self.store.write(|conn| {
            let folder = load_folder_in(conn, folder_id)?;
            if folder.is_system {
                return Err(ConclaveError::SystemFolder(folder_id));
            }

            let (messages, children): (i64, i64) = conn.query_row(
                "SELECT (SELECT COUNT(*) FROM messages WHERE folder_id = ?1),
                        (SELECT COUNT(*) FROM folders WHERE parent_id = ?1)",
                params![folder_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if messages > 0 || children > 0 {
                return Err(ConclaveError::FolderNotEmpty(folder_id));
            }

            conn.execute("DELETE FROM folders WHERE id = ?1", params![folder_id])?;
            Ok(())
        })
    }

    /// Deliver a message into its owner's mailbox. Returns the message id.
    pub fn deliver_message(&self, req: DeliverRequest) -> Result<String> {
        self.store.write(|conn| deliver_in(conn, &self.config, &req))
    }

    pub fn get_message(&self, message_id: &str) -> Result<Message> {
        self.store.read(|conn| load_message_in(conn, message_id))
    }

    /// Set or clear a flag. Setting `Deleted` soft-deletes and records
    /// `deleted_at`; clearing it restores the message.
    pub fn update_status(&self, message_id: &str, flag: StatusFlag, value: bool) -> Result<()> {
        self.store.write(|conn| {
            let changed = match flag {
                StatusFlag::Deleted => conn.execute(
                    "UPDATE messages SET is_deleted = ?2,
                         deleted_at = CASE WHEN ?2 THEN ?3 ELSE NULL END
                     WHERE id = ?1",
                    params![message_id, value, now_ts()],
                )?,
                _ => conn.execute(
                    &format!("UPDATE messages SET {} = ?2 WHERE id = ?1", flag.column()),
                    params![message_id, value],
                )?,
            };
            if changed == 0 {
                return Err(ConclaveError::not_found("message", message_id));
            }
            debug!(message = message_id, %flag, value, "Message flag updated");
            Ok(())
        })
    }

    /// Move a message to another folder of the same owner
    pub fn move_message(&self, message_id: &str, target_folder_id: i64) -> Result<()> {
        self.store.write(|conn| {
            let owner: String = conn
                .query_row(
                    "SELECT owner FROM messages WHERE id = ?1",
                    params![message_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| ConclaveError::not_found("message", message_id))?;

            let target = load_folder_in(conn, target_folder_id)?;
            if target.owner != owner {
                return Err(ConclaveError::OwnershipMismatch {
                    resource: format!("folder {}", target_folder_id),
                    owner,
                });
            }

            conn.execute(
                "UPDATE messages SET folder_id = ?2 WHERE id = ?1",
                params![message_id, target_folder_id],
            )?;
            Ok(())
        })
    }

    /// Move a message into its owner's Archive folder
    pub fn archive(&self, message_id: &str) -> Result<()> {
        let message = self.get_message(message_id)?;
        let archive = self.system_folder(&message.owner, FolderType::Archive)?;
        self.move_message(message_id, archive.id)
    }

    /// Physically remove a message and its child records
    pub fn purge(&self, message_id: &str) -> Result<()> {
        self.store.write(|conn| {
            let removed = conn.execute("DELETE FROM messages WHERE id = ?1", params![message_id])?;
            if removed == 0 {
                return Err(ConclaveError::not_found("message", message_id));
            }
            Ok(())
        })
    }

    /// Remove every soft-deleted message of an owner
    pub fn purge_deleted(&self, owner: &str) -> Result<usize> {
        let removed = self.store.write(|conn| {
            Ok(conn.execute(
                "DELETE FROM messages WHERE owner = ?1 AND is_deleted = 1",
                params![owner],
            )?)
        })?;
        if removed > 0 {
            info!(owner, removed, "Purged deleted messages");
        }
        Ok(removed)
    }

    /// Ids of live messages whose subject or body contains `query`
    /// (case-insensitive), newest first
    pub fn search(&self, owner: &str, query: &str) -> Result<Vec<String>> {
        let pattern = format!("%{}%", escape_like(query));
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM messages
                 WHERE owner = ?1 AND is_deleted = 0
                   AND (subject LIKE ?2 ESCAPE '\\' OR body LIKE ?2 ESCAPE '\\')
                 ORDER BY received_at DESC, rowid DESC",
            )?;
            let ids = stmt
                .query_map(params![owner, pattern], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Live messages of one thread, oldest first
    pub fn thread(&self, owner: &str, thread_id: &str) -> Result<Vec<Message>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM messages
                 WHERE owner = ?1 AND thread_id = ?2 AND is_deleted = 0
                 ORDER BY sent_at, rowid",
            )?;
            let ids = stmt
                .query_map(params![owner, thread_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            load_messages_in(conn, ids)
        })
    }

    /// Messages in a folder, newest first
    pub fn list_folder(&self, folder_id: i64, include_deleted: bool) -> Result<Vec<Message>> {
        self.store.read(|conn| {
            load_folder_in(conn, folder_id)?;
            let mut stmt = conn.prepare(
                "SELECT id FROM messages
                 WHERE folder_id = ?1 AND (?2 OR is_deleted = 0)
                 ORDER BY received_at DESC, rowid DESC",
            )?;
            let ids = stmt
                .query_map(params![folder_id, include_deleted], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            load_messages_in(conn, ids)
        })
    }

    pub fn tag_message(&self, message_id: &str, tag: &str) -> Result<()> {
        self.store.write(|conn| {
            let message = load_message_in(conn, message_id)?;
            tag_in(conn, &message.owner, message_id, tag)
        })
    }

    pub fn untag_message(&self, message_id: &str, tag: &str) -> Result<()> {
        self.store.write(|conn| {
            conn.execute(
                "DELETE FROM message_tags
                 WHERE message_id = ?1
                   AND tag_id IN (SELECT t.id FROM tags t JOIN messages m ON m.owner = t.owner
                                  WHERE m.id = ?1 AND t.name = ?2)",
                params![message_id, tag],
            )?;
            Ok(())
        })
    }

    /// Ids of live messages carrying `tag`, newest first
    pub fn messages_with_tag(&self, owner: &str, tag: &str) -> Result<Vec<String>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id FROM messages m
                 JOIN message_tags mt ON mt.message_id = m.id
                 JOIN tags t ON t.id = mt.tag_id
                 WHERE t.owner = ?1 AND t.name = ?2 AND m.is_deleted = 0
                 ORDER BY m.received_at DESC, m.rowid DESC",
            )?;
            let ids = stmt
                .query_map(params![owner, tag], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Folders whose stored counters disagree with their messages
    pub fn verify_counters(&self) -> Result<Vec<CounterDrift>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT f.id, f.message_count,
                        (SELECT COUNT(*) FROM messages m
                         WHERE m.folder_id = f.id AND m.is_deleted = 0),
                        f.unread_count,
                        (SELECT COUNT(*) FROM messages m
                         WHERE m.folder_id = f.id AND m.is_deleted = 0 AND m.is_read = 0)
                 FROM folders f ORDER BY f.id",
            )?;
            let drift = stmt
                .query_map([], |row| {
                    Ok(CounterDrift {
                        folder_id: row.get(0)?,
                        stored_total: row.get(1)?,
                        actual_total: row.get(2)?,
                        stored_unread: row.get(3)?,
                        actual_unread: row.get(4)?,
                    })
                })?
                .filter(|d| match d {
                    Ok(d) => d.stored_total != d.actual_total || d.stored_unread != d.actual_unread,
                    Err(_) => true,
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(drift)
        })
    }

    /// Recompute every folder's counters from its messages. Returns the
    /// number of folders that were corrected.
    pub fn rebuild_counters(&self) -> Result<usize> {
        let drift = self.verify_counters()?;
        if drift.is_empty() {
            return Ok(0);
        }

        warn!(folders = drift.len(), "Folder counters drifted, rebuilding");
        self.store.write(|conn| {
            conn.execute(
                "UPDATE folders SET
                     message_count = (SELECT COUNT(*) FROM messages m
                                      WHERE m.folder_id = folders.id AND m.is_deleted = 0),
                     unread_count = (SELECT COUNT(*) FROM messages m
                                     WHERE m.folder_id = folders.id AND m.is_deleted = 0
                                       AND m.is_read = 0)",
                [],
            )?;
            Ok(())
        })?;
        Ok(drift.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbox() -> InboxStore {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let inbox = InboxStore::new(store, InboxConfig::default());
        inbox.ensure_owner("alice", "Alice").unwrap();
        inbox
    }

    fn counts(inbox: &InboxStore, folder_id: i64) -> (i64, i64) {
        let f = inbox.folder(folder_id).unwrap();
        (f.message_count, f.unread_count)
    }

    #[test]
    fn test_ensure_owner_creates_system_folders() {
        let inbox = inbox();
        let folders = inbox.ensure_owner("alice", "Alice").unwrap();

        assert_eq!(folders.len(), 5);
        assert!(folders.iter().all(|f| f.is_system && f.parent_id.is_none()));
        let types: Vec<_> = folders.iter().map(|f| f.folder_type).collect();
        assert_eq!(types, FolderType::SYSTEM.to_vec());
    }

    #[test]
    fn test_deliver_computes_snippet_and_counters() {
        let inbox = inbox();
        let id = inbox
            .deliver_message(DeliverRequest::new(
                "alice",
                "bob",
                "Greetings",
                "Hello   world\n\nSee you soon",
            ))
            .unwrap();

        let msg = inbox.get_message(&id).unwrap();
        assert_eq!(msg.snippet, "Hello world See you soon");
        assert!(!msg.has_attachments);
        assert_eq!(msg.size, ("Greetings".len() + "Hello   world\n\nSee you soon".len()) as i64);
        assert_eq!(msg.recipients, vec![Recipient::to("alice")]);

        assert_eq!(counts(&inbox, msg.folder_id), (1, 1));
    }

    #[test]
    fn test_counters_follow_flags_and_moves() {
        let inbox = inbox();
        let inbox_id = inbox.system_folder("alice", FolderType::Inbox).unwrap().id;
        let custom = inbox.create_folder("alice", "Projects", None).unwrap();

        let a = inbox
            .deliver_message(DeliverRequest::new("alice", "bob", "a", "a"))
            .unwrap();
        let b = inbox
            .deliver_message(DeliverRequest::new("alice", "bob", "b", "b"))
            .unwrap();
        assert_eq!(counts(&inbox, inbox_id), (2, 2));

        inbox.update_status(&a, StatusFlag::Read, true).unwrap();
        assert_eq!(counts(&inbox, inbox_id), (2, 1));

        inbox.move_message(&b, custom.id).unwrap();
        assert_eq!(counts(&inbox, inbox_id), (1, 0));
        assert_eq!(counts(&inbox, custom.id), (1, 1));

        inbox.update_status(&b, StatusFlag::Deleted, true).unwrap();
        assert_eq!(counts(&inbox, custom.id), (0, 0));
        assert!(inbox.get_message(&b).unwrap().deleted_at.is_some());

        inbox.update_status(&b, StatusFlag::Deleted, false).unwrap();
        assert_eq!(counts(&inbox, custom.id), (1, 1));
        assert!(inbox.get_message(&b).unwrap().deleted_at.is_none());

        inbox.purge(&a).unwrap();
        assert_eq!(counts(&inbox, inbox_id), (0, 0));
        assert!(inbox.verify_counters().unwrap().is_empty());
    }

    #[test]
    fn test_move_folder_rejects_cycles() {
        let inbox = inbox();
        let a = inbox.create_folder("alice", "a", None).unwrap();
        let b = inbox.create_folder("alice", "b", Some(a.id)).unwrap();
        let c = inbox.create_folder("alice", "c", Some(b.id)).unwrap();

        let err = inbox.move_folder(a.id, Some(c.id)).unwrap_err();
        assert!(matches!(err, ConclaveError::InvalidHierarchy(_)));
        let err = inbox.move_folder(a.id, Some(a.id)).unwrap_err();
        assert!(matches!(err, ConclaveError::InvalidHierarchy(_)));

        // Unchanged after the rejected moves
        assert_eq!(inbox.folder(a.id).unwrap().parent_id, None);

        let moved = inbox.move_folder(c.id, None).unwrap();
        assert_eq!(moved.parent_id, None);
    }

    #[test]
    fn test_folder_depth_is_bounded() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let inbox = InboxStore::new(
            store,
            InboxConfig {
                max_folder_depth: 3,
                ..Default::default()
            },
        );
        inbox.ensure_owner("alice", "Alice").unwrap();

        let a = inbox.create_folder("alice", "a", None).unwrap();
        let b = inbox.create_folder("alice", "b", Some(a.id)).unwrap();
        let c = inbox.create_folder("alice", "c", Some(b.id)).unwrap();
        let err = inbox.create_folder("alice", "d", Some(c.id)).unwrap_err();
        assert!(matches!(err, ConclaveError::InvalidHierarchy(_)));

        // Moving a two-level subtree under a depth-2 folder would reach 4
        let x = inbox.create_folder("alice", "x", None).unwrap();
        inbox.create_folder("alice", "y", Some(x.id)).unwrap();
        let err = inbox.move_folder(x.id, Some(b.id)).unwrap_err();
        assert!(matches!(err, ConclaveError::InvalidHierarchy(_)));
    }

    #[test]
    fn test_delete_folder_rules() {
        let inbox = inbox();
        let inbox_folder = inbox.system_folder("alice", FolderType::Inbox).unwrap();
        assert!(matches!(
            inbox.delete_folder(inbox_folder.id).unwrap_err(),
            ConclaveError::SystemFolder(_)
        ));

        let custom = inbox.create_folder("alice", "Later", None).unwrap();
        let id = inbox
            .deliver_message(DeliverRequest::new("alice", "bob", "s", "b").in_folder(custom.id))
            .unwrap();
        assert!(matches!(
            inbox.delete_folder(custom.id).unwrap_err(),
            ConclaveError::FolderNotEmpty(_)
        ));

        inbox.purge(&id).unwrap();
        inbox.delete_folder(custom.id).unwrap();
        assert!(inbox.folder(custom.id).is_err());
    }

    #[test]
    fn test_move_to_foreign_folder_rejected() {
        let inbox = inbox();
        let bob_inbox = inbox.ensure_owner("bob", "Bob").unwrap()[0].id;
        let id = inbox
            .deliver_message(DeliverRequest::new("alice", "bob", "s", "b"))
            .unwrap();

        let err = inbox.move_message(&id, bob_inbox).unwrap_err();
        assert!(matches!(err, ConclaveError::OwnershipMismatch { .. }));
    }

    #[test]
    fn test_search_is_case_insensitive_and_skips_deleted() {
        let inbox = inbox();
        let first = inbox
            .deliver_message(DeliverRequest::new("alice", "bob", "Build report", "all green"))
            .unwrap();
        let second = inbox
            .deliver_message(DeliverRequest::new("alice", "bob", "misc", "the BUILD broke"))
            .unwrap();
        inbox
            .deliver_message(DeliverRequest::new("alice", "bob", "lunch", "noon"))
            .unwrap();

        assert_eq!(inbox.search("alice", "build").unwrap(), vec![second.clone(), first.clone()]);

        inbox.update_status(&second, StatusFlag::Deleted, true).unwrap();
        assert_eq!(inbox.search("alice", "build").unwrap(), vec![first]);
        assert!(inbox.search("alice", "100%").unwrap().is_empty());
    }

    #[test]
    fn test_thread_and_archive() {
        let inbox = inbox();
        let a = inbox
            .deliver_message(DeliverRequest::new("alice", "bob", "q", "question").with_thread("t1"))
            .unwrap();
        let b = inbox
            .deliver_message(DeliverRequest::new("alice", "bob", "re: q", "answer").with_thread("t1"))
            .unwrap();
        inbox
            .deliver_message(DeliverRequest::new("alice", "bob", "other", "x").with_thread("t2"))
            .unwrap();

        let thread: Vec<_> = inbox
            .thread("alice", "t1")
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(thread, vec![a.clone(), b]);

        inbox.archive(&a).unwrap();
        let archive = inbox.system_folder("alice", FolderType::Archive).unwrap();
        assert_eq!(inbox.get_message(&a).unwrap().folder_id, archive.id);
        assert_eq!(archive.message_count, 1);
    }

    #[test]
    fn test_copy_to_sent_and_tags() {
        let inbox = inbox();
        let id = inbox
            .deliver_message(
                DeliverRequest::new("alice", "bob", "report", "done")
                    .with_tag("ci")
                    .with_attachment(Attachment {
                        filename: "log.txt".to_string(),
                        content_type: "text/plain".to_string(),
                        size: 42,
                    })
                    .copy_to_sent(),
            )
            .unwrap();

        let msg = inbox.get_message(&id).unwrap();
        assert!(msg.has_attachments);
        assert_eq!(msg.tags, vec!["ci"]);
        assert_eq!(inbox.messages_with_tag("alice", "ci").unwrap(), vec![id.clone()]);

        let sent = inbox.system_folder("bob", FolderType::Sent).unwrap();
        assert_eq!((sent.message_count, sent.unread_count), (1, 0));

        inbox.untag_message(&id, "ci").unwrap();
        assert!(inbox.messages_with_tag("alice", "ci").unwrap().is_empty());
    }

    #[test]
    fn test_purge_deleted_and_rebuild() {
        let inbox = inbox();
        let inbox_id = inbox.system_folder("alice", FolderType::Inbox).unwrap().id;
        let a = inbox
            .deliver_message(DeliverRequest::new("alice", "bob", "a", "a"))
            .unwrap();
        inbox
            .deliver_message(DeliverRequest::new("alice", "bob", "b", "b"))
            .unwrap();
        inbox.update_status(&a, StatusFlag::Deleted, true).unwrap();

        assert_eq!(inbox.purge_deleted("alice").unwrap(), 1);
        assert_eq!(counts(&inbox, inbox_id), (1, 1));

        inbox
            .store
            .write(|conn| {
                conn.execute("UPDATE folders SET message_count = 9 WHERE id = ?1", params![inbox_id])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(inbox.verify_counters().unwrap().len(), 1);
        assert_eq!(inbox.rebuild_counters().unwrap(), 1);
        assert_eq!(counts(&inbox, inbox_id), (1, 1));
    }
}
