//! Folder types and hierarchy checks

use crate::store::parse_ts;
use crate::{ConclaveError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of folder. Every kind except `Custom` is a system folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderType {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Archive,
    Custom,
}

impl FolderType {
    /// Folders created for every owner on registration
    pub const SYSTEM: [FolderType; 5] = [
        FolderType::Inbox,
        FolderType::Sent,
        FolderType::Drafts,
        FolderType::Trash,
        FolderType::Archive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Sent => "sent",
            Self::Drafts => "drafts",
            Self::Trash => "trash",
            Self::Archive => "archive",
            Self::Custom => "custom",
        }
    }

    /// Display name used when the system folder is created
    pub fn default_name(&self) -> &'static str {
        match self {
            Self::Inbox => "Inbox",
            Self::Sent => "Sent",
            Self::Drafts => "Drafts",
            Self::Trash => "Trash",
            Self::Archive => "Archive",
            Self::Custom => "Folder",
        }
    }

    pub fn is_system(&self) -> bool {
        !matches!(self, Self::Custom)
    }
}

impl fmt::Display for FolderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FolderType {
    type Err = ConclaveError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "inbox" => Ok(Self::Inbox),
            "sent" => Ok(Self::Sent),
            "drafts" => Ok(Self::Drafts),
            "trash" => Ok(Self::Trash),
            "archive" => Ok(Self::Archive),
            "custom" => Ok(Self::Custom),
            other => Err(ConclaveError::Storage(format!(
                "unknown folder type '{}'",
                other
            ))),
        }
    }
}

/// A node in an owner's folder tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: i64,
    pub owner: String,
    pub parent_id: Option<i64>,
    pub name: String,
    pub folder_type: FolderType,
    pub is_system: bool,

    /// Live (non-deleted) messages in this folder
    pub message_count: i64,

    /// Live unread messages in this folder
    pub unread_count: i64,

    pub created_at: DateTime<Utc>,
}

pub(crate) const FOLDER_COLUMNS: &str =
    "id, owner, parent_id, name, folder_type, is_system, message_count, unread_count, created_at";

pub(crate) fn row_to_folder(row: &Row) -> rusqlite::Result<Folder> {
    let folder_type: String = row.get(4)?;
    Ok(Folder {
        id: row.get(0)?,
        owner: row.get(1)?,
        parent_id: row.get(2)?,
        name: row.get(3)?,
        folder_type: folder_type.parse().unwrap_or(FolderType::Custom),
        is_system: row.get(5)?,
        message_count: row.get(6)?,
        unread_count: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?),
    })
}

pub(crate) fn load_folder_in(conn: &Connection, folder_id: i64) -> Result<Folder> {
    conn.query_row(
        &format!("SELECT {} FROM folders WHERE id = ?1", FOLDER_COLUMNS),
        params![folder_id],
        row_to_folder,
    )
    .optional()?
    .ok_or_else(|| ConclaveError::not_found("folder", folder_id))
}

pub(crate) fn system_folder_in(
    conn: &Connection,
    owner: &str,
    folder_type: FolderType,
) -> Result<Folder> {
    conn.query_row(
        &format!(
            "SELECT {} FROM folders WHERE owner = ?1 AND folder_type = ?2 AND is_system = 1",
            FOLDER_COLUMNS
        ),
        params![owner, folder_type.as_str()],
        row_to_folder,
    )
    .optional()?
    .ok_or_else(|| ConclaveError::not_found("folder", format!("{}/{}", owner, folder_type)))
}

/// Depth of a folder, counting itself (a root folder has depth 1).
///
/// Fails with `InvalidHierarchy` if `forbidden` appears in the chain or the
/// chain is longer than `max_depth`.
pub(crate) fn chain_depth_in(
    conn: &Connection,
    start: i64,
    forbidden: Option<i64>,
    max_depth: usize,
) -> Result<usize> {
    let mut depth = 0;
    let mut current = Some(start);

    while let Some(id) = current {
        if Some(id) == forbidden {
            return Err(ConclaveError::InvalidHierarchy(format!(
                "folder {} would become its own ancestor",
                id
            )));
        }
        depth += 1;
        if depth > max_depth {
            return Err(ConclaveError::InvalidHierarchy(format!(
                "folder chain from {} exceeds maximum depth {}",
                start, max_depth
            )));
        }
        current = conn
            .query_row(
                "SELECT parent_id FROM folders WHERE id = ?1",
                params![id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .ok_or_else(|| ConclaveError::not_found("folder", id))?;
    }

    Ok(depth)
}

/// Height of the subtree rooted at `folder_id` (a leaf has height 1)
pub(crate) fn subtree_height_in(conn: &Connection, folder_id: i64, max_depth: usize) -> Result<usize> {
    let height: i64 = conn.query_row(
        "WITH RECURSIVE sub(id, level) AS (
             SELECT id, 1 FROM folders WHERE id = ?1
             UNION ALL
             SELECT f.id, sub.level + 1 FROM folders f JOIN sub ON f.parent_id = sub.id
             WHERE sub.level <= ?2
         )
         SELECT COALESCE(MAX(level), 0) FROM sub",
        params![folder_id, max_depth as i64],
        |row| row.get(0),
    )?;
    Ok(height as usize)
}
