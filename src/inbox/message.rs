//! Inbox message types

use crate::priority::Priority;
use crate::store::{parse_ts, parse_ts_opt};
use crate::ConclaveError;
use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Body encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    #[default]
    Plain,
    Rich,
}

impl BodyFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Rich => "rich",
        }
    }
}

impl FromStr for BodyFormat {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "rich" => Ok(Self::Rich),
            other => Err(ConclaveError::Other(format!(
                "unknown body format '{}'",
                other
            ))),
        }
    }
}

/// Addressing role of a recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::To => "to",
            Self::Cc => "cc",
            Self::Bcc => "bcc",
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "cc" => Self::Cc,
            "bcc" => Self::Bcc,
            _ => Self::To,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    pub kind: RecipientKind,
}

impl Recipient {
    pub fn to(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            kind: RecipientKind::To,
        }
    }

    pub fn cc(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            kind: RecipientKind::Cc,
        }
    }
}

/// Attachment metadata; content lives outside the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: i64,
}

/// Flags that can be toggled with `update_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFlag {
    Read,
    Starred,
    Important,
    /// Soft delete; clearing it restores the message
    Deleted,
}

impl StatusFlag {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::Read => "is_read",
            Self::Starred => "is_starred",
            Self::Important => "is_important",
            Self::Deleted => "is_deleted",
        }
    }
}

impl fmt::Display for StatusFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Starred => "starred",
            Self::Important => "important",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

impl FromStr for StatusFlag {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "starred" | "star" => Ok(Self::Starred),
            "important" => Ok(Self::Important),
            "deleted" | "delete" => Ok(Self::Deleted),
            other => Err(ConclaveError::Other(format!(
                "Invalid flag '{}'. Must be one of: read, starred, important, deleted",
                other
            ))),
        }
    }
}

/// Input to `deliver_message`
#[derive(Debug, Clone)]
pub struct DeliverRequest {
    /// Mailbox the message is delivered into
    pub owner: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub body_format: BodyFormat,
    /// Computed from the body when absent
    pub snippet: Option<String>,
    pub priority: Priority,
    pub thread_id: Option<String>,
    pub recipients: Vec<Recipient>,
    pub attachments: Vec<Attachment>,
    pub headers: Vec<(String, String)>,
    pub tags: Vec<String>,
    /// Target folder; the owner's inbox when absent
    pub folder_id: Option<i64>,
    /// Also file a read copy in the sender's Sent folder
    pub copy_to_sent: bool,
}

impl DeliverRequest {
    pub fn new(
        owner: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let owner = owner.into();
        Self {
            recipients: vec![Recipient::to(owner.clone())],
            owner,
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            body_format: BodyFormat::Plain,
            snippet: None,
            priority: Priority::Normal,
            thread_id: None,
            attachments: Vec::new(),
            headers: Vec::new(),
            tags: Vec::new(),
            folder_id: None,
            copy_to_sent: false,
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    pub fn with_format(mut self, format: BodyFormat) -> Self {
        self.body_format = format;
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_recipient(mut self, recipient: Recipient) -> Self {
        self.recipients.push(recipient);
        self
    }

    pub fn in_folder(mut self, folder_id: i64) -> Self {
        self.folder_id = Some(folder_id);
        self
    }

    pub fn copy_to_sent(mut self) -> Self {
        self.copy_to_sent = true;
        self
    }
}

/// A stored message with its child records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: Option<String>,
    pub sender: String,
    pub owner: String,
    pub folder_id: i64,
    pub subject: String,
    pub body: String,
    pub body_format: BodyFormat,
    pub snippet: String,
    /// Byte length of subject plus body
    pub size: i64,
    pub priority: Priority,
    pub has_attachments: bool,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_important: bool,
    pub is_draft: bool,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub recipients: Vec<Recipient>,
    pub attachments: Vec<Attachment>,
    pub tags: Vec<String>,
    pub headers: Vec<(String, String)>,
}

pub(crate) const MESSAGE_COLUMNS: &str = "id, thread_id, sender, owner, folder_id, subject, body, \
     body_format, snippet, size, priority, has_attachments, is_read, is_starred, is_important, \
     is_draft, is_deleted, deleted_at, sent_at, received_at";

/// Map the scalar columns; child records are filled in by the caller
pub(crate) fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let body_format: String = row.get(7)?;
    Ok(Message {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        sender: row.get(2)?,
        owner: row.get(3)?,
        folder_id: row.get(4)?,
        subject: row.get(5)?,
        body: row.get(6)?,
        body_format: body_format.parse().unwrap_or_default(),
        snippet: row.get(8)?,
        size: row.get(9)?,
        priority: Priority::from_rank(row.get(10)?),
        has_attachments: row.get(11)?,
        is_read: row.get(12)?,
        is_starred: row.get(13)?,
        is_important: row.get(14)?,
        is_draft: row.get(15)?,
        is_deleted: row.get(16)?,
        deleted_at: parse_ts_opt(row.get(17)?),
        sent_at: parse_ts(&row.get::<_, String>(18)?),
        received_at: parse_ts(&row.get::<_, String>(19)?),
        recipients: Vec::new(),
        attachments: Vec::new(),
        tags: Vec::new(),
        headers: Vec::new(),
    })
}

/// Collapse whitespace runs and truncate to `max_chars`, appending "..."
/// when anything was cut.
pub fn make_snippet(body: &str, max_chars: usize) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut snippet: String = collapsed.chars().take(max_chars).collect();
    snippet.truncate(snippet.trim_end().len());
    snippet.push_str("...");
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_collapses_whitespace() {
        assert_eq!(
            make_snippet("Hello   world\n\nSee you soon", 100),
            "Hello world See you soon"
        );
    }

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        assert_eq!(make_snippet("héllo wörld", 5), "héllo...");
        assert_eq!(make_snippet("abc def", 4), "abc...");
        assert_eq!(make_snippet("", 10), "");
    }

    #[test]
    fn test_request_defaults_to_owner_recipient() {
        let req = DeliverRequest::new("alice", "bob", "hi", "there");
        assert_eq!(req.recipients, vec![Recipient::to("alice")]);
        assert_eq!(req.priority, Priority::Normal);
        assert!(!req.copy_to_sent);
    }

    #[test]
    fn test_status_flag_parse() {
        assert_eq!("Read".parse::<StatusFlag>().unwrap(), StatusFlag::Read);
        assert_eq!("delete".parse::<StatusFlag>().unwrap(), StatusFlag::Deleted);
        assert!("pinned".parse::<StatusFlag>().is_err());
    }
}
