//! Persistent store
//!
//! The single source of truth shared by every process: a SQLite database in
//! WAL mode. Each process opens its own [`Store`]; writers serialize through
//! `BEGIN IMMEDIATE` transactions so every read-modify-write of a counter or
//! aggregate is atomic across processes.

pub mod schema;

use crate::config::StoreConfig;
use crate::{ConclaveError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Handle to the shared database
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create the database described by `config`
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %config.path.display(), "Opening store");

        let conn = Connection::open(&config.path)?;
        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        conn.busy_timeout(config.busy_timeout())?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        schema::init(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(config.path.clone()),
        })
    }

    /// Open a private in-memory database (tests and dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::init(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file, if not in-memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ConclaveError::Storage("store connection mutex poisoned".to_string()))
    }

    /// Run read-only work against the connection
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&*conn)
    }

    /// Run `f` inside an immediate transaction.
    ///
    /// Commits when `f` returns `Ok`; any error rolls back every statement
    /// `f` executed, so callers never observe partial mutations.
    pub fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        let tx = Transaction::new_unchecked(&*conn, TransactionBehavior::Immediate)?;
        let value = f(&*tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Current time in the fixed-width format stored in every TEXT timestamp
/// column. Fixed width keeps lexicographic comparison in SQL correct.
pub fn now_ts() -> String {
    fmt_ts(Utc::now())
}

pub fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_ts(&v))
}

/// Encode a capability set as a sorted, de-duplicated JSON array
pub fn encode_capabilities(capabilities: &[String]) -> Result<String> {
    let mut caps: Vec<&str> = capabilities
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect();
    caps.sort_unstable();
    caps.dedup();
    Ok(serde_json::to_string(&caps)?)
}

pub fn decode_capabilities(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}
