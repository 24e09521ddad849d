// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable cross-process state.
//!
//! Every hook invocation is a fresh process, so anything that has to outlive
//! one event lives here:
//!
//! - [`SpanStore`] holds one record per session (trace id, root span, running
//!   metrics) plus the in-flight operations of that session.
//! - [`PendingRegistry`] holds short-lived hints that a sub-task session is
//!   about to start under some in-flight operation.
//!
//! Both are SQLite databases in WAL mode inside the state directory, so any
//! number of concurrent processes can read and write them.

mod pending;
mod sessions;
mod types;

pub use pending::{PendingRegistry, DEFAULT_PENDING_TTL, PENDING_DB_FILE};
pub use sessions::{SpanStore, DEFAULT_SESSION_TTL, SCHEMA_VERSION, SESSIONS_DB_FILE};
pub use types::{InitOutcome, OpenSpanRecord, ParentLink, PendingParent, SessionId, SessionRecord};

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

use crate::error::StoreError;

/// Default time a writer waits on a locked database.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Name of the state directory under the user's home.
pub const STATE_DIR_NAME: &str = ".hooktrace";

/// Get the default state directory (`~/.hooktrace/state`).
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STATE_DIR_NAME)
        .join("state")
}

/// Open a SQLite connection configured for multi-process access.
pub(crate) fn open_connection(db_path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
            path: parent.display().to_string(),
            message: e.to_string(),
        })?;
    }

    let conn = Connection::open(db_path).map_err(|e| StoreError::Open {
        path: db_path.display().to_string(),
        message: e.to_string(),
    })?;

    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

    Ok(conn)
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
