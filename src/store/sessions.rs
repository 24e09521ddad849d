// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite-based durable span-state store.
//!
//! One row per session in `sessions`, one row per in-flight operation in
//! `open_spans`. Rows are keyed by session id, so writers for different
//! sessions never touch the same rows; writers for the same session are
//! last-write-wins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::identity::{SpanId, TraceId};
use crate::metrics::SessionMetrics;

use super::types::{InitOutcome, OpenSpanRecord, ParentLink, SessionRecord};
use super::{from_millis, open_connection, to_millis, DEFAULT_BUSY_TIMEOUT};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// File name of the session database inside the state directory.
pub const SESSIONS_DB_FILE: &str = "sessions.db";

/// Default age after which session records are swept.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const SESSION_COLUMNS: &str = "session_id, trace_id, root_span_id, token, parent, cwd, metrics, created_at, updated_at";

/// Durable span-state store.
pub struct SpanStore {
    conn: Connection,
    path: PathBuf,
}

impl SpanStore {
    /// Open or create the store inside a state directory.
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        Self::open_at(&state_dir.join(SESSIONS_DB_FILE), DEFAULT_BUSY_TIMEOUT)
    }

    /// Open or create the store at a specific database path.
    pub fn open_at(db_path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = open_connection(db_path, busy_timeout)?;
        let mut store = Self {
            conn,
            path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init_schema(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                trace_id TEXT NOT NULL,
                root_span_id TEXT NOT NULL,
                token TEXT,
                parent TEXT,
                cwd TEXT,
                metrics TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS open_spans (
                session_id TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                record TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, operation_id)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions(updated_at);
            CREATE INDEX IF NOT EXISTS idx_open_spans_created_at ON open_spans(created_at);
            "#,
        )?;

        let current_version: Option<u32> = self
            .conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        if current_version.is_none() {
            self.conn.execute(
                "INSERT INTO schema_version (version) VALUES (?)",
                params![SCHEMA_VERSION],
            )?;
        }

        Ok(())
    }

    /// Load a session record, including its in-flight operations.
    pub fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let _timer = crate::timed!("store.load");

        let row = self
            .conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?"),
                params![session_id],
                RawSession::from_row,
            )
            .optional()?;

        let Some(raw) = row else {
            return Ok(None);
        };

        let mut record = raw.into_record()?;
        record.open_spans = self.open_spans_for(session_id)?;
        Ok(Some(record))
    }

    /// Write a session record (insert or overwrite).
    ///
    /// Open operations are not written here; they are managed through
    /// [`register_open_span`](Self::register_open_span) and
    /// [`pop_open_span`](Self::pop_open_span).
    pub fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let _timer = crate::timed!("store.save");

        let raw = RawSession::from_record(record)?;
        self.conn.execute(
            &format!(
                "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(session_id) DO UPDATE SET
                    trace_id = excluded.trace_id,
                    root_span_id = excluded.root_span_id,
                    token = excluded.token,
                    parent = excluded.parent,
                    cwd = excluded.cwd,
                    metrics = excluded.metrics,
                    updated_at = excluded.updated_at"
            ),
            params![
                raw.session_id,
                raw.trace_id,
                raw.root_span_id,
                raw.token,
                raw.parent,
                raw.cwd,
                raw.metrics,
                raw.created_at,
                to_millis(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Create a session record only if none exists for its id.
    ///
    /// An existing record is returned untouched, so the first trace id chosen
    /// for a session id survives every later initialization attempt.
    pub fn init_session(&self, record: SessionRecord) -> Result<InitOutcome, StoreError> {
        let _timer = crate::timed!("store.init_session");

        let raw = RawSession::from_record(&record)?;
        let inserted = self.conn.execute(
            &format!(
                "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(session_id) DO NOTHING"
            ),
            params![
                raw.session_id,
                raw.trace_id,
                raw.root_span_id,
                raw.token,
                raw.parent,
                raw.cwd,
                raw.metrics,
                raw.created_at,
                raw.updated_at,
            ],
        )?;

        if inserted == 1 {
            return Ok(InitOutcome::Created(record));
        }

        match self.load(&record.session_id)? {
            Some(existing) => Ok(InitOutcome::Existing(existing)),
            // Deleted between the insert attempt and the read
            None => {
                self.save(&record)?;
                Ok(InitOutcome::Created(record))
            }
        }
    }

    /// Delete a session record and its in-flight operations.
    ///
    /// Idempotent: returns `false` when nothing was stored.
    pub fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        let _timer = crate::timed!("store.delete");

        self.conn
            .execute("DELETE FROM open_spans WHERE session_id = ?", params![session_id])?;
        let rows = self
            .conn
            .execute("DELETE FROM sessions WHERE session_id = ?", params![session_id])?;
        Ok(rows > 0)
    }

    /// Persist one in-flight operation for a session.
    pub fn register_open_span(
        &self,
        session_id: &str,
        open: &OpenSpanRecord,
    ) -> Result<(), StoreError> {
        let _timer = crate::timed!("store.register_open_span");

        let json = serde_json::to_string(open)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = to_millis(Utc::now());

        self.conn.execute(
            "INSERT OR REPLACE INTO open_spans (session_id, operation_id, record, created_at)
             VALUES (?, ?, ?, ?)",
            params![session_id, open.operation_id, json, now],
        )?;
        self.touch(session_id, now)?;
        Ok(())
    }

    /// Remove and return one in-flight operation.
    ///
    /// The delete and read are a single statement, so only one caller can ever
    /// receive a given record; every later call returns `None`.
    pub fn pop_open_span(
        &self,
        session_id: &str,
        operation_id: &str,
    ) -> Result<Option<OpenSpanRecord>, StoreError> {
        let _timer = crate::timed!("store.pop_open_span");

        let json: Option<String> = self
            .conn
            .query_row(
                "DELETE FROM open_spans WHERE session_id = ? AND operation_id = ? RETURNING record",
                params![session_id, operation_id],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|json| decode_open_span(session_id, operation_id, &json))
            .transpose()
    }

    /// Read one in-flight operation without removing it.
    pub fn get_open_span(
        &self,
        session_id: &str,
        operation_id: &str,
    ) -> Result<Option<OpenSpanRecord>, StoreError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM open_spans WHERE session_id = ? AND operation_id = ?",
                params![session_id, operation_id],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|json| decode_open_span(session_id, operation_id, &json))
            .transpose()
    }

    /// Remove and return every in-flight operation of a session.
    ///
    /// Records that fail to decode are dropped with a warning.
    pub fn drain_open_spans(&self, session_id: &str) -> Result<Vec<OpenSpanRecord>, StoreError> {
        let _timer = crate::timed!("store.drain_open_spans");

        let mut stmt = self.conn.prepare(
            "DELETE FROM open_spans WHERE session_id = ? RETURNING operation_id, record",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut drained = Vec::with_capacity(rows.len());
        for (operation_id, json) in rows {
            match decode_open_span(session_id, &operation_id, &json) {
                Ok(open) => drained.push(open),
                Err(e) => tracing::warn!(session_id, operation_id, error = %e, "Dropping unreadable open span"),
            }
        }
        drained.sort_by_key(|open| open.start_time);
        Ok(drained)
    }

    /// Apply an update to a session's running metrics.
    ///
    /// Returns the updated metrics, or `None` if the session has no record.
    pub fn update_metrics<F>(
        &self,
        session_id: &str,
        update: F,
    ) -> Result<Option<SessionMetrics>, StoreError>
    where
        F: FnOnce(&mut SessionMetrics),
    {
        let _timer = crate::timed!("store.update_metrics");

        let tx = self.conn.unchecked_transaction()?;

        let json: Option<String> = tx
            .query_row(
                "SELECT metrics FROM sessions WHERE session_id = ?",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(json) = json else {
            return Ok(None);
        };

        let mut metrics: SessionMetrics = serde_json::from_str(&json)
            .map_err(|e| StoreError::corrupted(session_id, format!("metrics: {e}")))?;
        update(&mut metrics);

        let json = serde_json::to_string(&metrics)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        tx.execute(
            "UPDATE sessions SET metrics = ?, updated_at = ? WHERE session_id = ?",
            params![json, to_millis(Utc::now()), session_id],
        )?;
        tx.commit()?;

        Ok(Some(metrics))
    }

    /// Delete session records not written for longer than `max_age`.
    pub fn sweep_expired(&self, max_age: Duration) -> Result<usize, StoreError> {
        self.sweep_expired_at(max_age, Utc::now())
    }

    /// Delete session records whose last write is more than `max_age` before `now`.
    ///
    /// A record exactly `max_age` old is kept. In-flight operations of swept
    /// sessions, and orphaned ones older than `max_age`, are removed too.
    pub fn sweep_expired_at(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let _timer = crate::timed!("store.sweep_expired");

        let cutoff = to_millis(now) - duration_millis(max_age);

        let swept = self
            .conn
            .execute("DELETE FROM sessions WHERE updated_at < ?", params![cutoff])?;
        self.conn.execute(
            "DELETE FROM open_spans
             WHERE created_at < ?
               AND session_id NOT IN (SELECT session_id FROM sessions)",
            params![cutoff],
        )?;

        Ok(swept)
    }

    /// List session ids currently stored, most recently written first.
    pub fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT session_id FROM sessions ORDER BY updated_at DESC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_spans_for(
        &self,
        session_id: &str,
    ) -> Result<BTreeMap<String, OpenSpanRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT operation_id, record FROM open_spans WHERE session_id = ?")?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut open_spans = BTreeMap::new();
        for (operation_id, json) in rows {
            match decode_open_span(session_id, &operation_id, &json) {
                Ok(open) => {
                    open_spans.insert(operation_id, open);
                }
                Err(e) => {
                    tracing::warn!(session_id, operation_id, error = %e, "Dropping unreadable open span");
                    self.conn.execute(
                        "DELETE FROM open_spans WHERE session_id = ? AND operation_id = ?",
                        params![session_id, operation_id],
                    )?;
                }
            }
        }
        Ok(open_spans)
    }

    fn touch(&self, session_id: &str, now: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE sessions SET updated_at = ? WHERE session_id = ?",
            params![now, session_id],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_updated_at(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.touch(session_id, to_millis(at))
    }

    #[cfg(test)]
    pub(crate) fn corrupt_open_span(
        &self,
        session_id: &str,
        operation_id: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE open_spans SET record = 'garbage' WHERE session_id = ? AND operation_id = ?",
            params![session_id, operation_id],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn corrupt_metrics(&self, session_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE sessions SET metrics = 'not json' WHERE session_id = ?",
            params![session_id],
        )?;
        Ok(())
    }
}

/// A session row before its JSON columns are decoded.
struct RawSession {
    session_id: String,
    trace_id: String,
    root_span_id: String,
    token: Option<String>,
    parent: Option<String>,
    cwd: Option<String>,
    metrics: String,
    created_at: i64,
    updated_at: i64,
}

impl RawSession {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            trace_id: row.get(1)?,
            root_span_id: row.get(2)?,
            token: row.get(3)?,
            parent: row.get(4)?,
            cwd: row.get(5)?,
            metrics: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn from_record(record: &SessionRecord) -> Result<Self, StoreError> {
        let parent = record
            .parent
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let metrics = serde_json::to_string(&record.metrics)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(Self {
            session_id: record.session_id.clone(),
            trace_id: record.trace_id.to_hex(),
            root_span_id: record.root_span_id.to_hex(),
            token: record.token.clone(),
            parent,
            cwd: record.cwd.clone(),
            metrics,
            created_at: to_millis(record.created_at),
            updated_at: to_millis(record.updated_at),
        })
    }

    fn into_record(self) -> Result<SessionRecord, StoreError> {
        let key = self.session_id.clone();
        let trace_id = TraceId::from_hex(&self.trace_id)
            .map_err(|e| StoreError::corrupted(&key, e.to_string()))?;
        let root_span_id = SpanId::from_hex(&self.root_span_id)
            .map_err(|e| StoreError::corrupted(&key, e.to_string()))?;
        let parent: Option<ParentLink> = self
            .parent
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::corrupted(&key, format!("parent: {e}")))?;
        let metrics: SessionMetrics = serde_json::from_str(&self.metrics)
            .map_err(|e| StoreError::corrupted(&key, format!("metrics: {e}")))?;

        Ok(SessionRecord {
            session_id: self.session_id,
            trace_id,
            root_span_id,
            token: self.token,
            parent,
            cwd: self.cwd,
            metrics,
            open_spans: BTreeMap::new(),
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

fn decode_open_span(
    session_id: &str,
    operation_id: &str,
    json: &str,
) -> Result<OpenSpanRecord, StoreError> {
    serde_json::from_str(json)
        .map_err(|e| StoreError::corrupted(format!("{session_id}/{operation_id}"), e.to_string()))
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
