// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pending-parent registry.
//!
//! When an operation that launches a sub-task starts, an entry is stored here.
//! The sub-task shows up later as a brand-new session carrying little more
//! than its own id, so the first new session to look claims the most recent
//! live entry, preferring one whose sub-task type matches. This is a recency
//! heuristic: two concurrently pending sub-tasks of the same type can be
//! claimed by either child.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;

use super::types::PendingParent;
use super::{open_connection, to_millis, DEFAULT_BUSY_TIMEOUT};

/// File name of the pending-parent database inside the state directory.
pub const PENDING_DB_FILE: &str = "pending.db";

/// Default validity window of a pending-parent entry.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(300);

/// Attempts at claiming before giving up when other processes keep winning.
const CLAIM_ATTEMPTS: usize = 3;

/// Durable registry of pending-parent entries.
pub struct PendingRegistry {
    conn: Connection,
    path: PathBuf,
}

impl PendingRegistry {
    /// Open or create the registry inside a state directory.
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        Self::open_at(&state_dir.join(PENDING_DB_FILE), DEFAULT_BUSY_TIMEOUT)
    }

    /// Open or create the registry at a specific database path.
    pub fn open_at(db_path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = open_connection(db_path, busy_timeout)?;
        let registry = Self {
            conn,
            path: db_path.to_path_buf(),
        };
        registry.init_schema()?;
        Ok(registry)
    }

    /// Open a private in-memory registry.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let registry = Self {
            conn: Connection::open_in_memory()?,
            path: PathBuf::from(":memory:"),
        };
        registry.init_schema()?;
        Ok(registry)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pending_parents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                subtask_type TEXT,
                record TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (session_id, operation_id)
            );

            CREATE INDEX IF NOT EXISTS idx_pending_created_at ON pending_parents(created_at);
            "#,
        )?;
        Ok(())
    }

    /// Store an entry, replacing any earlier one for the same launching operation.
    pub fn store_pending(&self, entry: &PendingParent) -> Result<(), StoreError> {
        let _timer = crate::timed!("pending.store");

        let json = serde_json::to_string(entry)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.conn.execute(
            "INSERT OR REPLACE INTO pending_parents
                (session_id, operation_id, subtask_type, record, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                entry.session_id,
                entry.operation_id,
                entry.subtask_type,
                json,
                to_millis(entry.created_at),
            ],
        )?;
        Ok(())
    }

    /// Find the best live entry without removing it.
    ///
    /// An entry whose sub-task type equals `subtask_type` wins over newer
    /// entries of other types; otherwise the newest entry is returned.
    /// Entries launched by `exclude_session` are skipped.
    pub fn find_pending(
        &self,
        subtask_type: Option<&str>,
        exclude_session: Option<&str>,
        max_age: Duration,
    ) -> Result<Option<PendingParent>, StoreError> {
        self.find_pending_at(subtask_type, exclude_session, max_age, Utc::now())
            .map(|found| found.map(|(_, entry)| entry))
    }

    /// Find and remove the best live entry.
    ///
    /// Only one caller can claim a given entry. When another process claims
    /// the chosen entry first, the search is repeated.
    pub fn claim_pending(
        &self,
        subtask_type: Option<&str>,
        exclude_session: Option<&str>,
        max_age: Duration,
    ) -> Result<Option<PendingParent>, StoreError> {
        self.claim_pending_at(subtask_type, exclude_session, max_age, Utc::now())
    }

    /// [`claim_pending`](Self::claim_pending) evaluated at a fixed instant.
    pub fn claim_pending_at(
        &self,
        subtask_type: Option<&str>,
        exclude_session: Option<&str>,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingParent>, StoreError> {
        let _timer = crate::timed!("pending.claim");

        for _ in 0..CLAIM_ATTEMPTS {
            let Some((row_id, entry)) =
                self.find_pending_at(subtask_type, exclude_session, max_age, now)?
            else {
                return Ok(None);
            };

            let removed = self
                .conn
                .execute("DELETE FROM pending_parents WHERE id = ?", params![row_id])?;
            if removed == 1 {
                return Ok(Some(entry));
            }
            tracing::debug!(row_id, "Pending entry claimed elsewhere, retrying");
        }

        Ok(None)
    }

    /// Remove the entry for one launching operation. Idempotent.
    pub fn remove_pending(&self, session_id: &str, operation_id: &str) -> Result<bool, StoreError> {
        let rows = self.conn.execute(
            "DELETE FROM pending_parents WHERE session_id = ? AND operation_id = ?",
            params![session_id, operation_id],
        )?;
        Ok(rows > 0)
    }

    /// Remove every entry launched by a session.
    pub fn remove_pending_for_session(&self, session_id: &str) -> Result<usize, StoreError> {
        let rows = self.conn.execute(
            "DELETE FROM pending_parents WHERE session_id = ?",
            params![session_id],
        )?;
        Ok(rows)
    }

    /// Delete entries older than `max_age`.
    pub fn sweep_expired(&self, max_age: Duration) -> Result<usize, StoreError> {
        self.sweep_expired_at(max_age, Utc::now())
    }

    /// Delete entries created more than `max_age` before `now`.
    pub fn sweep_expired_at(&self, max_age: Duration, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let _timer = crate::timed!("pending.sweep_expired");

        let rows = self.conn.execute(
            "DELETE FROM pending_parents WHERE created_at < ?",
            params![cutoff(max_age, now)],
        )?;
        Ok(rows)
    }

    /// Count stored entries, live or not.
    pub fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_parents", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Whether the registry holds no entries.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn find_pending_at(
        &self,
        subtask_type: Option<&str>,
        exclude_session: Option<&str>,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<(i64, PendingParent)>, StoreError> {
        let cutoff = cutoff(max_age, now);
        let exclude = exclude_session.unwrap_or("");

        if let Some(wanted) = subtask_type {
            let exact = self.select_one(
                "SELECT id, record FROM pending_parents
                 WHERE created_at >= ? AND session_id != ? AND subtask_type = ?
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![cutoff, exclude, wanted],
            )?;
            if exact.is_some() {
                return Ok(exact);
            }
        }

        self.select_one(
            "SELECT id, record FROM pending_parents
             WHERE created_at >= ? AND session_id != ?
             ORDER BY created_at DESC, id DESC LIMIT 1",
            params![cutoff, exclude],
        )
    }

    fn select_one(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<(i64, PendingParent)>, StoreError> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(sql, params, |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        let Some((row_id, json)) = row else {
            return Ok(None);
        };

        match serde_json::from_str(&json) {
            Ok(entry) => Ok(Some((row_id, entry))),
            Err(e) => {
                // Unreadable rows would otherwise shadow every older entry
                tracing::warn!(row_id, error = %e, "Dropping unreadable pending entry");
                self.conn
                    .execute("DELETE FROM pending_parents WHERE id = ?", params![row_id])?;
                Ok(None)
            }
        }
    }
}

fn cutoff(max_age: Duration, now: DateTime<Utc>) -> i64 {
    to_millis(now) - i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{encode_token, SpanId, TraceId};
    use tempfile::TempDir;

    fn entry(session_id: &str, operation_id: &str, subtask_type: Option<&str>, at: DateTime<Utc>) -> PendingParent {
        let trace_id = TraceId::new();
        let span_id = SpanId::new();
        PendingParent {
            token: encode_token(trace_id, span_id),
            trace_id,
            span_id,
            session_id: session_id.to_string(),
            operation_id: operation_id.to_string(),
            subtask_type: subtask_type.map(String::from),
            created_at: at,
        }
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_claim_newest() {
        let registry = PendingRegistry::open_in_memory().unwrap();
        let now = Utc::now();
        registry.store_pending(&entry("p", "op-old", None, now - secs(20))).unwrap();
        registry.store_pending(&entry("p", "op-new", None, now - secs(5))).unwrap();

        let claimed = registry
            .claim_pending_at(None, None, DEFAULT_PENDING_TTL, now)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.operation_id, "op-new");
        assert_eq!(registry.len().unwrap(), 1);
    }

    #[test]
    fn test_claim_prefers_matching_type() {
        let registry = PendingRegistry::open_in_memory().unwrap();
        let now = Utc::now();
        registry
            .store_pending(&entry("p", "op-review", Some("reviewer"), now - secs(30)))
            .unwrap();
        registry
            .store_pending(&entry("p", "op-explore", Some("explorer"), now - secs(1)))
            .unwrap();

        let claimed = registry
            .claim_pending_at(Some("reviewer"), None, DEFAULT_PENDING_TTL, now)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.operation_id, "op-review");

        // No match for the type falls back to the newest entry
        let claimed = registry
            .claim_pending_at(Some("planner"), None, DEFAULT_PENDING_TTL, now)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.operation_id, "op-explore");
        assert!(registry.is_empty().unwrap());
    }

    #[test]
    fn test_claim_is_single_use() {
        let temp = TempDir::new().unwrap();
        let first = PendingRegistry::open(temp.path()).unwrap();
        let second = PendingRegistry::open(temp.path()).unwrap();
        first.store_pending(&entry("p", "op-1", None, Utc::now())).unwrap();

        assert!(first.claim_pending(None, None, DEFAULT_PENDING_TTL).unwrap().is_some());
        assert!(second.claim_pending(None, None, DEFAULT_PENDING_TTL).unwrap().is_none());
    }

    #[test]
    fn test_expired_entries_are_not_claimed() {
        let registry = PendingRegistry::open_in_memory().unwrap();
        let now = Utc::now();
        registry.store_pending(&entry("p", "op-1", None, now - secs(301))).unwrap();

        assert!(registry
            .claim_pending_at(None, None, DEFAULT_PENDING_TTL, now)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_own_session_is_excluded() {
        let registry = PendingRegistry::open_in_memory().unwrap();
        registry.store_pending(&entry("p", "op-1", None, Utc::now())).unwrap();

        assert!(registry
            .find_pending(None, Some("p"), DEFAULT_PENDING_TTL)
            .unwrap()
            .is_none());
        assert!(registry
            .find_pending(None, Some("child"), DEFAULT_PENDING_TTL)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_remove_pending() {
        let registry = PendingRegistry::open_in_memory().unwrap();
        registry.store_pending(&entry("p", "op-1", None, Utc::now())).unwrap();
        registry.store_pending(&entry("p", "op-2", None, Utc::now())).unwrap();
        registry.store_pending(&entry("q", "op-1", None, Utc::now())).unwrap();

        assert!(registry.remove_pending("p", "op-1").unwrap());
        assert!(!registry.remove_pending("p", "op-1").unwrap());
        assert_eq!(registry.remove_pending_for_session("p").unwrap(), 1);
        assert_eq!(registry.len().unwrap(), 1);
    }

    #[test]
    fn test_store_replaces_same_operation() {
        let registry = PendingRegistry::open_in_memory().unwrap();
        registry.store_pending(&entry("p", "op-1", None, Utc::now())).unwrap();
        registry
            .store_pending(&entry("p", "op-1", Some("reviewer"), Utc::now()))
            .unwrap();
        assert_eq!(registry.len().unwrap(), 1);
    }

    #[test]
    fn test_sweep_boundary() {
        let registry = PendingRegistry::open_in_memory().unwrap();
        let now = Utc::now();
        let ttl = Duration::from_secs(300);
        registry.store_pending(&entry("p", "kept", None, now - secs(299))).unwrap();
        registry.store_pending(&entry("p", "gone", None, now - secs(301))).unwrap();

        assert_eq!(registry.sweep_expired_at(ttl, now).unwrap(), 1);
        assert_eq!(registry.sweep_expired_at(ttl, now).unwrap(), 0);
        let left = registry.find_pending(None, None, ttl).unwrap().unwrap();
        assert_eq!(left.operation_id, "kept");
    }
}
