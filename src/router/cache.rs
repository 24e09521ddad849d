// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process fast path for sessions and operations seen by this invocation.
//!
//! The cache is owned by one router and never shared. It only saves store
//! round-trips when the start and end of something arrive in the same
//! process; the durable store stays authoritative.

use std::collections::{HashMap, HashSet};

use crate::metrics::SessionMetrics;
use crate::observe::SessionHandle;
use crate::store::OpenSpanRecord;

/// A session known to this process.
#[derive(Debug, Clone)]
pub struct CachedSession {
    pub handle: SessionHandle,
    /// Metrics mirrored locally, used when the store is unreachable.
    pub metrics: SessionMetrics,
}

/// Explicitly scoped cache passed into the router.
#[derive(Debug, Default)]
pub struct SessionCache {
    sessions: HashMap<String, CachedSession>,
    operations: HashMap<(String, String), OpenSpanRecord>,
    closed: HashSet<String>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, session_id: &str) -> Option<&CachedSession> {
        self.sessions.get(session_id)
    }

    pub fn session_mut(&mut self, session_id: &str) -> Option<&mut CachedSession> {
        self.sessions.get_mut(session_id)
    }

    /// Remember a session. Reopening a closed id clears its closed mark.
    pub fn insert_session(&mut self, handle: SessionHandle, metrics: SessionMetrics) {
        self.closed.remove(&handle.session_id);
        self.sessions
            .insert(handle.session_id.clone(), CachedSession { handle, metrics });
    }

    pub fn insert_operation(&mut self, session_id: &str, open: OpenSpanRecord) {
        self.operations
            .insert((session_id.to_string(), open.operation_id.clone()), open);
    }

    pub fn operation(&self, session_id: &str, operation_id: &str) -> Option<&OpenSpanRecord> {
        self.operations
            .get(&(session_id.to_string(), operation_id.to_string()))
    }

    /// Remove and return one cached operation.
    pub fn take_operation(&mut self, session_id: &str, operation_id: &str) -> Option<OpenSpanRecord> {
        self.operations
            .remove(&(session_id.to_string(), operation_id.to_string()))
    }

    /// Remove and return every cached operation of a session.
    pub fn take_operations(&mut self, session_id: &str) -> Vec<OpenSpanRecord> {
        let keys: Vec<_> = self
            .operations
            .keys()
            .filter(|(sid, _)| sid == session_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.operations.remove(&key))
            .collect()
    }

    /// Number of cached in-flight operations for a session.
    pub fn open_count(&self, session_id: &str) -> usize {
        self.operations
            .keys()
            .filter(|(sid, _)| sid == session_id)
            .count()
    }

    /// Forget a session and mark it closed.
    pub fn close_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
        self.operations.retain(|(sid, _), _| sid != session_id);
        self.closed.insert(session_id.to_string());
    }

    pub fn is_closed(&self, session_id: &str) -> bool {
        self.closed.contains(session_id)
    }
}
