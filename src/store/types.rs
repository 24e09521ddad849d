// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable record types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{SpanId, TraceId};
use crate::metrics::SessionMetrics;

/// Session identifier.
pub type SessionId = String;

/// Link from a sub-task session back to the operation that launched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentLink {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub token: String,
    pub session_id: SessionId,
    pub operation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_type: Option<String>,
}

/// Durable state for one session, addressed by session id.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    /// Chosen once, at first sight of the session; never rewritten.
    pub trace_id: TraceId,
    pub root_span_id: SpanId,
    /// Propagation token of the root span.
    pub token: Option<String>,
    pub parent: Option<ParentLink>,
    pub cwd: Option<String>,
    pub metrics: SessionMetrics,
    /// In-flight operations keyed by operation id. Populated by `load`;
    /// written only through `register_open_span` / `pop_open_span`.
    pub open_spans: BTreeMap<String, OpenSpanRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Create a record for a session first seen at `now`.
    pub fn new(
        session_id: impl Into<SessionId>,
        trace_id: TraceId,
        root_span_id: SpanId,
        token: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            trace_id,
            root_span_id,
            token,
            parent: None,
            cwd: None,
            metrics: SessionMetrics::default(),
            open_spans: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach a parent link.
    pub fn with_parent(mut self, parent: Option<ParentLink>) -> Self {
        self.parent = parent;
        self
    }

    /// Attach the working-context identifier.
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Whether this session is a nested sub-task of another session.
    pub fn is_subtask(&self) -> bool {
        self.parent.is_some()
    }
}

/// Persisted state of a started-but-not-finished operation.
///
/// Holds everything a later, unrelated process needs to finalize the span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenSpanRecord {
    pub operation_id: String,
    pub name: String,
    pub span_id: SpanId,
    pub trace_id: TraceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    /// Token of the resolved parent, kept for re-resolution at finalize time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_token: Option<String>,
    /// Token of this operation's own span.
    pub token: String,
    pub start_time: DateTime<Utc>,
    /// Full original event context.
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Set when this operation launches a sub-task.
    #[serde(default)]
    pub launches_subtask: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_type: Option<String>,
    /// Nested under another in-flight operation rather than the session root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_operation_id: Option<String>,
}

/// A hint that a newly observed session is a sub-task of an in-flight operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingParent {
    pub token: String,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub session_id: SessionId,
    pub operation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingParent {
    /// Build the entry for an operation that launches a sub-task.
    pub fn for_operation(session_id: &str, open: &OpenSpanRecord, now: DateTime<Utc>) -> Self {
        Self {
            token: open.token.clone(),
            trace_id: open.trace_id,
            span_id: open.span_id,
            session_id: session_id.to_string(),
            operation_id: open.operation_id.clone(),
            subtask_type: open.subtask_type.clone(),
            created_at: now,
        }
    }

    /// Convert into the link stored on the claiming session.
    pub fn into_link(self) -> ParentLink {
        ParentLink {
            trace_id: self.trace_id,
            span_id: self.span_id,
            token: self.token,
            session_id: self.session_id,
            operation_id: self.operation_id,
            subtask_type: self.subtask_type,
        }
    }
}

/// Result of a create-if-absent session initialization.
#[derive(Debug, Clone, PartialEq)]
pub enum InitOutcome {
    /// No record existed; the given one was stored.
    Created(SessionRecord),
    /// A record already existed and was left untouched.
    Existing(SessionRecord),
}

impl InitOutcome {
    /// Whether this call created the record.
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    /// The record now in the store.
    pub fn record(&self) -> &SessionRecord {
        match self {
            Self::Created(record) | Self::Existing(record) => record,
        }
    }

    /// Take the record now in the store.
    pub fn into_record(self) -> SessionRecord {
        match self {
            Self::Created(record) | Self::Existing(record) => record,
        }
    }
}
