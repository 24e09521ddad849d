// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Finished-span model handed to exporters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::{SpanId, TraceId};
use crate::types::TokenUsage;

/// Kind of observation a span represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// Root span of a session.
    Session,
    /// Atomic timed unit of work.
    Operation,
    /// Operation that launched a nested sub-task.
    SubtaskOperation,
    /// Zero-duration annotation.
    Event,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Operation => "operation",
            Self::SubtaskOperation => "subtask_operation",
            Self::Event => "event",
        }
    }
}

/// Caller-supplied classification of a finished operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i64>,
}

impl Outcome {
    /// Successful outcome.
    pub fn success() -> Self {
        Self {
            success: true,
            failure_category: None,
            status_code: None,
        }
    }

    /// Failed outcome with a category.
    pub fn failure(category: impl Into<String>) -> Self {
        Self {
            success: false,
            failure_category: Some(category.into()),
            status_code: None,
        }
    }

    /// Attach a status or exit code.
    pub fn with_status(mut self, status_code: Option<i64>) -> Self {
        self.status_code = status_code;
        self
    }
}

impl Default for Outcome {
    fn default() -> Self {
        Self::success()
    }
}

/// A closed span, ready for export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedSpan {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub outcome: Outcome,
}

impl FinishedSpan {
    /// Duration in milliseconds; never negative.
    pub fn duration_ms(&self) -> u64 {
        let millis = (self.end_time - self.start_time).num_milliseconds();
        u64::try_from(millis).unwrap_or(0)
    }

    /// Whether this span has no parent link.
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    /// Read one attribute.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}
