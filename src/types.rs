// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core type definitions for hooktrace.
//!
//! This module contains the input record delivered to each invocation
//! ([`HookEvent`]), its lifecycle tag ([`EventKind`]) and token accounting
//! ([`TokenUsage`]) shared by spans and metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EventError;

// ============================================================================
// Event Kinds
// ============================================================================

/// Lifecycle moment described by one input record.
///
/// Both neutral names and hook-style names are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Explicit session start. Any first event for a session id implies it.
    #[serde(alias = "SessionStart")]
    SessionStart,
    /// An operation is about to run.
    #[serde(alias = "PreToolUse")]
    PreOperation,
    /// An operation finished.
    #[serde(alias = "PostToolUse")]
    PostOperation,
    /// An operation finished and the caller classified it as failed.
    #[serde(alias = "PostToolUseFailure")]
    PostOperationFailure,
    /// A nested sub-task reported completion.
    #[serde(alias = "SubagentStop")]
    SubtaskStop,
    /// The user submitted a turn.
    #[serde(alias = "UserPromptSubmit")]
    TurnSubmitted,
    /// Context compaction is about to happen.
    #[serde(alias = "PreCompact")]
    PreCompaction,
    /// Context compaction finished.
    #[serde(alias = "PostCompact")]
    PostCompaction,
    /// The session ended.
    #[serde(alias = "SessionEnd")]
    Terminal,
}

impl EventKind {
    /// Stable name used in logs and span names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::PreOperation => "pre_operation",
            Self::PostOperation => "post_operation",
            Self::PostOperationFailure => "post_operation_failure",
            Self::SubtaskStop => "subtask_stop",
            Self::TurnSubmitted => "turn_submitted",
            Self::PreCompaction => "pre_compaction",
            Self::PostCompaction => "post_compaction",
            Self::Terminal => "terminal",
        }
    }

    /// Whether this event closes an operation.
    pub fn is_operation_end(&self) -> bool {
        matches!(self, Self::PostOperation | Self::PostOperationFailure)
    }

    /// Whether this event is recorded as a zero-duration point event.
    pub fn is_point_event(&self) -> bool {
        matches!(
            self,
            Self::SubtaskStop | Self::TurnSubmitted | Self::PreCompaction | Self::PostCompaction
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Token Usage
// ============================================================================

/// Token counts reported for one operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, alias = "input")]
    pub input_tokens: u64,
    #[serde(default, alias = "output")]
    pub output_tokens: u64,
    #[serde(default, alias = "total")]
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create usage from input/output counts.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
        }
    }

    /// Total, falling back to input + output when the caller left it unset.
    pub fn total(&self) -> u64 {
        if self.total_tokens == 0 {
            self.input_tokens.saturating_add(self.output_tokens)
        } else {
            self.total_tokens
        }
    }

    /// Add another usage record to this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_tokens = self.total().saturating_add(other.total());
    }

    /// Check if nothing was counted.
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.total_tokens == 0
    }
}

// ============================================================================
// Hook Event
// ============================================================================

/// One input record, as read from a line of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    /// Opaque session identifier supplied by the caller.
    pub session_id: String,

    /// Working-context identifier.
    #[serde(alias = "working_dir")]
    pub cwd: String,

    /// Lifecycle tag.
    #[serde(alias = "hook_event_name")]
    pub kind: EventKind,

    #[serde(default, alias = "tool_name", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,

    #[serde(default, alias = "tool_use_id", skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,

    #[serde(default, alias = "tool_input", skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    #[serde(default, alias = "tool_response", skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, alias = "parent_tool_use_id", skip_serializing_if = "Option::is_none")]
    pub parent_operation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    /// Free-text compaction reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,

    /// Free-text prompt for a submitted turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Sub-task type hint announced by a freshly spawned sub-task session.
    #[serde(default, alias = "agent_type", skip_serializing_if = "Option::is_none")]
    pub subtask_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the moment happened. Defaults to the invocation's clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl HookEvent {
    /// Create a bare event of the given kind.
    pub fn new(session_id: impl Into<String>, cwd: impl Into<String>, kind: EventKind) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: cwd.into(),
            kind,
            operation_name: None,
            operation_id: None,
            input: None,
            output: None,
            parent_operation_id: None,
            model: None,
            usage: None,
            trigger: None,
            prompt: None,
            subtask_type: None,
            success: None,
            failure_category: None,
            status_code: None,
            error: None,
            timestamp: None,
        }
    }

    /// Create a pre-operation event.
    pub fn pre_operation(
        session_id: impl Into<String>,
        cwd: impl Into<String>,
        name: impl Into<String>,
        operation_id: impl Into<String>,
        input: Value,
    ) -> Self {
        let mut event = Self::new(session_id, cwd, EventKind::PreOperation);
        event.operation_name = Some(name.into());
        event.operation_id = Some(operation_id.into());
        event.input = Some(input);
        event
    }

    /// Create a post-operation event.
    pub fn post_operation(
        session_id: impl Into<String>,
        cwd: impl Into<String>,
        name: impl Into<String>,
        operation_id: impl Into<String>,
        output: Value,
    ) -> Self {
        let mut event = Self::new(session_id, cwd, EventKind::PostOperation);
        event.operation_name = Some(name.into());
        event.operation_id = Some(operation_id.into());
        event.output = Some(output);
        event
    }

    /// Set the event timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Parse and validate one line of input.
    pub fn parse_line(line: &str) -> Result<Self, EventError> {
        let event: HookEvent = serde_json::from_str(line.trim())?;
        event.validate()?;
        Ok(event)
    }

    /// Check the shape rules for this event's kind.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.session_id.trim().is_empty() {
            return Err(EventError::EmptyField("session_id"));
        }
        if self.cwd.trim().is_empty() {
            return Err(EventError::EmptyField("cwd"));
        }

        if self.kind == EventKind::PreOperation || self.kind.is_operation_end() {
            match self.operation_name.as_deref() {
                None => return Err(EventError::MissingField("operation_name")),
                Some(name) if name.trim().is_empty() => {
                    return Err(EventError::EmptyField("operation_name"))
                }
                Some(_) => {}
            }
        }

        if self.kind == EventKind::PreOperation {
            match self.operation_id.as_deref() {
                None => return Err(EventError::MissingField("operation_id")),
                Some(id) if id.trim().is_empty() => {
                    return Err(EventError::EmptyField("operation_id"))
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Operation id, ignoring blank values.
    pub fn operation_id(&self) -> Option<&str> {
        self.operation_id.as_deref().filter(|id| !id.trim().is_empty())
    }

    /// Event time, or `now` if the caller did not supply one.
    pub fn time_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp.unwrap_or(now)
    }

    /// Read a string field from the operation input payload.
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input.as_ref()?.get(key)?.as_str()
    }
}
