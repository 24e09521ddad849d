// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Observation factory: builds session, operation and point-event spans.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::{encode_token, SpanId, TraceId};
use crate::metrics::SessionSummary;
use crate::store::{OpenSpanRecord, ParentLink, PendingParent, SessionRecord};
use crate::types::TokenUsage;

use super::export::SharedExporter;
use super::parent::{resolve_parent, ParentSource, SpanContext};
use super::span::{FinishedSpan, Outcome, SpanKind};

/// Name of every session root span.
pub const SESSION_SPAN_NAME: &str = "session";

/// Where a session handle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    /// Opened by this process.
    Local,
    /// Rebuilt from the durable store.
    Resumed,
}

/// In-process handle to an open session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHandle {
    pub session_id: String,
    pub trace_id: TraceId,
    pub root_span_id: SpanId,
    /// Propagation token of the root span.
    pub token: String,
    pub parent: Option<ParentLink>,
    pub start_time: DateTime<Utc>,
    pub cwd: Option<String>,
    pub origin: SessionOrigin,
}

impl SessionHandle {
    /// Rebuild a handle from a stored record.
    pub fn from_record(record: &SessionRecord) -> Self {
        let token = record
            .token
            .clone()
            .unwrap_or_else(|| encode_token(record.trace_id, record.root_span_id));
        Self {
            session_id: record.session_id.clone(),
            trace_id: record.trace_id,
            root_span_id: record.root_span_id,
            token,
            parent: record.parent.clone(),
            start_time: record.created_at,
            cwd: record.cwd.clone(),
            origin: SessionOrigin::Resumed,
        }
    }

    /// Durable record for this session, with empty metrics.
    pub fn to_record(&self) -> SessionRecord {
        let mut record = SessionRecord::new(
            self.session_id.clone(),
            self.trace_id,
            self.root_span_id,
            Some(self.token.clone()),
            self.start_time,
        )
        .with_parent(self.parent.clone());
        record.cwd = self.cwd.clone();
        record
    }

    /// Whether the session is a nested sub-task of another session.
    pub fn is_subtask(&self) -> bool {
        self.parent.is_some()
    }

    /// Context of the session's root span.
    pub fn context(&self) -> SpanContext {
        SpanContext::new(self.trace_id, self.root_span_id)
    }
}

/// Everything needed to open an operation span.
#[derive(Debug, Clone, Default)]
pub struct OperationStart {
    pub operation_id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub input: Value,
    pub model: Option<String>,
    /// Set when the operation launches a nested sub-task.
    pub subtask_type: Option<String>,
    pub launches_subtask: bool,
}

/// Result attached to an operation when it closes.
#[derive(Debug, Clone, Default)]
pub struct OperationResult {
    pub output: Value,
    pub outcome: Outcome,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
    pub end_time: DateTime<Utc>,
    /// Extra attributes merged into the span.
    pub attributes: Map<String, Value>,
}

/// A zero-duration annotation.
#[derive(Debug, Clone, Default)]
pub struct PointEvent {
    pub session_id: String,
    pub name: String,
    pub payload: Value,
    pub metadata: Map<String, Value>,
    pub at: DateTime<Utc>,
}

/// Builds spans and hands them to the exporter.
///
/// Export is fire-and-forget from the caller's side: a failed export is logged
/// and counted, never returned.
pub struct Observer {
    exporter: SharedExporter,
    service_name: String,
    exported: AtomicU64,
    failed: AtomicU64,
}

impl Observer {
    /// Create a new observer.
    pub fn new(exporter: SharedExporter, service_name: impl Into<String>) -> Self {
        Self {
            exporter,
            service_name: service_name.into(),
            exported: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Spans handed to the exporter successfully.
    pub fn exported_count(&self) -> u64 {
        self.exported.load(Ordering::Relaxed)
    }

    /// Spans whose export failed.
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Allocate identity for a newly observed session.
    ///
    /// With a pending-parent entry the session joins the parent's trace and is
    /// tagged as a sub-task; otherwise it starts a fresh trace.
    pub fn open_session(
        &self,
        session_id: &str,
        cwd: Option<&str>,
        start_time: DateTime<Utc>,
        pending: Option<PendingParent>,
    ) -> SessionHandle {
        let parent = pending.map(PendingParent::into_link);
        let trace_id = parent
            .as_ref()
            .map(|link| link.trace_id)
            .unwrap_or_else(TraceId::new);
        let root_span_id = SpanId::new();

        SessionHandle {
            session_id: session_id.to_string(),
            trace_id,
            root_span_id,
            token: encode_token(trace_id, root_span_id),
            parent,
            start_time,
            cwd: cwd.map(String::from),
            origin: SessionOrigin::Local,
        }
    }

    /// Open an operation span.
    ///
    /// With `explicit_parent` the operation nests directly under that
    /// in-flight operation; otherwise it hangs off the session root. Never fails.
    pub fn open_operation(
        &self,
        session: &SessionHandle,
        start: OperationStart,
        explicit_parent: Option<&OpenSpanRecord>,
    ) -> OpenSpanRecord {
        let handle = explicit_parent.map(|p| SpanContext::new(p.trace_id, p.span_id));
        let resolved = resolve_parent(
            handle,
            None,
            Some(session.token.as_str()),
            Some(session.trace_id),
        );
        let parent_token = match resolved.source {
            ParentSource::Handle => explicit_parent.map(|p| p.token.clone()),
            ParentSource::Orphan => None,
            _ => Some(session.token.clone()),
        };

        let span_id = SpanId::new();
        OpenSpanRecord {
            operation_id: start.operation_id,
            name: start.name,
            span_id,
            trace_id: resolved.trace_id,
            parent_span_id: resolved.parent.map(|p| p.span_id),
            parent_token,
            token: encode_token(resolved.trace_id, span_id),
            start_time: start.start_time,
            input: start.input,
            model: start.model,
            launches_subtask: start.launches_subtask,
            subtask_type: start.subtask_type,
            parent_operation_id: explicit_parent.map(|p| p.operation_id.clone()),
        }
    }

    /// Close an operation and export it.
    ///
    /// Consumes the open record, so one record can only be finalized once.
    pub async fn finalize_operation(
        &self,
        session: Option<&SessionHandle>,
        open: OpenSpanRecord,
        result: OperationResult,
    ) -> FinishedSpan {
        let handle = open
            .parent_span_id
            .map(|span_id| SpanContext::new(open.trace_id, span_id));
        let resolved = resolve_parent(
            handle,
            open.parent_token.as_deref(),
            session.map(|s| s.token.as_str()),
            Some(open.trace_id),
        );

        let kind = if open.launches_subtask {
            SpanKind::SubtaskOperation
        } else {
            SpanKind::Operation
        };

        let mut attributes = result.attributes;
        attributes.insert("operation.id".into(), Value::from(open.operation_id.clone()));
        insert_outcome(&mut attributes, &result.outcome);
        attributes.insert("subtask".into(), Value::from(open.launches_subtask));
        if let Some(subtask_type) = &open.subtask_type {
            attributes.insert("subtask.type".into(), Value::from(subtask_type.clone()));
        }
        if let Some(parent_op) = &open.parent_operation_id {
            attributes.insert("parent.operation_id".into(), Value::from(parent_op.clone()));
        }
        if resolved.source == ParentSource::Orphan {
            attributes.insert("orphan".into(), Value::from(true));
        }

        let span = FinishedSpan {
            trace_id: resolved.trace_id,
            span_id: open.span_id,
            parent_span_id: resolved.parent.map(|p| p.span_id),
            name: open.name,
            kind,
            start_time: open.start_time,
            end_time: result.end_time.max(open.start_time),
            session_id: session.map(|s| s.session_id.clone()).unwrap_or_default(),
            input: open.input,
            output: result.output,
            attributes,
            usage: result.usage,
            model: result.model.or(open.model),
            outcome: result.outcome,
        };

        self.export(&span).await;
        span
    }

    /// Close a session's root span with its aggregate summary.
    pub async fn finalize_session(
        &self,
        handle: &SessionHandle,
        summary: &SessionSummary,
        end_time: DateTime<Utc>,
    ) -> FinishedSpan {
        let mut attributes = Map::new();
        attributes.insert("service.name".into(), Value::from(self.service_name.clone()));
        attributes.insert("subtask".into(), Value::from(handle.is_subtask()));
        if let Some(link) = &handle.parent {
            attributes.insert("parent.session_id".into(), Value::from(link.session_id.clone()));
            attributes.insert("parent.operation_id".into(), Value::from(link.operation_id.clone()));
            if let Some(subtask_type) = &link.subtask_type {
                attributes.insert("subtask.type".into(), Value::from(subtask_type.clone()));
            }
        }
        if let Some(cwd) = &handle.cwd {
            attributes.insert("cwd".into(), Value::from(cwd.clone()));
        }
        attributes.insert("operation_count".into(), Value::from(summary.operation_count));
        attributes.insert("failure_count".into(), Value::from(summary.failure_count));
        attributes.insert("error_rate".into(), Value::from(summary.error_rate));
        attributes.insert("mean_duration_ms".into(), Value::from(summary.mean_duration_ms));
        attributes.insert("max_duration_ms".into(), Value::from(summary.max_duration_ms));
        match serde_json::to_value(summary) {
            Ok(value) => {
                attributes.insert("summary".into(), value);
            }
            Err(e) => tracing::warn!(error = %e, "Could not serialize session summary"),
        }

        let outcome = if summary.failure_count == 0 {
            Outcome::success()
        } else {
            Outcome {
                success: false,
                failure_category: None,
                status_code: None,
            }
        };

        let tokens = (!summary.tokens.is_empty()).then_some(summary.tokens);
        let span = FinishedSpan {
            trace_id: handle.trace_id,
            span_id: handle.root_span_id,
            parent_span_id: handle.parent.as_ref().map(|link| link.span_id),
            name: SESSION_SPAN_NAME.to_string(),
            kind: SpanKind::Session,
            start_time: handle.start_time,
            end_time: end_time.max(handle.start_time),
            session_id: handle.session_id.clone(),
            input: Value::Null,
            output: Value::Null,
            attributes,
            usage: tokens,
            model: None,
            outcome,
        };

        self.export(&span).await;
        span
    }

    /// Emit a zero-duration annotation under the best resolvable parent.
    ///
    /// Without any parent the event is still exported, unlinked, and logged.
    pub async fn record_point_event(
        &self,
        event: PointEvent,
        session: Option<&SessionHandle>,
        parent: Option<SpanContext>,
    ) -> FinishedSpan {
        let resolved = resolve_parent(
            parent,
            None,
            session.map(|s| s.token.as_str()),
            session.map(|s| s.trace_id),
        );

        let mut attributes = event.metadata;
        if resolved.source == ParentSource::Orphan {
            tracing::warn!(session_id = %event.session_id, name = %event.name, "Recording orphan point event");
            attributes.insert("orphan".into(), Value::from(true));
        }

        let span = FinishedSpan {
            trace_id: resolved.trace_id,
            span_id: SpanId::new(),
            parent_span_id: resolved.parent.map(|p| p.span_id),
            name: event.name,
            kind: SpanKind::Event,
            start_time: event.at,
            end_time: event.at,
            session_id: event.session_id,
            input: event.payload,
            output: Value::Null,
            attributes,
            usage: None,
            model: None,
            outcome: Outcome::success(),
        };

        self.export(&span).await;
        span
    }

    /// Flush the exporter, waiting at most `timeout`. Returns whether it succeeded.
    pub async fn flush(&self, timeout: Duration) -> bool {
        match self.exporter.flush(timeout).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Span flush failed");
                false
            }
        }
    }

    async fn export(&self, span: &FinishedSpan) {
        match self.exporter.export(span).await {
            Ok(()) => {
                self.exported.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    span = %span.name,
                    kind = span.kind.as_str(),
                    error = %e,
                    "Span export failed"
                );
            }
        }
    }
}

fn insert_outcome(attributes: &mut Map<String, Value>, outcome: &Outcome) {
    attributes.insert("success".into(), Value::from(outcome.success));
    if let Some(category) = &outcome.failure_category {
        attributes.insert("failure.category".into(), Value::from(category.clone()));
    }
    if let Some(code) = outcome.status_code {
        attributes.insert("status_code".into(), Value::from(code));
    }
}
