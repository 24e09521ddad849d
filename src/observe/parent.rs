// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Parent resolution for spans whose parent may live in another process.

use crate::identity::{decode_token, SpanId, TraceId};

/// Trace id and span id of a resolved parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

impl SpanContext {
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Self { trace_id, span_id }
    }
}

/// Which fallback produced a resolved parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentSource {
    /// Handle held by this process.
    Handle,
    /// The operation's own persisted token.
    OperationToken,
    /// The session's persisted token.
    SessionToken,
    /// Nothing resolved; the span is recorded unlinked.
    Orphan,
}

/// Outcome of parent resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedParent {
    pub trace_id: TraceId,
    pub parent: Option<SpanContext>,
    pub source: ParentSource,
}

/// Resolve a parent in order: in-process handle, operation token, session token.
///
/// Tokens that fail to decode are skipped with a warning. When nothing
/// resolves, the span still gets a trace id: `fallback_trace` if known,
/// otherwise a fresh one.
pub fn resolve_parent(
    handle: Option<SpanContext>,
    operation_token: Option<&str>,
    session_token: Option<&str>,
    fallback_trace: Option<TraceId>,
) -> ResolvedParent {
    if let Some(ctx) = handle {
        return ResolvedParent {
            trace_id: ctx.trace_id,
            parent: Some(ctx),
            source: ParentSource::Handle,
        };
    }

    let candidates = [
        (operation_token, ParentSource::OperationToken),
        (session_token, ParentSource::SessionToken),
    ];
    for (token, source) in candidates {
        let Some(token) = token else { continue };
        match decode_token(token) {
            Ok((trace_id, span_id)) => {
                return ResolvedParent {
                    trace_id,
                    parent: Some(SpanContext::new(trace_id, span_id)),
                    source,
                };
            }
            Err(e) => tracing::warn!(?source, error = %e, "Ignoring undecodable parent token"),
        }
    }

    ResolvedParent {
        trace_id: fallback_trace.unwrap_or_default(),
        parent: None,
        source: ParentSource::Orphan,
    }
}
