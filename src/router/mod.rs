// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Event router: one lifecycle event in, the matching span work out.
//!
//! Per session id the router walks `unseen -> open -> (waiting for children |
//! flat) -> closed`, using only the durable store, the pending-parent
//! registry, the event itself and an explicitly scoped in-process cache.
//! Every storage failure degrades to "absent" and every export failure is
//! swallowed, so handling an event never fails.
//!
//! # Example
//!
//! ```rust,ignore
//! use hooktrace::router::{EventRouter, RouterConfig};
//!
//! let mut router = EventRouter::open(&state_dir, busy_timeout, observer, RouterConfig::default());
//! for line in lines {
//!     router.handle_line(&line).await;
//! }
//! router.shutdown(Duration::from_secs(5)).await;
//! ```

mod cache;

pub use cache::{CachedSession, SessionCache};

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
#[cfg(feature = "telemetry")]
use tracing::instrument;
use tracing::{debug, info, warn};

use crate::identity::SpanId;
use crate::metrics::{OperationSample, SessionMetrics};
use crate::observe::{
    FinishedSpan, Observer, OperationResult, OperationStart, Outcome, PointEvent, SessionHandle,
    SpanContext,
};
use crate::store::{
    InitOutcome, OpenSpanRecord, PendingParent, PendingRegistry, SpanStore, DEFAULT_PENDING_TTL,
    DEFAULT_SESSION_TTL,
};
use crate::types::{EventKind, HookEvent};

/// Category given to operations still open when their session ends.
pub const INCOMPLETE_CATEGORY: &str = "incomplete";

/// Category given to failed operations the caller did not classify.
pub const DEFAULT_FAILURE_CATEGORY: &str = "error";

/// Router tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    /// Age after which session records are swept.
    pub session_ttl: Duration,
    /// Validity window of pending-parent entries.
    pub pending_ttl: Duration,
    /// Operation names that launch a nested sub-task.
    pub subtask_operations: Vec<String>,
    /// Input-payload key holding the sub-task type.
    pub subtask_type_field: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            session_ttl: DEFAULT_SESSION_TTL,
            pending_ttl: DEFAULT_PENDING_TTL,
            subtask_operations: vec!["Task".to_string(), "Agent".to_string()],
            subtask_type_field: "subagent_type".to_string(),
        }
    }
}

impl RouterConfig {
    /// Whether an operation with this name launches a sub-task.
    pub fn launches_subtask(&self, name: &str) -> bool {
        self.subtask_operations.iter().any(|op| op == name)
    }
}

/// Where a session stands, as far as this router can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No record anywhere.
    Unseen,
    /// Open with no operation in flight.
    Open,
    /// Open with this many operations in flight.
    WaitingForChildren(usize),
    /// Closed earlier in this invocation.
    Closed,
}

/// What handling one event produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// The record was malformed and dropped.
    Dropped,
    /// The session is open; nothing else to do.
    SessionStarted(SessionHandle),
    /// An operation span was opened and persisted.
    OperationStarted(OpenSpanRecord),
    /// An operation span was finalized. `degraded` is set when no open
    /// record was found and a standalone span was recorded instead.
    OperationFinished { span: FinishedSpan, degraded: bool },
    /// A point event was recorded.
    PointEvent(FinishedSpan),
    /// The session was closed.
    SessionClosed {
        session: FinishedSpan,
        incomplete: Vec<FinishedSpan>,
    },
}

impl RouteOutcome {
    /// Every span this outcome exported.
    pub fn spans(&self) -> Vec<&FinishedSpan> {
        match self {
            Self::OperationFinished { span, .. } | Self::PointEvent(span) => vec![span],
            Self::SessionClosed {
                session,
                incomplete,
            } => incomplete.iter().chain(std::iter::once(session)).collect(),
            _ => Vec::new(),
        }
    }
}

/// Routes lifecycle events to span work.
pub struct EventRouter {
    store: Option<SpanStore>,
    pending: Option<PendingRegistry>,
    observer: Observer,
    cache: SessionCache,
    config: RouterConfig,
}

impl EventRouter {
    /// Create a router over already opened stores.
    ///
    /// `None` for either store means it is unavailable; the router then
    /// works from the event and its cache alone.
    pub fn new(
        store: Option<SpanStore>,
        pending: Option<PendingRegistry>,
        observer: Observer,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            pending,
            observer,
            cache: SessionCache::new(),
            config,
        }
    }

    /// Open both stores inside `state_dir`. Stores that fail to open are
    /// logged and treated as unavailable.
    pub fn open(
        state_dir: &Path,
        busy_timeout: Duration,
        observer: Observer,
        config: RouterConfig,
    ) -> Self {
        let store = SpanStore::open_at(&state_dir.join(crate::store::SESSIONS_DB_FILE), busy_timeout)
            .map_err(|e| warn!(error = %e, "Session store unavailable"))
            .ok();
        let pending =
            PendingRegistry::open_at(&state_dir.join(crate::store::PENDING_DB_FILE), busy_timeout)
                .map_err(|e| warn!(error = %e, "Pending-parent registry unavailable"))
                .ok();
        Self::new(store, pending, observer, config)
    }

    /// Replace the in-process cache.
    pub fn with_cache(mut self, cache: SessionCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Parse one input line and route it. Malformed lines are logged and dropped.
    pub async fn handle_line(&mut self, line: &str) -> RouteOutcome {
        if line.trim().is_empty() {
            return RouteOutcome::Dropped;
        }
        match HookEvent::parse_line(line) {
            Ok(event) => self.handle(event).await,
            Err(e) => {
                warn!(error = %e, "Dropping malformed event");
                RouteOutcome::Dropped
            }
        }
    }

    /// Route one event.
    #[cfg_attr(
        feature = "telemetry",
        instrument(skip(self, event), fields(session_id = %event.session_id, kind = %event.kind))
    )]
    pub async fn handle(&mut self, event: HookEvent) -> RouteOutcome {
        if let Err(e) = event.validate() {
            warn!(error = %e, "Dropping invalid event");
            return RouteOutcome::Dropped;
        }

        let now = event.time_or(Utc::now());
        match event.kind {
            EventKind::SessionStart => {
                RouteOutcome::SessionStarted(self.ensure_session(&event, now))
            }
            EventKind::PreOperation => self.pre_operation(&event, now),
            EventKind::PostOperation => self.post_operation(&event, now, false).await,
            EventKind::PostOperationFailure => self.post_operation(&event, now, true).await,
            EventKind::SubtaskStop
            | EventKind::TurnSubmitted
            | EventKind::PreCompaction
            | EventKind::PostCompaction => self.point_event(&event, now).await,
            EventKind::Terminal => self.terminal(&event, now).await,
        }
    }

    /// Report where a session stands.
    pub fn session_state(&self, session_id: &str) -> SessionState {
        let cached = self.cache.session(session_id).is_some();
        if !cached && self.cache.is_closed(session_id) {
            return SessionState::Closed;
        }

        let stored = match &self.store {
            Some(store) => store.load(session_id).unwrap_or_else(|e| {
                warn!(session_id, error = %e, "Session state read failed");
                None
            }),
            None => None,
        };

        if !cached && stored.is_none() {
            return SessionState::Unseen;
        }

        let in_flight = stored
            .map(|record| record.open_spans.len())
            .unwrap_or(0)
            .max(self.cache.open_count(session_id));
        if in_flight == 0 {
            SessionState::Open
        } else {
            SessionState::WaitingForChildren(in_flight)
        }
    }

    /// Flush exports with a bounded wait. The durable session records are
    /// left in place for the next invocation.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let flushed = self.observer.flush(timeout).await;
        debug!(
            exported = self.observer.exported_count(),
            failed = self.observer.failed_count(),
            "Router shut down"
        );
        flushed
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Find the session in cache or store, or open it.
    fn ensure_session(&mut self, event: &HookEvent, now: DateTime<Utc>) -> SessionHandle {
        let session_id = event.session_id.as_str();
        if let Some(cached) = self.cache.session(session_id) {
            return cached.handle.clone();
        }

        if let Some(record) = self.load_record(session_id) {
            let handle = SessionHandle::from_record(&record);
            self.cache.insert_session(handle.clone(), record.metrics);
            return handle;
        }

        let claimed = self.claim_pending(event);
        let handle = self
            .observer
            .open_session(session_id, Some(&event.cwd), now, claimed.clone());

        let Some(store) = &self.store else {
            self.cache.insert_session(handle.clone(), SessionMetrics::new());
            return handle;
        };

        match store.init_session(handle.to_record()) {
            Ok(InitOutcome::Created(_)) => {
                info!(
                    session_id,
                    trace_id = %handle.trace_id,
                    subtask = handle.is_subtask(),
                    "Session opened"
                );
                self.cache.insert_session(handle.clone(), SessionMetrics::new());
                handle
            }
            Ok(InitOutcome::Existing(record)) => {
                debug!(session_id, "Session opened concurrently elsewhere");
                // The claim was not used; hand it back for the real child
                if let (Some(entry), Some(pending)) = (claimed, &self.pending) {
                    if let Err(e) = pending.store_pending(&entry) {
                        warn!(session_id, error = %e, "Could not return pending entry");
                    }
                }
                let existing = SessionHandle::from_record(&record);
                self.cache.insert_session(existing.clone(), record.metrics);
                existing
            }
            Err(e) => {
                warn!(session_id, error = %e, "Could not persist session; continuing in memory");
                self.cache.insert_session(handle.clone(), SessionMetrics::new());
                handle
            }
        }
    }

    fn load_record(&self, session_id: &str) -> Option<crate::store::SessionRecord> {
        let store = self.store.as_ref()?;
        match store.load(session_id) {
            Ok(record) => record,
            Err(e) if e.is_corruption() => {
                warn!(session_id, error = %e, "Discarding corrupted session record");
                if let Err(e) = store.delete(session_id) {
                    warn!(session_id, error = %e, "Could not discard corrupted record");
                }
                None
            }
            Err(e) => {
                warn!(session_id, error = %e, "Session load failed; treating as absent");
                None
            }
        }
    }

    fn claim_pending(&self, event: &HookEvent) -> Option<PendingParent> {
        let pending = self.pending.as_ref()?;
        match pending.claim_pending(
            event.subtask_type.as_deref(),
            Some(&event.session_id),
            self.config.pending_ttl,
        ) {
            Ok(claimed) => {
                if let Some(entry) = &claimed {
                    debug!(
                        session_id = %event.session_id,
                        parent_session = %entry.session_id,
                        parent_operation = %entry.operation_id,
                        "Claimed pending parent"
                    );
                }
                claimed
            }
            Err(e) => {
                warn!(error = %e, "Pending-parent lookup failed; session is top-level");
                None
            }
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    fn pre_operation(&mut self, event: &HookEvent, now: DateTime<Utc>) -> RouteOutcome {
        let session = self.ensure_session(event, now);
        let session_id = session.session_id.as_str();
        let operation_id = event.operation_id().unwrap_or_default().to_string();
        let name = event.operation_name.clone().unwrap_or_default();

        let explicit_parent = event
            .parent_operation_id
            .as_deref()
            .and_then(|parent_id| self.find_open(session_id, parent_id));

        let (launches_subtask, subtask_type) = self.subtask_of(event, &name);

        let open = self.observer.open_operation(
            &session,
            OperationStart {
                operation_id,
                name,
                start_time: now,
                input: event.input.clone().unwrap_or(Value::Null),
                model: event.model.clone(),
                subtask_type,
                launches_subtask,
            },
            explicit_parent.as_ref(),
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.register_open_span(session_id, &open) {
                warn!(session_id, operation_id = %open.operation_id, error = %e, "Could not persist open span");
            }
        }

        if open.launches_subtask {
            if let Some(pending) = &self.pending {
                let entry = PendingParent::for_operation(session_id, &open, now);
                if let Err(e) = pending.store_pending(&entry) {
                    warn!(session_id, operation_id = %open.operation_id, error = %e, "Could not register pending parent");
                }
            }
        }

        debug!(session_id, operation_id = %open.operation_id, span_id = %open.span_id, "Operation opened");
        self.cache.insert_operation(session_id, open.clone());
        RouteOutcome::OperationStarted(open)
    }

    async fn post_operation(
        &mut self,
        event: &HookEvent,
        now: DateTime<Utc>,
        failed: bool,
    ) -> RouteOutcome {
        let session = self.ensure_session(event, now);
        let session_id = session.session_id.clone();
        let outcome = classify(event, failed);

        let found = event
            .operation_id()
            .and_then(|operation_id| self.take_open(&session_id, operation_id));
        let degraded = found.is_none();

        let open = match found {
            Some(open) => open,
            None => {
                warn!(
                    session_id = %session_id,
                    operation_id = event.operation_id().unwrap_or("-"),
                    "No open record for operation end; recording standalone span"
                );
                let operation_id = event
                    .operation_id()
                    .map(String::from)
                    .unwrap_or_else(|| format!("standalone-{}", SpanId::new()));
                let name = event.operation_name.clone().unwrap_or_default();
                let (launches_subtask, subtask_type) = self.subtask_of(event, &name);
                self.observer.open_operation(
                    &session,
                    OperationStart {
                        operation_id,
                        name,
                        start_time: now,
                        input: event.input.clone().unwrap_or(Value::Null),
                        model: event.model.clone(),
                        subtask_type,
                        launches_subtask,
                    },
                    None,
                )
            }
        };

        let is_subtask = open.launches_subtask;
        let operation_id = open.operation_id.clone();

        let mut attributes = Map::new();
        if degraded {
            attributes.insert("degraded".into(), Value::from(true));
        }
        if let Some(error) = &event.error {
            attributes.insert("error".into(), Value::from(error.clone()));
        }

        let span = self
            .observer
            .finalize_operation(
                Some(&session),
                open,
                OperationResult {
                    output: event.output.clone().unwrap_or(Value::Null),
                    outcome,
                    usage: event.usage,
                    model: event.model.clone(),
                    end_time: now,
                    attributes,
                },
            )
            .await;

        self.record_samples(&session_id, &[sample_of(&span, is_subtask)]);

        if is_subtask {
            if let Some(pending) = &self.pending {
                if let Err(e) = pending.remove_pending(&session_id, &operation_id) {
                    warn!(session_id = %session_id, operation_id = %operation_id, error = %e, "Could not remove pending parent");
                }
            }
        }

        debug!(session_id = %session_id, operation_id = %operation_id, duration_ms = span.duration_ms(), degraded, "Operation closed");
        RouteOutcome::OperationFinished { span, degraded }
    }

    /// Whether an operation launches a sub-task, and the sub-task type it names.
    fn subtask_of(&self, event: &HookEvent, name: &str) -> (bool, Option<String>) {
        if !self.config.launches_subtask(name) {
            return (false, None);
        }
        let subtask_type = event
            .input_str(&self.config.subtask_type_field)
            .map(String::from)
            .or_else(|| event.subtask_type.clone());
        (true, subtask_type)
    }

    /// Look up an in-flight operation without consuming it.
    fn find_open(&self, session_id: &str, operation_id: &str) -> Option<OpenSpanRecord> {
        if let Some(open) = self.cache.operation(session_id, operation_id) {
            return Some(open.clone());
        }
        let store = self.store.as_ref()?;
        store
            .get_open_span(session_id, operation_id)
            .unwrap_or_else(|e| {
                warn!(session_id, operation_id, error = %e, "Open span read failed");
                None
            })
    }

    /// Consume an in-flight operation from the cache and the store.
    fn take_open(&mut self, session_id: &str, operation_id: &str) -> Option<OpenSpanRecord> {
        let cached = self.cache.take_operation(session_id, operation_id);
        let stored = match &self.store {
            Some(store) => store.pop_open_span(session_id, operation_id).unwrap_or_else(|e| {
                warn!(session_id, operation_id, error = %e, "Open span pop failed");
                None
            }),
            None => None,
        };
        cached.or(stored)
    }

    // ========================================================================
    // Point events
    // ========================================================================

    async fn point_event(&mut self, event: &HookEvent, now: DateTime<Utc>) -> RouteOutcome {
        let session = self.ensure_session(event, now);
        let session_id = session.session_id.clone();

        let (name, payload) = match event.kind {
            EventKind::TurnSubmitted => ("user_turn", json!({ "prompt": event.prompt })),
            EventKind::PreCompaction => ("pre_compaction", json!({ "trigger": event.trigger })),
            EventKind::PostCompaction => ("post_compaction", json!({ "trigger": event.trigger })),
            _ => (
                "subtask_stop",
                json!({
                    "subtask_type": event.subtask_type,
                    "input": event.input,
                }),
            ),
        };

        let mut metadata = Map::new();
        metadata.insert("event.kind".into(), Value::from(event.kind.as_str()));
        metadata.insert("cwd".into(), Value::from(event.cwd.clone()));
        metadata.insert("subtask".into(), Value::from(session.is_subtask()));

        let parent = event
            .parent_operation_id
            .as_deref()
            .and_then(|parent_id| self.find_open(&session_id, parent_id))
            .map(|open| SpanContext::new(open.trace_id, open.span_id));

        let span = self
            .observer
            .record_point_event(
                PointEvent {
                    session_id: session_id.clone(),
                    name: name.to_string(),
                    payload,
                    metadata,
                    at: now,
                },
                Some(&session),
                parent,
            )
            .await;

        match event.kind {
            EventKind::TurnSubmitted => {
                self.update_metrics(&session_id, SessionMetrics::record_turn);
            }
            EventKind::PreCompaction => {
                self.update_metrics(&session_id, SessionMetrics::record_compaction);
            }
            _ => {}
        }

        RouteOutcome::PointEvent(span)
    }

    // ========================================================================
    // Terminal
    // ========================================================================

    async fn terminal(&mut self, event: &HookEvent, now: DateTime<Utc>) -> RouteOutcome {
        let session = self.ensure_session(event, now);
        let session_id = session.session_id.clone();

        let mut open: BTreeMap<String, OpenSpanRecord> = BTreeMap::new();
        if let Some(store) = &self.store {
            match store.drain_open_spans(&session_id) {
                Ok(drained) => {
                    open.extend(drained.into_iter().map(|o| (o.operation_id.clone(), o)));
                }
                Err(e) => warn!(session_id = %session_id, error = %e, "Could not drain open spans"),
            }
        }
        for cached in self.cache.take_operations(&session_id) {
            open.entry(cached.operation_id.clone()).or_insert(cached);
        }

        let mut still_open: Vec<OpenSpanRecord> = open.into_values().collect();
        still_open.sort_by_key(|o| o.start_time);

        let mut incomplete = Vec::with_capacity(still_open.len());
        let mut samples = Vec::with_capacity(still_open.len());
        for open in still_open {
            let is_subtask = open.launches_subtask;
            let mut attributes = Map::new();
            attributes.insert("incomplete".into(), Value::from(true));
            let span = self
                .observer
                .finalize_operation(
                    Some(&session),
                    open,
                    OperationResult {
                        outcome: Outcome::failure(INCOMPLETE_CATEGORY),
                        end_time: now,
                        attributes,
                        ..Default::default()
                    },
                )
                .await;
            samples.push(sample_of(&span, is_subtask));
            incomplete.push(span);
        }

        if !incomplete.is_empty() {
            warn!(session_id = %session_id, count = incomplete.len(), "Session ended with operations still open");
        }

        let metrics = self.record_samples(&session_id, &samples);
        let summary = metrics.compute_aggregate();
        let session_span = self
            .observer
            .finalize_session(&session, &summary, now)
            .await;

        self.cleanup(&session_id);
        self.cache.close_session(&session_id);
        info!(session_id = %session_id, summary = %summary.format_line(), "Session closed");

        RouteOutcome::SessionClosed {
            session: session_span,
            incomplete,
        }
    }

    /// Delete the session's durable state and run both expiry sweeps.
    fn cleanup(&self, session_id: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(session_id) {
                warn!(session_id, error = %e, "Could not delete session record");
            }
            match store.sweep_expired(self.config.session_ttl) {
                Ok(swept) if swept > 0 => debug!(swept, "Swept expired sessions"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Session sweep failed"),
            }
        }

        if let Some(pending) = &self.pending {
            if let Err(e) = pending.remove_pending_for_session(session_id) {
                warn!(session_id, error = %e, "Could not clear pending parents");
            }
            match pending.sweep_expired(self.config.pending_ttl) {
                Ok(swept) if swept > 0 => debug!(swept, "Swept expired pending parents"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Pending-parent sweep failed"),
            }
        }
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    /// Add finalized operations to a session's metrics and return the totals.
    fn record_samples(
        &mut self,
        session_id: &str,
        samples: &[OwnedSample],
    ) -> SessionMetrics {
        self.update_metrics(session_id, |metrics| {
            for sample in samples {
                metrics.record(&sample.as_sample());
            }
        })
    }

    /// Apply a metrics update in the store, mirroring it in the cache.
    ///
    /// When the store cannot take the update the cached copy is updated instead.
    fn update_metrics<F>(&mut self, session_id: &str, update: F) -> SessionMetrics
    where
        F: Fn(&mut SessionMetrics),
    {
        let stored = match &self.store {
            Some(store) => store.update_metrics(session_id, &update).unwrap_or_else(|e| {
                warn!(session_id, error = %e, "Metrics update failed; keeping local totals");
                None
            }),
            None => None,
        };

        match self.cache.session_mut(session_id) {
            Some(cached) => {
                match stored {
                    Some(metrics) => cached.metrics = metrics,
                    None => update(&mut cached.metrics),
                }
                cached.metrics.clone()
            }
            None => stored.unwrap_or_else(|| {
                let mut metrics = SessionMetrics::new();
                update(&mut metrics);
                metrics
            }),
        }
    }
}

/// Owned copy of the fields the metrics aggregator needs from a span.
#[derive(Debug, Clone)]
struct OwnedSample {
    name: String,
    is_subtask: bool,
    outcome: Outcome,
    duration: Duration,
    usage: Option<crate::types::TokenUsage>,
    model: Option<String>,
}

impl OwnedSample {
    fn as_sample(&self) -> OperationSample<'_> {
        OperationSample {
            name: &self.name,
            is_subtask: self.is_subtask,
            success: self.outcome.success,
            failure_category: self.outcome.failure_category.as_deref(),
            duration: self.duration,
            usage: self.usage.as_ref(),
            model: self.model.as_deref(),
        }
    }
}

fn sample_of(span: &FinishedSpan, is_subtask: bool) -> OwnedSample {
    OwnedSample {
        name: span.name.clone(),
        is_subtask,
        outcome: span.outcome.clone(),
        duration: Duration::from_millis(span.duration_ms()),
        usage: span.usage,
        model: span.model.clone(),
    }
}

/// Record the caller's classification; never infer one.
fn classify(event: &HookEvent, failed: bool) -> Outcome {
    if failed {
        return Outcome::failure(
            event
                .failure_category
                .clone()
                .unwrap_or_else(|| DEFAULT_FAILURE_CATEGORY.to_string()),
        )
        .with_status(event.status_code);
    }

    Outcome {
        success: event.success.unwrap_or(true),
        failure_category: event.failure_category.clone(),
        status_code: event.status_code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::{MemoryExporter, SpanKind};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Harness {
        router: EventRouter,
        exporter: Arc<MemoryExporter>,
        temp: TempDir,
    }

    fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let exporter = Arc::new(MemoryExporter::new());
        let router = EventRouter::open(
            temp.path(),
            Duration::from_millis(500),
            Observer::new(exporter.clone(), "test"),
            RouterConfig::default(),
        );
        Harness {
            router,
            exporter,
            temp,
        }
    }

    impl Harness {
        /// A second router on the same state directory, as the next hook process would open it.
        fn next_process(&self) -> EventRouter {
            EventRouter::open(
                self.temp.path(),
                Duration::from_millis(500),
                Observer::new(self.exporter.clone(), "test"),
                RouterConfig::default(),
            )
        }

        fn store(&self) -> SpanStore {
            SpanStore::open(self.temp.path()).unwrap()
        }
    }

    fn memory_router() -> (EventRouter, Arc<MemoryExporter>) {
        let exporter = Arc::new(MemoryExporter::new());
        let router = EventRouter::new(
            None,
            None,
            Observer::new(exporter.clone(), "test"),
            RouterConfig::default(),
        );
        (router, exporter)
    }

    #[tokio::test]
    async fn test_malformed_line_is_dropped() {
        let mut h = harness();
        assert_eq!(h.router.handle_line("not json").await, RouteOutcome::Dropped);
        assert_eq!(h.router.handle_line("   ").await, RouteOutcome::Dropped);
        assert_eq!(
            h.router
                .handle_line(r#"{"session_id":"","cwd":"/w","kind":"terminal"}"#)
                .await,
            RouteOutcome::Dropped
        );
        assert!(h.exporter.spans().is_empty());
    }

    #[tokio::test]
    async fn test_operation_in_one_process() {
        let mut h = harness();
        let t0 = Utc::now();
        h.router
            .handle(HookEvent::pre_operation("s1", "/w", "Bash", "op-1", json!({"command": "ls"})).at(t0))
            .await;
        assert_eq!(h.router.session_state("s1"), SessionState::WaitingForChildren(1));

        let outcome = h
            .router
            .handle(
                HookEvent::post_operation("s1", "/w", "Bash", "op-1", json!("ok"))
                    .at(t0 + chrono::Duration::milliseconds(120)),
            )
            .await;

        let RouteOutcome::OperationFinished { span, degraded } = outcome else {
            panic!("expected a finished operation");
        };
        assert!(!degraded);
        assert_eq!(span.duration_ms(), 120);
        assert!(span.outcome.success);
        assert_eq!(h.router.session_state("s1"), SessionState::Open);
    }

    #[tokio::test]
    async fn test_failure_event_records_category() {
        let mut h = harness();
        h.router
            .handle(HookEvent::pre_operation("s1", "/w", "Bash", "op-1", json!({})))
            .await;
        let mut failed = HookEvent::post_operation("s1", "/w", "Bash", "op-1", Value::Null);
        failed.kind = EventKind::PostOperationFailure;
        failed.error = Some("exit 1".to_string());
        failed.status_code = Some(1);

        let outcome = h.router.handle(failed).await;
        let RouteOutcome::OperationFinished { span, .. } = outcome else {
            panic!("expected a finished operation");
        };
        assert!(!span.outcome.success);
        assert_eq!(span.outcome.failure_category.as_deref(), Some("error"));
        assert_eq!(span.outcome.status_code, Some(1));
        assert_eq!(span.attribute("error"), Some(&json!("exit 1")));
    }

    #[tokio::test]
    async fn test_double_close_is_degraded_once() {
        let mut h = harness();
        h.router
            .handle(HookEvent::pre_operation("s1", "/w", "Bash", "op-1", json!({})))
            .await;
        h.router
            .handle(HookEvent::post_operation("s1", "/w", "Bash", "op-1", json!({})))
            .await;
        let outcome = h
            .router
            .handle(HookEvent::post_operation("s1", "/w", "Bash", "op-1", json!({})))
            .await;

        let RouteOutcome::OperationFinished { span, degraded } = outcome else {
            panic!("expected a finished operation");
        };
        assert!(degraded);
        assert_eq!(span.attribute("degraded"), Some(&json!(true)));

        let closed = h.router.handle(HookEvent::new("s1", "/w", EventKind::Terminal)).await;
        let RouteOutcome::SessionClosed { session, .. } = closed else {
            panic!("expected session close");
        };
        assert_eq!(session.attribute("operation_count"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_subtask_launch_registers_pending() {
        let mut h = harness();
        h.router
            .handle(HookEvent::pre_operation(
                "parent",
                "/w",
                "Task",
                "op-task",
                json!({"subagent_type": "reviewer"}),
            ))
            .await;

        let mut child_start = HookEvent::new("child", "/w", EventKind::SessionStart);
        child_start.subtask_type = Some("reviewer".to_string());
        let RouteOutcome::SessionStarted(child) = h.router.handle(child_start).await else {
            panic!("expected session start");
        };
        let parent = h.router.cache().session("parent").unwrap().handle.clone();
        assert!(child.is_subtask());
        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(
            child.parent.as_ref().unwrap().subtask_type.as_deref(),
            Some("reviewer")
        );
    }

    #[tokio::test]
    async fn test_nested_operation_by_parent_id() {
        let mut h = harness();
        let RouteOutcome::OperationStarted(outer) = h
            .router
            .handle(HookEvent::pre_operation("s1", "/w", "Plan", "op-outer", json!({})))
            .await
        else {
            panic!("expected operation start");
        };
        let mut inner = HookEvent::pre_operation("s1", "/w", "Read", "op-inner", json!({}));
        inner.parent_operation_id = Some("op-outer".to_string());
        let RouteOutcome::OperationStarted(inner) = h.router.handle(inner).await else {
            panic!("expected operation start");
        };
        assert_eq!(inner.parent_span_id, Some(outer.span_id));
    }

    #[tokio::test]
    async fn test_point_events_update_counters() {
        let mut h = harness();
        let mut turn = HookEvent::new("s1", "/w", EventKind::TurnSubmitted);
        turn.prompt = Some("fix the bug".to_string());
        let RouteOutcome::PointEvent(span) = h.router.handle(turn).await else {
            panic!("expected point event");
        };
        assert_eq!(span.kind, SpanKind::Event);
        assert_eq!(span.name, "user_turn");
        assert_eq!(span.duration_ms(), 0);

        let mut compact = HookEvent::new("s1", "/w", EventKind::PreCompaction);
        compact.trigger = Some("auto".to_string());
        h.router.handle(compact).await;
        h.router
            .handle(HookEvent::new("s1", "/w", EventKind::PostCompaction))
            .await;

        let RouteOutcome::SessionClosed { session, .. } =
            h.router.handle(HookEvent::new("s1", "/w", EventKind::Terminal)).await
        else {
            panic!("expected session close");
        };
        let summary = session.attribute("summary").unwrap();
        assert_eq!(summary["turn_count"], 1);
        assert_eq!(summary["compaction_count"], 1);
    }

    #[tokio::test]
    async fn test_terminal_closes_and_forgets() {
        let mut h = harness();
        h.router
            .handle(HookEvent::pre_operation("s1", "/w", "Bash", "op-1", json!({})))
            .await;
        let outcome = h.router.handle(HookEvent::new("s1", "/w", EventKind::Terminal)).await;
        let RouteOutcome::SessionClosed { incomplete, .. } = &outcome else {
            panic!("expected session close");
        };
        assert_eq!(incomplete.len(), 1);
        assert_eq!(outcome.spans().len(), 2);
        assert_eq!(h.router.session_state("s1"), SessionState::Closed);

        // A reused id after close is a brand-new session
        h.router
            .handle(HookEvent::new("s1", "/w", EventKind::SessionStart))
            .await;
        assert_eq!(h.router.session_state("s1"), SessionState::Open);
    }

    #[tokio::test]
    async fn test_unreadable_open_span_keeps_session() {
        let mut h = harness();
        h.router
            .handle(HookEvent::pre_operation("s1", "/w", "Bash", "op-good", json!({})))
            .await;
        h.router
            .handle(HookEvent::pre_operation("s1", "/w", "Read", "op-bad", json!({})))
            .await;
        let trace_id = h.store().load("s1").unwrap().unwrap().trace_id;
        h.store().corrupt_open_span("s1", "op-bad").unwrap();

        let mut next = h.next_process();
        let outcome = next
            .handle(HookEvent::post_operation("s1", "/w", "Bash", "op-good", json!("ok")))
            .await;
        let RouteOutcome::OperationFinished { span, degraded } = outcome else {
            panic!("expected a finished operation");
        };
        assert!(!degraded);
        assert_eq!(span.trace_id, trace_id);

        let record = h.store().load("s1").unwrap().unwrap();
        assert_eq!(record.trace_id, trace_id);
        assert!(record.open_spans.is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_session_record_starts_fresh() {
        let mut h = harness();
        h.router
            .handle(HookEvent::pre_operation("s1", "/w", "Bash", "op-1", json!({})))
            .await;
        let trace_id = h.store().load("s1").unwrap().unwrap().trace_id;
        h.store().corrupt_metrics("s1").unwrap();

        let mut next = h.next_process();
        let outcome = next
            .handle(HookEvent::post_operation("s1", "/w", "Bash", "op-1", json!("ok")))
            .await;
        let RouteOutcome::OperationFinished { span, degraded } = outcome else {
            panic!("expected a finished operation");
        };
        assert!(degraded);
        assert_ne!(span.trace_id, trace_id);

        let record = h.store().load("s1").unwrap().unwrap();
        assert_eq!(record.trace_id, span.trace_id);
        assert_eq!(record.metrics.operation_count, 1);
    }

    #[tokio::test]
    async fn test_standalone_subtask_end_clears_pending() {
        let mut h = harness();
        h.router
            .handle(HookEvent::pre_operation(
                "parent",
                "/w",
                "Task",
                "op-task",
                json!({"subagent_type": "reviewer"}),
            ))
            .await;
        let pending = PendingRegistry::open(h.temp.path()).unwrap();
        assert!(!pending.is_empty().unwrap());
        h.store().pop_open_span("parent", "op-task").unwrap();

        let mut next = h.next_process();
        let outcome = next
            .handle(HookEvent::post_operation("parent", "/w", "Task", "op-task", json!("done")))
            .await;
        let RouteOutcome::OperationFinished { degraded, .. } = outcome else {
            panic!("expected a finished operation");
        };
        assert!(degraded);
        assert!(pending.is_empty().unwrap());

        let mut later = HookEvent::new("later", "/w", EventKind::SessionStart);
        later.subtask_type = Some("reviewer".to_string());
        let RouteOutcome::SessionStarted(session) = next.handle(later).await else {
            panic!("expected session start");
        };
        assert!(!session.is_subtask());
    }

    #[tokio::test]
    async fn test_oversized_usage_saturates() {
        let mut h = harness();
        h.router
            .handle_line(r#"{"session_id":"s1","cwd":"/w","hook_event_name":"PreToolUse","tool_name":"Task","tool_use_id":"op-1","tool_input":{}}"#)
            .await;
        let outcome = h
            .router
            .handle_line(r#"{"session_id":"s1","cwd":"/w","hook_event_name":"PostToolUse","tool_name":"Task","tool_use_id":"op-1","tool_response":{},"usage":{"input":18446744073709551615,"output":1}}"#)
            .await;
        let RouteOutcome::OperationFinished { span, .. } = outcome else {
            panic!("expected a finished operation");
        };
        assert_eq!(span.usage.unwrap().total(), u64::MAX);

        h.router
            .handle_line(r#"{"session_id":"s1","cwd":"/w","hook_event_name":"PostToolUse","tool_name":"Task","tool_use_id":"op-2","tool_response":{},"usage":{"input":18446744073709551615,"output":1}}"#)
            .await;
        let RouteOutcome::SessionClosed { session, .. } =
            h.router.handle(HookEvent::new("s1", "/w", EventKind::Terminal)).await
        else {
            panic!("expected session close");
        };
        let usage = session.usage.unwrap();
        assert_eq!(usage.input_tokens, u64::MAX);
        assert_eq!(usage.output_tokens, 2);
        assert_eq!(usage.total(), u64::MAX);
    }

    #[tokio::test]
    async fn test_works_without_stores() {
        let (mut router, exporter) = memory_router();
        router
            .handle(HookEvent::pre_operation("s1", "/w", "Bash", "op-1", json!({})))
            .await;
        router
            .handle(HookEvent::post_operation("s1", "/w", "Bash", "op-1", json!({})))
            .await;
        router.handle(HookEvent::new("s1", "/w", EventKind::Terminal)).await;

        let spans = exporter.spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].parent_span_id, Some(spans[1].span_id));
        assert!(router.shutdown(Duration::from_millis(50)).await);
    }

    #[test]
    fn test_classify() {
        let mut event = HookEvent::post_operation("s1", "/w", "Bash", "op-1", Value::Null);
        assert_eq!(classify(&event, false), Outcome::success());

        event.success = Some(false);
        event.failure_category = Some("timeout".to_string());
        let outcome = classify(&event, false);
        assert!(!outcome.success);
        assert_eq!(outcome.failure_category.as_deref(), Some("timeout"));

        event.failure_category = None;
        assert_eq!(
            classify(&event, true).failure_category.as_deref(),
            Some(DEFAULT_FAILURE_CATEGORY)
        );
    }

    #[test]
    fn test_launches_subtask() {
        let config = RouterConfig::default();
        assert!(config.launches_subtask("Task"));
        assert!(!config.launches_subtask("Bash"));
    }
}
