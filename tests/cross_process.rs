// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Trace reconstruction across invocations.
//!
//! Each test opens a fresh [`EventRouter`] per event over one shared state
//! directory, the way separate hook processes would.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;

use hooktrace::observe::{JsonlExporter, MemoryExporter, Observer, SpanKind};
use hooktrace::router::{EventRouter, RouteOutcome, RouterConfig, SessionState};
use hooktrace::store::{PendingRegistry, SpanStore, PENDING_DB_FILE, SESSIONS_DB_FILE};
use hooktrace::types::{EventKind, HookEvent};

const BUSY: Duration = Duration::from_millis(2000);

fn invocation(state: &TempDir, exporter: &Arc<MemoryExporter>) -> EventRouter {
    invocation_with(state, exporter, RouterConfig::default())
}

fn invocation_with(
    state: &TempDir,
    exporter: &Arc<MemoryExporter>,
    config: RouterConfig,
) -> EventRouter {
    EventRouter::open(
        state.path(),
        BUSY,
        Observer::new(exporter.clone(), "integration"),
        config,
    )
}

/// Route one event in its own short-lived router.
async fn run(state: &TempDir, exporter: &Arc<MemoryExporter>, event: HookEvent) -> RouteOutcome {
    let mut router = invocation(state, exporter);
    let outcome = router.handle(event).await;
    router.shutdown(Duration::from_millis(200)).await;
    outcome
}

fn store(state: &TempDir) -> SpanStore {
    SpanStore::open_at(&state.path().join(SESSIONS_DB_FILE), BUSY).unwrap()
}

fn pending(state: &TempDir) -> PendingRegistry {
    PendingRegistry::open_at(&state.path().join(PENDING_DB_FILE), BUSY).unwrap()
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn test_trace_id_is_stable_across_invocations() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());

    let RouteOutcome::SessionStarted(first) =
        run(&state, &exporter, HookEvent::new("s1", "/w", EventKind::SessionStart)).await
    else {
        panic!("expected session start");
    };
    let RouteOutcome::SessionStarted(second) =
        run(&state, &exporter, HookEvent::new("s1", "/w", EventKind::SessionStart)).await
    else {
        panic!("expected session start");
    };

    assert_eq!(first.trace_id, second.trace_id);
    assert_eq!(first.root_span_id, second.root_span_id);
    assert!(!second.is_subtask());
}

#[tokio::test]
async fn test_first_event_implies_session_start() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());

    run(
        &state,
        &exporter,
        HookEvent::pre_operation("s1", "/w", "Read", "op-1", json!({"path": "a.rs"})),
    )
    .await;

    let record = store(&state).load("s1").unwrap().unwrap();
    assert!(record.open_spans.contains_key("op-1"));
    assert_eq!(record.cwd.as_deref(), Some("/w"));
}

// ============================================================================
// Operations
// ============================================================================

#[tokio::test]
async fn test_operation_split_across_invocations() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());
    let t0 = Utc::now();

    run(&state, &exporter, HookEvent::new("s1", "/w", EventKind::SessionStart).at(t0)).await;
    run(
        &state,
        &exporter,
        HookEvent::pre_operation("s1", "/w", "Bash", "op-1", json!({"command": "make"}))
            .at(t0 + chrono::Duration::milliseconds(10)),
    )
    .await;
    let outcome = run(
        &state,
        &exporter,
        HookEvent::post_operation("s1", "/w", "Bash", "op-1", json!({"exit": 0}))
            .at(t0 + chrono::Duration::milliseconds(260)),
    )
    .await;

    let RouteOutcome::OperationFinished { span, degraded } = outcome else {
        panic!("expected finished operation, got {:?}", outcome);
    };
    assert!(!degraded);
    assert_eq!(span.duration_ms(), 250);
    assert_eq!(span.kind, SpanKind::Operation);
    assert_eq!(span.input, json!({"command": "make"}));

    let root = store(&state).load("s1").unwrap().unwrap();
    assert_eq!(span.trace_id, root.trace_id);
    assert_eq!(span.parent_span_id, Some(root.root_span_id));
    assert!(root.open_spans.is_empty());
    assert_eq!(root.metrics.operation_count, 1);
}

#[tokio::test]
async fn test_end_before_start_clamps_duration() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());
    let t0 = Utc::now();

    run(
        &state,
        &exporter,
        HookEvent::pre_operation("s1", "/w", "Bash", "op-1", json!({})).at(t0),
    )
    .await;
    let outcome = run(
        &state,
        &exporter,
        HookEvent::post_operation("s1", "/w", "Bash", "op-1", json!({}))
            .at(t0 - chrono::Duration::seconds(5)),
    )
    .await;

    let RouteOutcome::OperationFinished { span, .. } = outcome else {
        panic!("expected finished operation");
    };
    assert_eq!(span.duration_ms(), 0);
}

#[tokio::test]
async fn test_second_end_is_degraded() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());

    run(&state, &exporter, HookEvent::pre_operation("s1", "/w", "Edit", "op-1", json!({}))).await;
    let first = run(&state, &exporter, HookEvent::post_operation("s1", "/w", "Edit", "op-1", json!({}))).await;
    let second = run(&state, &exporter, HookEvent::post_operation("s1", "/w", "Edit", "op-1", json!({}))).await;

    assert!(matches!(first, RouteOutcome::OperationFinished { degraded: false, .. }));
    let RouteOutcome::OperationFinished { span, degraded } = second else {
        panic!("expected finished operation");
    };
    assert!(degraded);
    assert_eq!(span.attribute("degraded"), Some(&json!(true)));
}

// ============================================================================
// Sub-tasks
// ============================================================================

#[tokio::test]
async fn test_subtask_session_joins_parent_trace() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());

    let RouteOutcome::OperationStarted(launch) = run(
        &state,
        &exporter,
        HookEvent::pre_operation(
            "parent",
            "/w",
            "Task",
            "op-task",
            json!({"subagent_type": "reviewer", "prompt": "review the diff"}),
        ),
    )
    .await
    else {
        panic!("expected operation start");
    };
    assert!(launch.launches_subtask);
    assert_eq!(pending(&state).len().unwrap(), 1);

    let mut child_start = HookEvent::new("child", "/w", EventKind::SessionStart);
    child_start.subtask_type = Some("reviewer".to_string());
    let RouteOutcome::SessionStarted(child) = run(&state, &exporter, child_start).await else {
        panic!("expected session start");
    };

    assert!(child.is_subtask());
    assert_eq!(child.trace_id, launch.trace_id);
    let link = child.parent.clone().unwrap();
    assert_eq!(link.span_id, launch.span_id);
    assert_eq!(link.session_id, "parent");
    assert_eq!(link.operation_id, "op-task");
    // Claimed exactly once
    assert!(pending(&state).is_empty().unwrap());

    // The child's own operations stay in the parent's trace
    let RouteOutcome::OperationStarted(nested) = run(
        &state,
        &exporter,
        HookEvent::pre_operation("child", "/w", "Grep", "op-grep", json!({"pattern": "todo"})),
    )
    .await
    else {
        panic!("expected operation start");
    };
    assert_eq!(nested.trace_id, launch.trace_id);
    assert_eq!(nested.parent_span_id, Some(child.root_span_id));

    let RouteOutcome::SessionClosed { session, .. } =
        run(&state, &exporter, HookEvent::new("child", "/w", EventKind::Terminal)).await
    else {
        panic!("expected session close");
    };
    assert_eq!(session.trace_id, launch.trace_id);
    assert_eq!(session.parent_span_id, Some(launch.span_id));
    assert_eq!(session.attribute("subtask"), Some(&json!(true)));
}

#[tokio::test]
async fn test_expired_pending_entry_leaves_session_top_level() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());
    let long_ago = Utc::now() - chrono::Duration::minutes(10);

    let RouteOutcome::OperationStarted(launch) = run(
        &state,
        &exporter,
        HookEvent::pre_operation("parent", "/w", "Task", "op-task", json!({"subagent_type": "general"}))
            .at(long_ago),
    )
    .await
    else {
        panic!("expected operation start");
    };

    let RouteOutcome::SessionStarted(child) =
        run(&state, &exporter, HookEvent::new("child", "/w", EventKind::SessionStart)).await
    else {
        panic!("expected session start");
    };

    assert!(!child.is_subtask());
    assert_ne!(child.trace_id, launch.trace_id);
}

#[tokio::test]
async fn test_pending_entry_is_not_claimed_by_launching_session() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());

    run(
        &state,
        &exporter,
        HookEvent::pre_operation("parent", "/w", "Task", "op-task", json!({})),
    )
    .await;
    // Same session, new invocation: must not adopt its own pending entry
    run(&state, &exporter, HookEvent::new("parent", "/w", EventKind::TurnSubmitted)).await;

    assert_eq!(pending(&state).len().unwrap(), 1);
}

#[tokio::test]
async fn test_subtask_end_clears_pending_entry() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());

    run(
        &state,
        &exporter,
        HookEvent::pre_operation("parent", "/w", "Task", "op-task", json!({"subagent_type": "x"})),
    )
    .await;
    let outcome = run(
        &state,
        &exporter,
        HookEvent::post_operation("parent", "/w", "Task", "op-task", json!("done")),
    )
    .await;

    let RouteOutcome::OperationFinished { span, .. } = outcome else {
        panic!("expected finished operation");
    };
    assert_eq!(span.kind, SpanKind::SubtaskOperation);
    assert!(pending(&state).is_empty().unwrap());
}

// ============================================================================
// Terminal
// ============================================================================

#[tokio::test]
async fn test_terminal_closes_open_operations_as_incomplete() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());
    let t0 = Utc::now();

    run(&state, &exporter, HookEvent::pre_operation("s1", "/w", "Bash", "op-a", json!({})).at(t0)).await;
    run(
        &state,
        &exporter,
        HookEvent::pre_operation("s1", "/w", "Read", "op-b", json!({}))
            .at(t0 + chrono::Duration::milliseconds(5)),
    )
    .await;

    let mut router = invocation(&state, &exporter);
    assert_eq!(router.session_state("s1"), SessionState::WaitingForChildren(2));
    let outcome = router
        .handle(HookEvent::new("s1", "/w", EventKind::Terminal).at(t0 + chrono::Duration::seconds(1)))
        .await;
    assert_eq!(router.session_state("s1"), SessionState::Closed);

    let RouteOutcome::SessionClosed {
        session,
        incomplete,
    } = outcome
    else {
        panic!("expected session close");
    };
    assert_eq!(incomplete.len(), 2);
    assert_eq!(incomplete[0].name, "Bash");
    assert_eq!(incomplete[1].name, "Read");
    for span in &incomplete {
        assert!(!span.outcome.success);
        assert_eq!(span.outcome.failure_category.as_deref(), Some("incomplete"));
    }
    assert_eq!(session.kind, SpanKind::Session);
    assert_eq!(session.attribute("operation_count"), Some(&json!(2)));
    assert_eq!(session.attribute("failure_count"), Some(&json!(2)));

    assert!(store(&state).load("s1").unwrap().is_none());
    let fresh = invocation(&state, &exporter);
    assert_eq!(fresh.session_state("s1"), SessionState::Unseen);
}

#[tokio::test]
async fn test_session_reused_after_terminal_gets_new_trace() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());

    let RouteOutcome::SessionStarted(first) =
        run(&state, &exporter, HookEvent::new("s1", "/w", EventKind::SessionStart)).await
    else {
        panic!("expected session start");
    };
    run(&state, &exporter, HookEvent::new("s1", "/w", EventKind::Terminal)).await;
    let RouteOutcome::SessionStarted(second) =
        run(&state, &exporter, HookEvent::new("s1", "/w", EventKind::SessionStart)).await
    else {
        panic!("expected session start");
    };

    assert_ne!(first.trace_id, second.trace_id);
}

// ============================================================================
// Isolation
// ============================================================================

#[tokio::test]
async fn test_interleaved_sessions_stay_isolated() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());

    run(&state, &exporter, HookEvent::pre_operation("a", "/a", "Bash", "op-1", json!({"who": "a"}))).await;
    run(&state, &exporter, HookEvent::pre_operation("b", "/b", "Bash", "op-1", json!({"who": "b"}))).await;

    let RouteOutcome::OperationFinished { span: span_b, .. } =
        run(&state, &exporter, HookEvent::post_operation("b", "/b", "Bash", "op-1", json!({}))).await
    else {
        panic!("expected finished operation");
    };
    let RouteOutcome::OperationFinished { span: span_a, .. } =
        run(&state, &exporter, HookEvent::post_operation("a", "/a", "Bash", "op-1", json!({}))).await
    else {
        panic!("expected finished operation");
    };

    assert_eq!(span_a.input, json!({"who": "a"}));
    assert_eq!(span_b.input, json!({"who": "b"}));
    assert_ne!(span_a.trace_id, span_b.trace_id);
    assert_eq!(span_a.session_id, "a");
    assert_eq!(span_b.session_id, "b");
}

#[tokio::test]
async fn test_point_events_share_session_trace() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());

    let RouteOutcome::SessionStarted(handle) =
        run(&state, &exporter, HookEvent::new("s1", "/w", EventKind::SessionStart)).await
    else {
        panic!("expected session start");
    };
    run(&state, &exporter, HookEvent::new("s1", "/w", EventKind::TurnSubmitted)).await;
    run(&state, &exporter, HookEvent::new("s1", "/w", EventKind::PreCompaction)).await;

    let events: Vec<_> = exporter
        .spans()
        .into_iter()
        .filter(|span| span.kind == SpanKind::Event)
        .collect();
    assert_eq!(events.len(), 2);
    for span in events {
        assert_eq!(span.trace_id, handle.trace_id);
        assert_eq!(span.parent_span_id, Some(handle.root_span_id));
    }

    let metrics = store(&state).load("s1").unwrap().unwrap().metrics;
    assert_eq!(metrics.turn_count, 1);
    assert_eq!(metrics.compaction_count, 1);
}

// ============================================================================
// Sweeps and export
// ============================================================================

#[tokio::test]
async fn test_terminal_sweeps_stale_sessions() {
    let state = TempDir::new().unwrap();
    let exporter = Arc::new(MemoryExporter::new());
    let config = RouterConfig {
        session_ttl: Duration::from_secs(1),
        ..RouterConfig::default()
    };

    run(&state, &exporter, HookEvent::new("stale", "/w", EventKind::SessionStart)).await;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    run(&state, &exporter, HookEvent::new("fresh", "/w", EventKind::SessionStart)).await;

    let mut router = invocation_with(&state, &exporter, config);
    router.handle(HookEvent::new("other", "/w", EventKind::Terminal)).await;

    let remaining = store(&state).list_sessions().unwrap();
    assert_eq!(remaining, vec!["fresh".to_string()]);
}

#[tokio::test]
async fn test_jsonl_export_end_to_end() {
    let state = TempDir::new().unwrap();
    let out = state.path().join("spans.jsonl");
    let t0 = Utc::now();

    let lines = [
        json!({"session_id": "s1", "cwd": "/w", "kind": "session_start", "timestamp": t0}),
        json!({"session_id": "s1", "cwd": "/w", "hook_event_name": "PreToolUse", "tool_name": "Bash",
               "tool_use_id": "op-1", "tool_input": {"command": "ls"}, "timestamp": t0}),
        json!({"session_id": "s1", "cwd": "/w", "hook_event_name": "PostToolUse", "tool_name": "Bash",
               "tool_use_id": "op-1", "tool_response": "ok",
               "timestamp": t0 + chrono::Duration::milliseconds(40)}),
        json!({"session_id": "s1", "cwd": "/w", "kind": "terminal",
               "timestamp": t0 + chrono::Duration::milliseconds(50)}),
    ];

    for line in &lines {
        let observer = Observer::new(Arc::new(JsonlExporter::new(&out)), "integration");
        let mut router = EventRouter::open(state.path(), BUSY, observer, RouterConfig::default());
        router.handle_line(&line.to_string()).await;
        assert!(router.shutdown(Duration::from_secs(1)).await);
    }

    let content = std::fs::read_to_string(&out).unwrap();
    let spans: Vec<serde_json::Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0]["name"], "Bash");
    assert_eq!(spans[1]["name"], "session");
    assert_eq!(spans[0]["trace_id"], spans[1]["trace_id"]);
    assert_eq!(spans[0]["parent_span_id"], spans[1]["span_id"]);
}
