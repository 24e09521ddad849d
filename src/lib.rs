// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! hooktrace - rebuild distributed traces from stateless hook invocations.
//!
//! Every invocation receives one lifecycle event (an operation starting, an
//! operation finishing, a sub-task appearing, a user turn, the session
//! ending) and runs in its own process. hooktrace decides, from durable state
//! plus the event alone, which trace the moment belongs to and which span is
//! its parent, then exports finished spans.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`identity`] - Trace/span ids and propagation tokens
//! - [`store`] - Durable span-state store and pending-parent registry (SQLite)
//! - [`observe`] - Observation factory, parent resolution, exporters
//! - [`metrics`] - Per-session metrics aggregation
//! - [`router`] - Event router state machine
//! - [`types`] - Input event record
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Process logging and self-timing
//! - [`error`] - Error types and result aliases
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hooktrace::observe::{JsonlExporter, Observer};
//! use hooktrace::router::{EventRouter, RouterConfig};
//!
//! let observer = Observer::new(Arc::new(JsonlExporter::new("spans.jsonl")), "hooktrace");
//! let mut router = EventRouter::open(&state_dir, timeout, observer, RouterConfig::default());
//! router.handle_line(r#"{"session_id":"s1","cwd":"/w","kind":"session_start"}"#).await;
//! router.shutdown(timeout).await;
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod observe;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{ConfigError, EventError, ExportError, Result, StoreError, TokenError};
pub use identity::{decode_token, encode_token, new_span_id, new_trace_id, SpanId, TraceId};
pub use metrics::{SessionMetrics, SessionSummary};
pub use observe::{FinishedSpan, Observer, SpanExporter, SpanKind};
pub use router::{EventRouter, RouteOutcome, RouterConfig, SessionState};
pub use store::{PendingRegistry, SpanStore};
pub use types::{EventKind, HookEvent, TokenUsage};

/// hooktrace version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
