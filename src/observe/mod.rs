// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Observation factory and export path.
//!
//! This module turns lifecycle moments into spans:
//!
//! - [`Observer`] opens sessions and operations and finalizes them into
//!   [`FinishedSpan`]s
//! - [`resolve_parent`] links a span to its parent through an in-process
//!   handle, a persisted token, or not at all
//! - [`SpanExporter`] implementations deliver finished spans
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hooktrace::observe::{MemoryExporter, Observer};
//!
//! let observer = Observer::new(Arc::new(MemoryExporter::new()), "hooktrace");
//! let session = observer.open_session("s1", Some("/work"), chrono::Utc::now(), None);
//! ```

mod export;
mod factory;
mod parent;
mod span;

pub use export::{
    build_exporter, ExportKind, ExporterConfig, HttpExporter, JsonlExporter, MemoryExporter,
    NoopExporter, SharedExporter, SpanExporter, DEFAULT_EXPORT_TIMEOUT,
};
#[cfg(test)]
pub use export::MockSpanExporter;
pub use factory::{
    Observer, OperationResult, OperationStart, PointEvent, SessionHandle, SessionOrigin,
    SESSION_SPAN_NAME,
};
pub use parent::{resolve_parent, ParentSource, ResolvedParent, SpanContext};
pub use span::{FinishedSpan, Outcome, SpanKind};
