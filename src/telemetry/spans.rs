// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Timing guard for the tracer's own storage calls.

use std::time::{Duration, Instant};

use tracing::{debug_span, Span};

/// RAII guard for timing one internal operation.
///
/// Logs the operation name and elapsed time at debug level when finished or dropped.
pub struct TimedOperation {
    name: &'static str,
    start: Instant,
    span: Span,
    finished: bool,
}

impl TimedOperation {
    /// Start a new timed operation.
    pub fn start(name: &'static str) -> Self {
        let span = debug_span!(
            "hooktrace.op",
            op = name,
            duration_ms = tracing::field::Empty,
        );

        Self {
            name,
            start: Instant::now(),
            span,
            finished: false,
        }
    }

    /// Get elapsed time so far.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get the operation name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Finish and log the operation.
    pub fn finish(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let duration_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.span.record("duration_ms", duration_ms);
        tracing::debug!(parent: &self.span, op = self.name, duration_ms, "timed");
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        // Early returns through `?` still get logged
        self.record();
    }
}

/// Time a block of storage work when the `telemetry` feature is enabled.
///
/// # Example
///
/// ```rust,ignore
/// let _timer = timed!("store.load");
/// ```
#[macro_export]
macro_rules! timed {
    ($name:expr) => {{
        #[cfg(feature = "telemetry")]
        let timer = Some($crate::telemetry::TimedOperation::start($name));
        #[cfg(not(feature = "telemetry"))]
        let timer: Option<()> = None;
        timer
    }};
}
