// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process logging and self-timing for hooktrace.
//!
//! This is the tracer's *own* observability, distinct from the traces it
//! reconstructs:
//!
//! - **Logging**: structured `tracing` output on stderr (stdout belongs to the hook caller)
//! - **Self-timing**: [`TimedOperation`] guards around storage calls, logged at debug level
//!
//! # Usage
//!
//! Initialize logging at process startup:
//!
//! ```rust,ignore
//! use hooktrace::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! # Integration Guidelines
//!
//! 1. **Add `#[instrument]` to router handlers**
//! 2. **Record ids, not payloads** (session ids, operation ids, span ids)
//! 3. **Log every degradation at warn** (storage or export failure, orphaned spans)

mod init;
mod spans;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use spans::TimedOperation;
