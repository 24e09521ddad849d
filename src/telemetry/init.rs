// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber setup for the tracer's own log output.
//!
//! Hook callers may read stdout, so every log line goes to stderr. A hook
//! invocation runs quiet (`warn`, compact); `--debug` switches to verbose
//! output with source locations and span timings.

use std::io;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// How the process logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Level used when RUST_LOG is unset.
    pub default_level: Level,

    /// Source locations, span close timings and the multi-line format.
    pub verbose: bool,

    pub ansi_colors: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::WARN,
            verbose: false,
            ansi_colors: false,
        }
    }
}

impl TelemetryConfig {
    /// Verbose debug output for running by hand.
    pub fn development() -> Self {
        Self {
            default_level: Level::DEBUG,
            verbose: true,
            ansi_colors: true,
        }
    }

    /// Set the default log level from a name like `"debug"`; unknown names are ignored.
    pub fn with_level_name(mut self, name: &str) -> Self {
        if let Ok(level) = name.parse::<Level>() {
            self.default_level = level;
        }
        self
    }

    /// Enable or disable ANSI colors.
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }

    /// Filter used when RUST_LOG does not parse or is unset.
    fn fallback_filter(&self) -> EnvFilter {
        EnvFilter::new(self.default_level.to_string())
    }
}

/// Guard returned by [`init_telemetry`]. Keep it alive for the whole process.
pub struct TelemetryGuard {
    _private: (),
}

/// Install the global subscriber. RUST_LOG wins over the configured level.
///
/// Fails if a subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| config.fallback_filter());

    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi_colors)
        .with_file(config.verbose)
        .with_line_number(config.verbose);

    let installed = if config.verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.with_span_events(FmtSpan::CLOSE))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.compact())
            .try_init()
    };
    installed.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    Ok(TelemetryGuard { _private: () })
}
