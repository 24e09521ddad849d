// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! hooktrace main entry point - event ingestion and maintenance commands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

use hooktrace::config::{self, CliOptions, ResolvedConfig};
use hooktrace::observe::{build_exporter, ExportKind, NoopExporter, Observer, SharedExporter};
use hooktrace::router::{EventRouter, RouteOutcome};
use hooktrace::store::{PendingRegistry, SpanStore, PENDING_DB_FILE, SESSIONS_DB_FILE};
use hooktrace::telemetry::{init_telemetry, TelemetryConfig};

/// hooktrace version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// hooktrace - rebuild traces from stateless hook invocations.
#[derive(Parser)]
#[command(name = "hooktrace")]
#[command(author, version, about = "Rebuild distributed traces from stateless hook events", long_about = None)]
struct Cli {
    /// Directory holding the session store and pending-parent registry
    #[arg(long, env = "HOOKTRACE_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Age in seconds after which session records are swept
    #[arg(long, env = "HOOKTRACE_SESSION_TTL_SECS", global = true)]
    session_ttl_secs: Option<u64>,

    /// Validity window in seconds of pending-parent entries
    #[arg(long, env = "HOOKTRACE_PENDING_TTL_SECS", global = true)]
    pending_ttl_secs: Option<u64>,

    /// How long to wait on a locked database, in milliseconds
    #[arg(long, env = "HOOKTRACE_STORE_TIMEOUT_MS", global = true)]
    store_timeout_ms: Option<u64>,

    /// Bound on the final export flush, in milliseconds
    #[arg(long, env = "HOOKTRACE_FLUSH_TIMEOUT_MS", global = true)]
    flush_timeout_ms: Option<u64>,

    /// Service name attached to exported spans
    #[arg(long, env = "HOOKTRACE_SERVICE_NAME", global = true)]
    service_name: Option<String>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "HOOKTRACE_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Where finished spans go
    #[arg(long, value_enum, env = "HOOKTRACE_EXPORT", global = true)]
    export: Option<ExportArg>,

    /// Output file for jsonl export
    #[arg(long, env = "HOOKTRACE_EXPORT_PATH", global = true)]
    export_path: Option<PathBuf>,

    /// Collector URL for http export
    #[arg(long, env = "HOOKTRACE_EXPORT_ENDPOINT", global = true)]
    export_endpoint: Option<String>,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Export backends selectable on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportArg {
    /// Discard spans
    None,
    /// Append spans to a JSON lines file
    Jsonl,
    /// Post spans to an HTTP collector
    Http,
}

impl From<ExportArg> for ExportKind {
    fn from(arg: ExportArg) -> Self {
        match arg {
            ExportArg::None => ExportKind::None,
            ExportArg::Jsonl => ExportKind::Jsonl,
            ExportArg::Http => ExportKind::Http,
        }
    }
}

/// Subcommands for hooktrace.
#[derive(Subcommand)]
enum Commands {
    /// Read events from stdin, one JSON object per line (default)
    Ingest,

    /// Run both expiry sweeps now
    Sweep,

    /// Print the durable record of a session, or list stored sessions
    Inspect {
        /// Session id to look up; omit to list every stored session
        session_id: Option<String>,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Show version information
    Version,
}

/// Config subcommand actions.
#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Print an example config file
    Example,
}

impl Cli {
    fn cli_options(&self) -> CliOptions {
        CliOptions {
            state_dir: self.state_dir.clone(),
            session_ttl_secs: self.session_ttl_secs,
            pending_ttl_secs: self.pending_ttl_secs,
            store_timeout_ms: self.store_timeout_ms,
            flush_timeout_ms: self.flush_timeout_ms,
            service_name: self.service_name.clone(),
            log_level: self.log_level.clone(),
            export_kind: self.export.map(ExportKind::from),
            export_path: self.export_path.clone(),
            export_endpoint: self.export_endpoint.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cli_options = cli.cli_options();

    let workspace_root = std::env::current_dir()?;
    let loaded = config::load_config(&workspace_root, cli_options.clone());
    let log_level = match &loaded {
        Ok(config) => config.log_level.clone(),
        Err(_) => cli_options.log_level.clone().unwrap_or_else(|| "warn".to_string()),
    };

    let telemetry = if cli.debug {
        TelemetryConfig::development().with_ansi(false)
    } else {
        TelemetryConfig::default().with_level_name(&log_level)
    };
    // Ignore an already-installed subscriber
    let _guard = init_telemetry(&telemetry).ok();

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "Config load failed; using defaults");
            config::merge_config(None, None, cli_options)
        }
    };

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => ingest(&config).await,
        Commands::Sweep => sweep(&config),
        Commands::Inspect { session_id } => inspect(&config, session_id.as_deref()),
        Commands::Config { action } => {
            match action {
                Some(ConfigAction::Show) | None => {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                }
                Some(ConfigAction::Example) => {
                    println!("{}", serde_json::to_string_pretty(&config::get_example_config())?);
                }
            }
            Ok(())
        }
        Commands::Version => {
            println!("hooktrace {}", VERSION);
            Ok(())
        }
    }
}

/// Route every stdin line in arrival order, then flush exports.
async fn ingest(config: &ResolvedConfig) -> anyhow::Result<()> {
    let exporter: SharedExporter = match build_exporter(&config.exporter_config()) {
        Ok(exporter) => exporter,
        Err(e) => {
            tracing::warn!(error = %e, "Exporter unavailable; spans will be discarded");
            Arc::new(NoopExporter)
        }
    };
    let observer = Observer::new(exporter, config.service_name.clone());
    let mut router = EventRouter::open(
        &config.state_dir,
        config.store_timeout(),
        observer,
        config.router_config(),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut handled = 0usize;
    let mut dropped = 0usize;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Stopped reading input");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match router.handle_line(&line).await {
            RouteOutcome::Dropped => dropped += 1,
            _ => handled += 1,
        }
    }

    router.shutdown(config.flush_timeout()).await;
    tracing::debug!(handled, dropped, "Ingest finished");
    Ok(())
}

/// Run both expiry sweeps on demand.
fn sweep(config: &ResolvedConfig) -> anyhow::Result<()> {
    let store = SpanStore::open_at(&config.state_dir.join(SESSIONS_DB_FILE), config.store_timeout())?;
    let pending =
        PendingRegistry::open_at(&config.state_dir.join(PENDING_DB_FILE), config.store_timeout())?;

    let sessions = store.sweep_expired(config.router_config().session_ttl)?;
    let entries = pending.sweep_expired(config.router_config().pending_ttl)?;

    println!("{}", "Sweep complete".bright_blue().bold());
    println!("  sessions removed:        {}", sessions.to_string().green());
    println!("  pending parents removed: {}", entries.to_string().green());
    Ok(())
}

/// Print one session's durable record as JSON.
fn inspect(config: &ResolvedConfig, session_id: Option<&str>) -> anyhow::Result<()> {
    let store = SpanStore::open_at(&config.state_dir.join(SESSIONS_DB_FILE), config.store_timeout())?;

    let Some(session_id) = session_id else {
        let sessions = store.list_sessions()?;
        if sessions.is_empty() {
            eprintln!("{}", "No open sessions".dimmed());
        }
        for session_id in sessions {
            println!("{}", session_id);
        }
        return Ok(());
    };

    let Some(record) = store.load(session_id)? else {
        eprintln!("{}", format!("No open session '{}'", session_id).red());
        return Ok(());
    };

    let summary = record.metrics.compute_aggregate().format_line();
    let view = json!({
        "sessionId": record.session_id,
        "traceId": record.trace_id,
        "rootSpanId": record.root_span_id,
        "token": record.token,
        "parent": record.parent,
        "cwd": record.cwd,
        "createdAt": record.created_at,
        "updatedAt": record.updated_at,
        "openSpans": record.open_spans,
        "metrics": record.metrics,
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    eprintln!("{} {}", "summary:".bright_blue(), summary);
    Ok(())
}
