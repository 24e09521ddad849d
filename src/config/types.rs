// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Defines the structure of file and resolved configuration,
//! supporting JSON and YAML formats.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::observe::{ExportKind, ExporterConfig};
use crate::router::RouterConfig;
use crate::store::{default_state_dir, DEFAULT_BUSY_TIMEOUT, DEFAULT_PENDING_TTL, DEFAULT_SESSION_TTL};

/// Configuration as written in a config file.
/// Can be defined in .hooktrace.json, .hooktrace/config.json or .hooktrace.yaml.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Directory holding the session store and pending-parent registry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Age in seconds after which session records are swept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_ttl_secs: Option<u64>,

    /// Validity window in seconds of pending-parent entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_ttl_secs: Option<u64>,

    /// How long a writer waits on a locked database
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_timeout_ms: Option<u64>,

    /// Bound on the final export flush
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush_timeout_ms: Option<u64>,

    /// Service name attached to exported spans
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Operation names that launch a nested sub-task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask_operations: Option<Vec<String>>,

    /// Input-payload key holding the sub-task type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask_type_field: Option<String>,

    /// Default log level when RUST_LOG is unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Span export settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportFileConfig>,
}

/// Export section of a config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ExportKind>,

    /// Output file for jsonl export
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Collector URL for http export
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Extra request headers for http export
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Fully resolved configuration with defaults applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub state_dir: PathBuf,
    pub session_ttl_secs: u64,
    pub pending_ttl_secs: u64,
    pub store_timeout_ms: u64,
    pub flush_timeout_ms: u64,
    pub service_name: String,
    pub subtask_operations: Vec<String>,
    pub subtask_type_field: String,
    pub log_level: String,
    pub export: ResolvedExportConfig,
}

/// Resolved export settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedExportConfig {
    pub kind: ExportKind,
    pub path: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
}

impl Default for ResolvedExportConfig {
    fn default() -> Self {
        Self {
            kind: ExportKind::None,
            path: None,
            endpoint: None,
            headers: BTreeMap::new(),
            timeout_ms: 2000,
        }
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        let router = RouterConfig::default();
        Self {
            state_dir: default_state_dir(),
            session_ttl_secs: DEFAULT_SESSION_TTL.as_secs(),
            pending_ttl_secs: DEFAULT_PENDING_TTL.as_secs(),
            store_timeout_ms: duration_ms(DEFAULT_BUSY_TIMEOUT),
            flush_timeout_ms: 5000,
            service_name: "hooktrace".to_string(),
            subtask_operations: router.subtask_operations,
            subtask_type_field: router.subtask_type_field,
            log_level: "warn".to_string(),
            export: ResolvedExportConfig::default(),
        }
    }
}

impl ResolvedConfig {
    /// Router settings derived from this configuration.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            pending_ttl: Duration::from_secs(self.pending_ttl_secs),
            subtask_operations: self.subtask_operations.clone(),
            subtask_type_field: self.subtask_type_field.clone(),
        }
    }

    /// Exporter settings derived from this configuration.
    pub fn exporter_config(&self) -> ExporterConfig {
        ExporterConfig {
            kind: self.export.kind,
            path: self.export.path.clone(),
            endpoint: self.export.endpoint.clone(),
            headers: self.export.headers.clone(),
            timeout: Duration::from_millis(self.export.timeout_ms),
            service_name: self.service_name.clone(),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
