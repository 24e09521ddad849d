// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::PathBuf;

use crate::observe::ExportKind;

use super::types::{ExportFileConfig, ResolvedConfig, ResolvedExportConfig, WorkspaceConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub state_dir: Option<PathBuf>,
    pub session_ttl_secs: Option<u64>,
    pub pending_ttl_secs: Option<u64>,
    pub store_timeout_ms: Option<u64>,
    pub flush_timeout_ms: Option<u64>,
    pub service_name: Option<String>,
    pub log_level: Option<String>,
    pub export_kind: Option<ExportKind>,
    pub export_path: Option<PathBuf>,
    pub export_endpoint: Option<String>,
}

/// Default configuration values.
pub fn default_config() -> ResolvedConfig {
    ResolvedConfig::default()
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options (and their HOOKTRACE_* environment fallbacks)
/// 2. Workspace config (.hooktrace.json)
/// 3. Global config (~/.hooktrace/config.json)
/// 4. Default values
pub fn merge_config(
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> ResolvedConfig {
    let mut result = default_config();

    if let Some(config) = global {
        apply_workspace_config(&mut result, &config);
    }

    if let Some(config) = workspace {
        apply_workspace_config(&mut result, &config);
    }

    apply_cli_options(&mut result, &cli);

    result
}

fn apply_workspace_config(result: &mut ResolvedConfig, config: &WorkspaceConfig) {
    if let Some(ref state_dir) = config.state_dir {
        result.state_dir = state_dir.clone();
    }

    if let Some(ttl) = config.session_ttl_secs {
        result.session_ttl_secs = ttl;
    }

    if let Some(ttl) = config.pending_ttl_secs {
        result.pending_ttl_secs = ttl;
    }

    if let Some(timeout) = config.store_timeout_ms {
        result.store_timeout_ms = timeout;
    }

    if let Some(timeout) = config.flush_timeout_ms {
        result.flush_timeout_ms = timeout;
    }

    if let Some(ref name) = config.service_name {
        result.service_name = name.clone();
    }

    // A later layer replaces the list rather than extending it
    if let Some(ref operations) = config.subtask_operations {
        result.subtask_operations = operations.clone();
    }

    if let Some(ref field) = config.subtask_type_field {
        result.subtask_type_field = field.clone();
    }

    if let Some(ref level) = config.log_level {
        result.log_level = level.clone();
    }

    if let Some(ref export) = config.export {
        apply_export_config(&mut result.export, export);
    }
}

fn apply_export_config(result: &mut ResolvedExportConfig, config: &ExportFileConfig) {
    if let Some(kind) = config.kind {
        result.kind = kind;
    }

    if config.path.is_some() {
        result.path = config.path.clone();
    }

    if config.endpoint.is_some() {
        result.endpoint = config.endpoint.clone();
    }

    if let Some(ref headers) = config.headers {
        result
            .headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    if let Some(timeout) = config.timeout_ms {
        result.timeout_ms = timeout;
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) {
    if let Some(ref state_dir) = cli.state_dir {
        result.state_dir = state_dir.clone();
    }

    if let Some(ttl) = cli.session_ttl_secs {
        result.session_ttl_secs = ttl;
    }

    if let Some(ttl) = cli.pending_ttl_secs {
        result.pending_ttl_secs = ttl;
    }

    if let Some(timeout) = cli.store_timeout_ms {
        result.store_timeout_ms = timeout;
    }

    if let Some(timeout) = cli.flush_timeout_ms {
        result.flush_timeout_ms = timeout;
    }

    if let Some(ref name) = cli.service_name {
        result.service_name = name.clone();
    }

    if let Some(ref level) = cli.log_level {
        result.log_level = level.clone();
    }

    if let Some(kind) = cli.export_kind {
        result.export.kind = kind;
    }

    if cli.export_path.is_some() {
        result.export.path = cli.export_path.clone();
    }

    if cli.export_endpoint.is_some() {
        result.export.endpoint = cli.export_endpoint.clone();
    }
}
