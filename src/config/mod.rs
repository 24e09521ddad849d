// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for hooktrace.
//!
//! Handles loading and merging of configuration from multiple sources:
//! - Global config: ~/.hooktrace/config.json
//! - Workspace config: .hooktrace.json, .hooktrace/config.json, or .hooktrace.yaml
//! - CLI options: command-line arguments and HOOKTRACE_* environment variables
//!
//! Configuration is merged with precedence (CLI > workspace > global > defaults).

mod loader;
mod merger;
mod types;

// Re-export public types
pub use loader::{
    get_example_config, get_global_config_dir, get_global_config_path, load_config_file,
    load_global_config, load_workspace_config, CONFIG_FILES, GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE,
};

pub use merger::{default_config, merge_config, CliOptions};

pub use types::{ExportFileConfig, ResolvedConfig, ResolvedExportConfig, WorkspaceConfig};

use crate::error::ConfigError;
use std::path::Path;

/// Load and merge all configuration sources for a working directory.
///
/// This is the main entry point for configuration loading.
pub fn load_config(
    workspace_root: &Path,
    cli_options: CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(workspace_root)?;

    Ok(merge_config(global, workspace, cli_options))
}

/// Like [`load_config`], but a broken config file falls back to defaults
/// plus CLI options instead of failing.
pub fn load_config_or_default(workspace_root: &Path, cli_options: CliOptions) -> ResolvedConfig {
    match load_config(workspace_root, cli_options.clone()) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "Config load failed; using defaults");
            merge_config(None, None, cli_options)
        }
    }
}
