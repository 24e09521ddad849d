// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Handles loading configuration from JSON and YAML files in various locations.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::WorkspaceConfig;

/// Config file names to search for (in order).
pub const CONFIG_FILES: &[&str] = &[".hooktrace.json", ".hooktrace/config.json", ".hooktrace.yaml"];

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".hooktrace";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Load global configuration from ~/.hooktrace/config.json.
pub fn load_global_config() -> Result<Option<WorkspaceConfig>, ConfigError> {
    let path = match get_global_config_path() {
        Some(p) => p,
        None => return Ok(None),
    };

    if !path.exists() {
        return Ok(None);
    }

    load_config_file(&path).map(Some)
}

/// Load workspace configuration from the working directory.
///
/// Searches for config files in the following order:
/// 1. .hooktrace.json
/// 2. .hooktrace/config.json
/// 3. .hooktrace.yaml
pub fn load_workspace_config(workspace_root: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    for filename in CONFIG_FILES {
        let path = workspace_root.join(filename);
        if path.exists() {
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

/// Load a configuration file (JSON or YAML).
pub fn load_config_file(path: &Path) -> Result<WorkspaceConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match extension.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(ConfigError::from),
        _ => serde_json::from_str(&content).map_err(ConfigError::from),
    }
}

/// Get an example configuration.
pub fn get_example_config() -> WorkspaceConfig {
    WorkspaceConfig {
        session_ttl_secs: Some(86_400),
        pending_ttl_secs: Some(300),
        subtask_operations: Some(vec!["Task".to_string(), "Agent".to_string()]),
        log_level: Some("info".to_string()),
        export: Some(super::types::ExportFileConfig {
            kind: Some(crate::observe::ExportKind::Jsonl),
            path: Some(PathBuf::from("spans.jsonl")),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_files_order() {
        assert_eq!(CONFIG_FILES.len(), 3);
        assert_eq!(CONFIG_FILES[0], ".hooktrace.json");
    }

    #[test]
    fn test_global_config_dir() {
        let dir = get_global_config_dir();
        assert!(dir.is_some());
        assert!(dir.unwrap().ends_with(".hooktrace"));
    }

    #[test]
    fn test_load_workspace_config_not_found() {
        let temp = TempDir::new().unwrap();
        let result = load_workspace_config(temp.path());
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_load_workspace_config_json() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".hooktrace.json"),
            r#"{"serviceName": "agent-traces", "pendingTtlSecs": 60}"#,
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.service_name, Some("agent-traces".to_string()));
        assert_eq!(config.pending_ttl_secs, Some(60));
    }

    #[test]
    fn test_load_workspace_config_nested_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join(".hooktrace")).unwrap();
        std::fs::write(
            temp.path().join(".hooktrace").join("config.json"),
            r#"{"logLevel": "debug"}"#,
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_load_workspace_config_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".hooktrace.yaml"),
            "serviceName: yaml-traces\nexport:\n  kind: http\n  endpoint: http://localhost:4318/v1/spans\n",
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.service_name, Some("yaml-traces".to_string()));
        let export = config.export.unwrap();
        assert_eq!(export.kind, Some(crate::observe::ExportKind::Http));
    }

    #[test]
    fn test_load_invalid_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".hooktrace.json");
        std::fs::write(&path, "{ nope").unwrap();

        let result = load_config_file(&path);
        assert!(matches!(result, Err(ConfigError::JsonError(_))));
    }

    #[test]
    fn test_example_config_serializes() {
        let json = serde_json::to_string(&get_example_config()).unwrap();
        assert!(json.contains("subtaskOperations"));
    }
}
