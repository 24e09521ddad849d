// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for hooktrace.
//!
//! This module provides strongly-typed errors for each boundary of the tracer,
//! using `thiserror` for ergonomic error definitions and `anyhow` for error propagation
//! in the binary. None of these errors is allowed to stop event processing: the router
//! converts every storage and export failure into a degraded-but-recorded outcome.

use thiserror::Error;

/// Errors produced while decoding identifiers and propagation tokens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Unsupported token version: {0}")]
    UnsupportedVersion(String),

    #[error("Invalid trace id: {0}")]
    InvalidTraceId(String),

    #[error("Invalid span id: {0}")]
    InvalidSpanId(String),

    #[error("Invalid trace flags: {0}")]
    InvalidFlags(String),
}

/// Errors that can occur in the durable span-state store and pending-parent registry.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open store at {path}: {message}")]
    Open { path: String, message: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupted record for {key}: {message}")]
    Corrupted { key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl StoreError {
    /// Create a corrupted-record error.
    pub fn corrupted(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupted {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Check if this error means the stored bytes are unusable (as opposed to unreachable).
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

/// Errors that can occur while handing finished spans to the export backend.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend rejected spans with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Exporter not configured: {0}")]
    NotConfigured(String),
}

impl ExportError {
    /// Check if a later flush may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised at the input boundary for a single event record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Unparseable event: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Empty required field: {0}")]
    EmptyField(&'static str),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
