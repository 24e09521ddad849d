// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Export backends for finished spans.
//!
//! Spans are exported eagerly, one call per finalize. A failed export never
//! reaches the caller of the factory; [`SpanExporter::flush`] gives each
//! backend one bounded chance to deliver what it is still holding before the
//! process exits.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::ExportError;

use super::span::FinishedSpan;

/// Default per-request timeout of the HTTP exporter.
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Destination of finished spans.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpanExporter: Send + Sync {
    /// Hand one span to the backend.
    async fn export(&self, span: &FinishedSpan) -> Result<(), ExportError>;

    /// Deliver anything still buffered, waiting at most `timeout`.
    async fn flush(&self, timeout: Duration) -> Result<(), ExportError>;
}

/// Shared exporter handle.
pub type SharedExporter = Arc<dyn SpanExporter>;

/// Which backend receives spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    #[default]
    None,
    Jsonl,
    Http,
}

/// Resolved exporter settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ExporterConfig {
    pub kind: ExportKind,
    /// Output file for [`ExportKind::Jsonl`].
    pub path: Option<PathBuf>,
    /// Collector URL for [`ExportKind::Http`].
    pub endpoint: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
    pub service_name: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            kind: ExportKind::None,
            path: None,
            endpoint: None,
            headers: BTreeMap::new(),
            timeout: DEFAULT_EXPORT_TIMEOUT,
            service_name: "hooktrace".to_string(),
        }
    }
}

/// Build the exporter described by `config`.
pub fn build_exporter(config: &ExporterConfig) -> Result<SharedExporter, ExportError> {
    match config.kind {
        ExportKind::None => Ok(Arc::new(NoopExporter)),
        ExportKind::Jsonl => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| ExportError::NotConfigured("jsonl export needs a path".to_string()))?;
            Ok(Arc::new(JsonlExporter::new(path)))
        }
        ExportKind::Http => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                ExportError::NotConfigured("http export needs an endpoint".to_string())
            })?;
            let exporter = HttpExporter::new(
                endpoint,
                config.headers.clone(),
                config.timeout,
                config.service_name.clone(),
            )?;
            Ok(Arc::new(exporter))
        }
    }
}

// ============================================================================
// No-op
// ============================================================================

/// Discards every span.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExporter;

#[async_trait]
impl SpanExporter for NoopExporter {
    async fn export(&self, _span: &FinishedSpan) -> Result<(), ExportError> {
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), ExportError> {
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Keeps spans in memory. Used in tests and by `inspect`-style tooling.
#[derive(Debug, Default)]
pub struct MemoryExporter {
    spans: std::sync::Mutex<Vec<FinishedSpan>>,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every span exported so far.
    pub fn spans(&self) -> Vec<FinishedSpan> {
        match self.spans.lock() {
            Ok(spans) => spans.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Spans with the given name.
    pub fn named(&self, name: &str) -> Vec<FinishedSpan> {
        self.spans().into_iter().filter(|s| s.name == name).collect()
    }
}

#[async_trait]
impl SpanExporter for MemoryExporter {
    async fn export(&self, span: &FinishedSpan) -> Result<(), ExportError> {
        match self.spans.lock() {
            Ok(mut spans) => spans.push(span.clone()),
            Err(poisoned) => poisoned.into_inner().push(span.clone()),
        }
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), ExportError> {
        Ok(())
    }
}

// ============================================================================
// JSON lines file
// ============================================================================

/// Appends one JSON object per span to a file.
#[derive(Debug, Clone)]
pub struct JsonlExporter {
    path: PathBuf,
}

impl JsonlExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl SpanExporter for JsonlExporter {
    async fn export(&self, span: &FinishedSpan) -> Result<(), ExportError> {
        let mut line = serde_json::to_string(span)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // One write per line keeps concurrent appenders from interleaving
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), ExportError> {
        Ok(())
    }
}

// ============================================================================
// HTTP collector
// ============================================================================

/// Posts spans to an HTTP collector as JSON.
///
/// Each span is sent as soon as it is finalized. Spans whose request fails
/// with a retryable error are buffered and sent again in one batch by
/// [`flush`](SpanExporter::flush).
pub struct HttpExporter {
    client: Client,
    endpoint: String,
    headers: BTreeMap<String, String>,
    service_name: String,
    timeout_ms: u64,
    retry: Mutex<Vec<FinishedSpan>>,
}

impl HttpExporter {
    /// Create a new HTTP exporter.
    pub fn new(
        endpoint: impl Into<String>,
        headers: BTreeMap<String, String>,
        timeout: Duration,
        service_name: impl Into<String>,
    ) -> Result<Self, ExportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExportError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            headers,
            service_name: service_name.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            retry: Mutex::new(Vec::new()),
        })
    }

    /// Number of spans waiting for the next flush.
    pub async fn buffered(&self) -> usize {
        self.retry.lock().await.len()
    }

    fn build_body(&self, spans: &[FinishedSpan]) -> serde_json::Value {
        json!({
            "resource": { "service.name": self.service_name },
            "spans": spans,
        })
    }

    async fn send(&self, spans: &[FinishedSpan]) -> Result<(), ExportError> {
        let mut request = self.client.post(&self.endpoint).json(&self.build_body(spans));
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExportError::Timeout(self.timeout_ms)
            } else {
                ExportError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        Err(ExportError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl SpanExporter for HttpExporter {
    async fn export(&self, span: &FinishedSpan) -> Result<(), ExportError> {
        match self.send(std::slice::from_ref(span)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_retryable() {
                    self.retry.lock().await.push(span.clone());
                }
                Err(e)
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), ExportError> {
        let pending = std::mem::take(&mut *self.retry.lock().await);
        if pending.is_empty() {
            return Ok(());
        }

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        match tokio::time::timeout(timeout, self.send(&pending)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(dropped = pending.len(), error = %e, "Final span flush failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(dropped = pending.len(), timeout_ms, "Final span flush timed out");
                Err(ExportError::Timeout(timeout_ms))
            }
        }
    }
}
