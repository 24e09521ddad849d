// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-session execution metrics.
//!
//! [`SessionMetrics`] is a plain, serializable accumulator: every finalized
//! operation adds one [`OperationSample`], in whichever invocation observed it.
//! The running totals live inside the session's durable record between
//! invocations and are turned into a [`SessionSummary`] once, at session end.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::TokenUsage;

/// One finalized operation, as seen by the aggregator.
#[derive(Debug, Clone, Copy)]
pub struct OperationSample<'a> {
    pub name: &'a str,
    pub is_subtask: bool,
    pub success: bool,
    pub failure_category: Option<&'a str>,
    pub duration: Duration,
    pub usage: Option<&'a TokenUsage>,
    pub model: Option<&'a str>,
}

/// Running totals for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetrics {
    pub operation_count: u64,
    pub subtask_count: u64,
    pub failure_count: u64,
    pub failures_by_category: BTreeMap<String, u64>,
    pub operations_by_name: BTreeMap<String, u64>,
    pub invocations_by_model: BTreeMap<String, u64>,
    pub total_duration_ms: u64,
    /// Per-operation durations, kept for distribution statistics at session end.
    pub durations_ms: Vec<u64>,
    pub tokens: TokenUsage,
    pub tokens_by_name: BTreeMap<String, TokenUsage>,
    pub turn_count: u64,
    pub compaction_count: u64,
}

impl SessionMetrics {
    /// Create empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finalized operation.
    pub fn record(&mut self, sample: &OperationSample<'_>) {
        self.operation_count += 1;
        if sample.is_subtask {
            self.subtask_count += 1;
        }
        if !sample.success {
            self.failure_count += 1;
            let category = sample.failure_category.unwrap_or("unknown");
            *self
                .failures_by_category
                .entry(category.to_string())
                .or_insert(0) += 1;
        }

        *self
            .operations_by_name
            .entry(sample.name.to_string())
            .or_insert(0) += 1;

        if let Some(model) = sample.model {
            *self
                .invocations_by_model
                .entry(model.to_string())
                .or_insert(0) += 1;
        }

        let millis = duration_millis(sample.duration);
        self.total_duration_ms = self.total_duration_ms.saturating_add(millis);
        self.durations_ms.push(millis);

        if let Some(usage) = sample.usage {
            self.tokens.add(usage);
            self.tokens_by_name
                .entry(sample.name.to_string())
                .or_default()
                .add(usage);
        }
    }

    /// Record a submitted user turn.
    pub fn record_turn(&mut self) {
        self.turn_count += 1;
    }

    /// Record a compaction boundary.
    pub fn record_compaction(&mut self) {
        self.compaction_count += 1;
    }

    /// Derive the session-end summary from the running totals.
    pub fn compute_aggregate(&self) -> SessionSummary {
        let mut sorted = self.durations_ms.clone();
        sorted.sort_unstable();

        let mut histogram = Histogram::default();
        for &millis in &sorted {
            histogram.record(millis);
        }

        let mean_duration_ms = if sorted.is_empty() {
            0.0
        } else {
            self.total_duration_ms as f64 / sorted.len() as f64
        };

        let error_rate = if self.operation_count == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.operation_count as f64
        };

        SessionSummary {
            operation_count: self.operation_count,
            subtask_count: self.subtask_count,
            failure_count: self.failure_count,
            error_rate,
            total_duration_ms: self.total_duration_ms,
            mean_duration_ms,
            min_duration_ms: sorted.first().copied().unwrap_or(0),
            max_duration_ms: sorted.last().copied().unwrap_or(0),
            p50_duration_ms: nearest_rank(&sorted, 50.0),
            p90_duration_ms: nearest_rank(&sorted, 90.0),
            p99_duration_ms: nearest_rank(&sorted, 99.0),
            duration_histogram: histogram,
            failures_by_category: self.failures_by_category.clone(),
            operations_by_name: self.operations_by_name.clone(),
            invocations_by_model: self.invocations_by_model.clone(),
            tokens: self.tokens,
            tokens_by_name: self.tokens_by_name.clone(),
            turn_count: self.turn_count,
            compaction_count: self.compaction_count,
        }
    }
}

/// Aggregate statistics merged into the finalized session span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub operation_count: u64,
    pub subtask_count: u64,
    pub failure_count: u64,
    /// Failures / operations, 0.0 when nothing ran.
    pub error_rate: f64,
    pub total_duration_ms: u64,
    pub mean_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub p50_duration_ms: u64,
    pub p90_duration_ms: u64,
    pub p99_duration_ms: u64,
    pub duration_histogram: Histogram,
    pub failures_by_category: BTreeMap<String, u64>,
    pub operations_by_name: BTreeMap<String, u64>,
    pub invocations_by_model: BTreeMap<String, u64>,
    pub tokens: TokenUsage,
    pub tokens_by_name: BTreeMap<String, TokenUsage>,
    pub turn_count: u64,
    pub compaction_count: u64,
}

impl SessionSummary {
    /// Format as a short human-readable line.
    pub fn format_line(&self) -> String {
        format!(
            "{} ops ({} sub-tasks), {:.1}% failed, mean {:.0}ms, max {}ms, {} tokens",
            self.operation_count,
            self.subtask_count,
            self.error_rate * 100.0,
            self.mean_duration_ms,
            self.max_duration_ms,
            self.tokens.total()
        )
    }
}

/// Simple histogram with fixed buckets for latency tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// Bucket upper bounds in milliseconds.
    /// Default: [10ms, 100ms, 1s, 10s, 1m, 10m, +inf]
    buckets: Vec<u64>,

    /// Count per bucket; the last entry is the overflow bucket.
    counts: Vec<u64>,
}

impl Histogram {
    /// Create a histogram with custom bucket boundaries (in milliseconds).
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = vec![0; buckets.len() + 1];
        Self { buckets, counts }
    }

    /// Record a duration in milliseconds.
    pub fn record(&mut self, millis: u64) {
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| millis <= b)
            .unwrap_or(self.buckets.len());
        self.counts[bucket_idx] += 1;
    }

    /// Get counts for each bucket.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Get bucket boundaries.
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Total number of recorded values.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::with_buckets(vec![10, 100, 1_000, 10_000, 60_000, 600_000])
    }
}

/// Nearest-rank percentile over an ascending slice.
fn nearest_rank(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
