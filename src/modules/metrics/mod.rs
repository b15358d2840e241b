//! Metrics collection utilities.
//!
//! Keeps the most recent fetch results in a bounded ring buffer and derives
//! rates, latency percentiles and error rankings on demand for a chosen
//! recency window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// A single recorded fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsEntry {
    pub timestamp: DateTime<Utc>,
    pub latency: Duration,
    pub success: bool,
    pub cached: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub window_minutes: u64,
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub cache_hits: usize,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    pub average_latency_ms: u64,
    pub latency: LatencyPercentiles,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub error: String,
    pub count: usize,
}

#[derive(Debug)]
struct MetricsState {
    capacity: usize,
    entries: VecDeque<MetricsEntry>,
}

impl MetricsState {
    fn push(&mut self, entry: MetricsEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

/// Thread-safe, bounded metrics sink shared by the orchestrator and
/// read-only observers.
#[derive(Clone, Debug)]
pub struct MetricsSink {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::with_capacity(MetricsConfig::default().capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                capacity,
                entries: VecDeque::with_capacity(capacity.min(4096)),
            })),
        }
    }

    pub fn record(&self, latency: Duration, success: bool, cached: bool, error: Option<&str>) {
        self.record_entry(MetricsEntry {
            timestamp: Utc::now(),
            latency,
            success,
            cached,
            error: error.map(str::to_string),
        });
    }

    pub fn record_entry(&self, entry: MetricsEntry) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.push(entry);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("metrics lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the buffered entries, oldest first.
    pub fn entries(&self) -> Vec<MetricsEntry> {
        let guard = self.inner.lock().expect("metrics lock poisoned");
        guard.entries.iter().cloned().collect()
    }

    /// Aggregates over entries newer than `window_minutes`. A window too
    /// large to represent as a timestamp covers the whole buffer.
    pub fn summary(&self, window_minutes: u64) -> MetricsSummary {
        let cutoff = i64::try_from(window_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .and_then(|window| Utc::now().checked_sub_signed(window));
        let guard = self.inner.lock().expect("metrics lock poisoned");
        let window: Vec<&MetricsEntry> = guard
            .entries
            .iter()
            .filter(|entry| cutoff.is_none_or(|cutoff| entry.timestamp >= cutoff))
            .collect();

        let total = window.len();
        if total == 0 {
            return MetricsSummary {
                window_minutes,
                ..MetricsSummary::default()
            };
        }

        let successes = window.iter().filter(|entry| entry.success).count();
        let cache_hits = window.iter().filter(|entry| entry.cached).count();

        let mut latencies: Vec<u64> = window
            .iter()
            .map(|entry| entry.latency.as_millis().min(u128::from(u64::MAX)) as u64)
            .collect();
        latencies.sort_unstable();
        let average_latency_ms = latencies.iter().sum::<u64>() / total as u64;

        MetricsSummary {
            window_minutes,
            total,
            successes,
            failures: total - successes,
            cache_hits,
            success_rate: successes as f64 / total as f64,
            cache_hit_rate: cache_hits as f64 / total as f64,
            average_latency_ms,
            latency: LatencyPercentiles {
                p50_ms: percentile(&latencies, 0.50),
                p95_ms: percentile(&latencies, 0.95),
                p99_ms: percentile(&latencies, 0.99),
            },
        }
    }

    /// Most frequent error tags across the whole buffer.
    pub fn top_errors(&self, limit: usize) -> Vec<ErrorCount> {
        let guard = self.inner.lock().expect("metrics lock poisoned");
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for error in guard.entries.iter().filter_map(|entry| entry.error.as_deref()) {
            *counts.entry(error).or_default() += 1;
        }

        let mut ranked: Vec<ErrorCount> = counts
            .into_iter()
            .map(|(error, count)| ErrorCount {
                error: error.to_string(),
                count,
            })
            .collect();
        ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error.cmp(&b.error)));
        ranked.truncate(limit);
        ranked
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[u64], quantile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64 * quantile).ceil() as usize).saturating_sub(1);
    sorted[rank.min(sorted.len() - 1)]
}
