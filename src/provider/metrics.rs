//! Metrics collector (C6, §4.6).
//!
//! Atomic service-wide counters plus per-provider structured metrics,
//! mirroring the teacher's `HealthTracker`/`UsageStats` texture: atomics for
//! cheap aggregates, a lock only around the rolling window and the
//! exponentially-smoothed latency the `response_time` load-balancing
//! strategy reads (§4.5).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::ErrorKind;

/// Size of the rolling (latency, success) window (§3).
const ROLLING_WINDOW_SIZE: usize = 100;

/// Smoothing factor for the exponentially-smoothed average latency used by
/// the `response_time` load-balancing strategy (§4.5).
const LATENCY_EWMA_ALPHA: f64 = 0.1;

/// Per-provider aggregate metrics (§3 ProviderMetrics / ProviderPerformanceMetrics).
pub struct ProviderMetrics {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
    total_latency_ms: AtomicU64,
    min_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
    errors_by_kind: DashMap<&'static str, AtomicU64>,
    window: RwLock<VecDeque<(u64, bool)>>,
    /// `None` until the first sample arrives (§4.5 "unseen provider wins").
    ewma_latency_ms: RwLock<Option<f64>>,
}

impl Default for ProviderMetrics {
    fn default() -> Self {
        Self {
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            min_latency_ms: AtomicU64::new(u64::MAX),
            max_latency_ms: AtomicU64::new(0),
            errors_by_kind: DashMap::new(),
            window: RwLock::new(VecDeque::with_capacity(ROLLING_WINDOW_SIZE)),
            ewma_latency_ms: RwLock::new(None),
        }
    }
}

impl ProviderMetrics {
    /// Record one completed request.
    pub fn record(&self, latency_ms: u64, success: bool, error_kind: Option<ErrorKind>, usage: Option<(u32, u32, u32)>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            if let Some(kind) = error_kind {
                self.errors_by_kind
                    .entry(kind.as_str())
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some((prompt, completion, total)) = usage {
            self.prompt_tokens.fetch_add(u64::from(prompt), Ordering::Relaxed);
            self.completion_tokens.fetch_add(u64::from(completion), Ordering::Relaxed);
            self.total_tokens.fetch_add(u64::from(total), Ordering::Relaxed);
        }

        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.min_latency_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency_ms, Ordering::Relaxed);

        {
            let mut window = self.window.write();
            if window.len() >= ROLLING_WINDOW_SIZE {
                window.pop_front();
            }
            window.push_back((latency_ms, success));
        }

        {
            let mut ewma = self.ewma_latency_ms.write();
            *ewma = Some(match *ewma {
                None => latency_ms as f64,
                Some(prev) => LATENCY_EWMA_ALPHA * latency_ms as f64 + (1.0 - LATENCY_EWMA_ALPHA) * prev,
            });
        }
    }

    /// Exponentially-smoothed average latency, or `None` if unseen — the
    /// `response_time` strategy treats `None` as an automatic winner
    /// (§4.5 "unseen provider wins to bootstrap measurement").
    #[must_use]
    pub fn ewma_latency_ms(&self) -> Option<f64> {
        *self.ewma_latency_ms.read()
    }

    /// Cumulative success rate over all recorded requests.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.requests.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        self.successes.load(Ordering::Relaxed) as f64 / total as f64
    }

    /// Success rate over just the rolling window (§4.5 adaptive strategy
    /// term `recent_window_success_rate`).
    #[must_use]
    pub fn window_success_rate(&self) -> f64 {
        let window = self.window.read();
        if window.is_empty() {
            return 1.0;
        }
        let successes = window.iter().filter(|(_, ok)| *ok).count();
        successes as f64 / window.len() as f64
    }

    /// Cumulative average latency in milliseconds.
    #[must_use]
    pub fn avg_latency_ms(&self) -> f64 {
        let total = self.requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.total_latency_ms.load(Ordering::Relaxed) as f64 / total as f64
    }

    /// Total request count.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Snapshot for external reporting.
    #[must_use]
    pub fn snapshot(&self) -> ProviderMetricsSnapshot {
        ProviderMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            min_latency_ms: match self.min_latency_ms.load(Ordering::Relaxed) {
                u64::MAX => 0,
                v => v,
            },
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency_ms(),
            success_rate: self.success_rate(),
            errors_by_kind: self.errors_by_kind.iter().map(|e| (e.key().to_string(), e.value().load(Ordering::Relaxed))).collect(),
        }
    }
}

/// Reportable snapshot of [`ProviderMetrics`].
#[derive(Debug, Clone)]
pub struct ProviderMetricsSnapshot {
    /// Total requests.
    pub requests: u64,
    /// Total successes.
    pub successes: u64,
    /// Total failures.
    pub failures: u64,
    /// Total tokens (prompt + completion).
    pub total_tokens: u64,
    /// Minimum observed latency.
    pub min_latency_ms: u64,
    /// Maximum observed latency.
    pub max_latency_ms: u64,
    /// Cumulative average latency.
    pub avg_latency_ms: f64,
    /// Cumulative success rate.
    pub success_rate: f64,
    /// Error counts by taxonomy kind (§7).
    pub errors_by_kind: std::collections::HashMap<String, u64>,
}

/// Service-wide metrics collector (C6).
pub struct MetricsCollector {
    started_at: Instant,
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_tokens: AtomicU64,
    per_provider: DashMap<String, std::sync::Arc<ProviderMetrics>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Construct a collector with its uptime clock starting now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            per_provider: DashMap::new(),
        }
    }

    /// Per-provider metrics handle, created on first use.
    #[must_use]
    pub fn provider(&self, name: &str) -> std::sync::Arc<ProviderMetrics> {
        std::sync::Arc::clone(
            self.per_provider
                .entry(name.to_string())
                .or_insert_with(|| std::sync::Arc::new(ProviderMetrics::default()))
                .value(),
        )
    }

    /// Record one completed request, both service-wide and per-provider.
    pub fn record(
        &self,
        provider: &str,
        latency_ms: u64,
        success: bool,
        error_kind: Option<ErrorKind>,
        usage: Option<(u32, u32, u32)>,
    ) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        if let Some((_, _, total)) = usage {
            self.total_tokens.fetch_add(u64::from(total), Ordering::Relaxed);
        }
        self.provider(provider).record(latency_ms, success, error_kind, usage);
    }

    /// Service-wide success rate.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.requests.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        self.successes.load(Ordering::Relaxed) as f64 / total as f64
    }

    /// Requests per second since the collector started.
    #[must_use]
    pub fn requests_per_second(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.requests.load(Ordering::Relaxed) as f64 / elapsed
    }

    /// Service-wide snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ServiceMetricsSnapshot {
        ServiceMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            success_rate: self.success_rate(),
            requests_per_second: self.requests_per_second(),
        }
    }
}

/// Reportable service-wide snapshot.
#[derive(Debug, Clone)]
pub struct ServiceMetricsSnapshot {
    /// Total requests across all providers.
    pub requests: u64,
    /// Total successes.
    pub successes: u64,
    /// Total failures.
    pub failures: u64,
    /// Total tokens across all providers.
    pub total_tokens: u64,
    /// Service-wide success rate.
    pub success_rate: f64,
    /// Service-wide requests-per-second since start.
    pub requests_per_second: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_latency_is_none_until_first_sample() {
        let m = ProviderMetrics::default();
        assert_eq!(m.ewma_latency_ms(), None);
        m.record(100, true, None, None);
        assert_eq!(m.ewma_latency_ms(), Some(100.0));
        m.record(200, true, None, None);
        assert!((m.ewma_latency_ms().unwrap() - 110.0).abs() < 1e-9);
    }

    #[test]
    fn errors_by_kind_only_counts_failures() {
        let m = ProviderMetrics::default();
        m.record(10, true, None, None);
        m.record(10, false, Some(ErrorKind::Timeout), None);
        m.record(10, false, Some(ErrorKind::Timeout), None);
        let snap = m.snapshot();
        assert_eq!(snap.errors_by_kind.get("timeout"), Some(&2));
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.failures, 2);
    }

    #[test]
    fn rolling_window_caps_at_100_and_tracks_recent_success_rate() {
        let m = ProviderMetrics::default();
        for _ in 0..150 {
            m.record(1, true, None, None);
        }
        for _ in 0..10 {
            m.record(1, false, Some(ErrorKind::Network), None);
        }
        // window now holds 100 entries: 90 of the trailing successes then 10 failures
        assert!((m.window_success_rate() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn service_snapshot_aggregates_across_providers() {
        let c = MetricsCollector::new();
        c.record("a", 10, true, None, Some((1, 2, 3)));
        c.record("b", 20, false, Some(ErrorKind::Timeout), None);
        let snap = c.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.total_tokens, 3);
    }
}
