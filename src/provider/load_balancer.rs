//! Load balancer (C5, §4.5): selects an eligible provider under one of five
//! strategies, and tracks the in-flight gauge `least_connections` reads.
//!
//! Eligibility is always [`ProviderEntry::is_eligible`] — `Healthy` and
//! `Closed` — regardless of strategy; a `HalfOpen` probe is admitted only
//! through the circuit breaker's own `can_proceed` (C4), never through
//! candidacy here (§9 Open Question resolution).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rand::Rng;

use crate::config::LoadBalancingStrategy;
use crate::error::{Error, Result};
use crate::provider::metrics::MetricsCollector;
use crate::provider::pool::{ProviderEntry, ProviderPool};

/// A selected provider, paired with a callback recording the outcome.
///
/// `finish` is idempotent and also runs on drop, so `active_requests`
/// returns to zero exactly once even if the caller is canceled mid-request
/// (§8 P1) rather than reaching the explicit `finish` call.
pub struct Selection {
    /// The chosen entry.
    pub entry: Arc<ProviderEntry>,
    finished: AtomicBool,
}

impl Selection {
    fn new(entry: Arc<ProviderEntry>) -> Self {
        Self { entry, finished: AtomicBool::new(false) }
    }

    /// Decrement the in-flight gauge after the call completes. Every
    /// `select` is paired with exactly one effective decrement (§4.5
    /// "active_requests is maintained by the caller"), whether this is
    /// called explicitly or the selection is simply dropped.
    pub fn finish(&self) {
        if self
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.entry.dec_active();
        }
    }
}

impl Drop for Selection {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Picks among eligible providers (C5).
pub struct LoadBalancer {
    pool: Arc<ProviderPool>,
    metrics: Arc<MetricsCollector>,
    strategy: LoadBalancingStrategy,
    round_robin_counter: AtomicU64,
}

impl LoadBalancer {
    /// Construct a balancer bound to `pool` and `metrics`.
    #[must_use]
    pub fn new(pool: Arc<ProviderPool>, metrics: Arc<MetricsCollector>, strategy: LoadBalancingStrategy) -> Self {
        Self {
            pool,
            metrics,
            strategy,
            round_robin_counter: AtomicU64::new(0),
        }
    }

    /// Select one eligible provider per the configured strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoProvidersAvailable`] if no registered entry is
    /// currently eligible.
    pub fn select(&self) -> Result<Selection> {
        let eligible: Vec<Arc<ProviderEntry>> = self.pool.list().into_iter().filter(|e| e.is_eligible()).collect();
        if eligible.is_empty() {
            return Err(Error::NoProvidersAvailable);
        }

        let chosen = match self.strategy {
            LoadBalancingStrategy::RoundRobin => self.pick_round_robin(&eligible),
            LoadBalancingStrategy::Weighted => self.pick_weighted(&eligible),
            LoadBalancingStrategy::LeastConnections => Self::pick_least_connections(&eligible),
            LoadBalancingStrategy::ResponseTime => self.pick_response_time(&eligible),
            LoadBalancingStrategy::Adaptive => self.pick_adaptive(&eligible),
        };

        chosen.inc_active();
        Ok(Selection::new(chosen))
    }

    /// The backing pool, exposed so the service facade (C7) can implement
    /// the HalfOpen recovery fallback described in §4.4/§4.7: when no entry
    /// is `eligible` in the §4.5 sense, a timed-out `Open` entry may still
    /// admit exactly one probe through the circuit breaker directly.
    #[must_use]
    pub fn pool(&self) -> &Arc<ProviderPool> {
        &self.pool
    }

    /// Wrap an already-admitted entry (e.g. a HalfOpen probe admitted
    /// directly by C4) as a [`Selection`], incrementing its active-request
    /// gauge the same way normal selection does.
    #[must_use]
    pub fn adopt(entry: Arc<ProviderEntry>) -> Selection {
        entry.inc_active();
        Selection::new(entry)
    }

    fn pick_round_robin(&self, eligible: &[Arc<ProviderEntry>]) -> Arc<ProviderEntry> {
        let idx = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) as usize % eligible.len();
        Arc::clone(&eligible[idx])
    }

    /// Cumulative-weight random selection; falls back to round-robin when
    /// every eligible entry has weight 0 (§9: weight=0 excludes from
    /// *weighted* candidacy, not from eligibility).
    fn pick_weighted(&self, eligible: &[Arc<ProviderEntry>]) -> Arc<ProviderEntry> {
        let total: u32 = eligible.iter().map(|e| e.weight()).sum();
        if total == 0 {
            return self.pick_round_robin(eligible);
        }
        let mut roll = rand::rng().random_range(0..total);
        for entry in eligible {
            if roll < entry.weight() {
                return Arc::clone(entry);
            }
            roll -= entry.weight();
        }
        Arc::clone(eligible.last().expect("eligible is non-empty"))
    }

    fn pick_least_connections(eligible: &[Arc<ProviderEntry>]) -> Arc<ProviderEntry> {
        Arc::clone(
            eligible
                .iter()
                .min_by_key(|e| e.active_requests())
                .expect("eligible is non-empty"),
        )
    }

    /// Minimum exponentially-smoothed average latency; an entry with no
    /// samples yet (`None`) always wins, bootstrapping new providers into
    /// rotation (§4.5).
    fn pick_response_time(&self, eligible: &[Arc<ProviderEntry>]) -> Arc<ProviderEntry> {
        Arc::clone(
            eligible
                .iter()
                .min_by(|a, b| {
                    let la = self.metrics.provider(a.name()).ewma_latency_ms();
                    let lb = self.metrics.provider(b.name()).ewma_latency_ms();
                    match (la, lb) {
                        (None, None) => std::cmp::Ordering::Equal,
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                    }
                })
                .expect("eligible is non-empty"),
        )
    }

    /// Composite score (§4.5): `base · success_rate ·
    /// 1/(1+avg_latency_seconds) · 1/(1+active_requests) · (weight/10) ·
    /// recent_window_success_rate`. A provider with no samples yet gets a
    /// bootstrap score of 1000 so it is tried (§4.5 "new providers receive
    /// score=1000 to ensure exploration").
    fn pick_adaptive(&self, eligible: &[Arc<ProviderEntry>]) -> Arc<ProviderEntry> {
        Arc::clone(
            eligible
                .iter()
                .max_by(|a, b| {
                    let sa = self.adaptive_score(a);
                    let sb = self.adaptive_score(b);
                    sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("eligible is non-empty"),
        )
    }

    const ADAPTIVE_BASE: f64 = 1.0;
    const NEW_PROVIDER_SCORE: f64 = 1000.0;

    fn adaptive_score(&self, entry: &ProviderEntry) -> f64 {
        let metrics = self.metrics.provider(entry.name());
        let Some(latency_ms) = metrics.ewma_latency_ms() else {
            return Self::NEW_PROVIDER_SCORE;
        };
        let avg_latency_seconds = latency_ms / 1000.0;
        let success_rate = metrics.success_rate();
        let recent_window_success_rate = metrics.window_success_rate();
        let load_term = 1.0 / (1.0 + f64::from(entry.active_requests()));
        let latency_term = 1.0 / (1.0 + avg_latency_seconds);
        let weight_term = f64::from(entry.weight()) / 10.0;
        Self::ADAPTIVE_BASE * success_rate * latency_term * load_term * weight_term * recent_window_success_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::provider::{
        Capabilities, GenerationRequest, GenerationResponse, ProviderDriver, StreamChunk,
        ToolGenerationRequest, ToolGenerationResponse, ToolStreamChunk,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    struct MockDriver {
        name: String,
    }

    #[async_trait]
    impl ProviderDriver for MockDriver {
        fn name(&self) -> &str {
            &self.name
        }
        fn provider_type(&self) -> &str {
            "mock"
        }
        fn model(&self) -> &str {
            "mock-model"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        async fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResponse> {
            Ok(GenerationResponse::default())
        }
        async fn stream(
            &self,
            _request: &GenerationRequest,
            _sink: &mut (dyn FnMut(StreamChunk) + Send),
        ) -> Result<()> {
            Ok(())
        }
        async fn generate_with_tools(
            &self,
            _request: &ToolGenerationRequest,
        ) -> Result<ToolGenerationResponse> {
            Ok(ToolGenerationResponse::default())
        }
        async fn stream_with_tools(
            &self,
            _request: &ToolGenerationRequest,
            _sink: &mut (dyn FnMut(ToolStreamChunk) + Send),
        ) -> Result<()> {
            Ok(())
        }
        async fn health(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn pool_with(names_weights: &[(&str, u32)]) -> Arc<ProviderPool> {
        let pool = Arc::new(ProviderPool::new(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }));
        for (name, weight) in names_weights {
            pool.add(Arc::new(MockDriver { name: (*name).to_string() }), *weight).unwrap();
            pool.apply_health_probe(name, &Ok(Duration::from_millis(1)), Duration::from_millis(100));
        }
        pool
    }

    #[test]
    fn select_with_no_eligible_providers_errors() {
        let pool = Arc::new(ProviderPool::new(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }));
        let lb = LoadBalancer::new(pool, Arc::new(MetricsCollector::new()), LoadBalancingStrategy::RoundRobin);
        assert!(matches!(lb.select().unwrap_err(), Error::NoProvidersAvailable));
    }

    #[test]
    fn round_robin_cycles_through_all_eligible_entries() {
        let pool = pool_with(&[("a", 1), ("b", 1), ("c", 1)]);
        let lb = LoadBalancer::new(pool, Arc::new(MetricsCollector::new()), LoadBalancingStrategy::RoundRobin);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..6 {
            let sel = lb.select().unwrap();
            seen.insert(sel.entry.name().to_string());
            sel.finish();
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn weighted_falls_back_to_round_robin_when_all_weights_zero() {
        let pool = pool_with(&[("a", 0), ("b", 0)]);
        let lb = LoadBalancer::new(pool, Arc::new(MetricsCollector::new()), LoadBalancingStrategy::Weighted);
        let sel = lb.select().unwrap();
        sel.finish();
    }

    #[test]
    fn least_connections_prefers_the_idler_entry() {
        let pool = pool_with(&[("a", 1), ("b", 1)]);
        pool.get("a").unwrap().inc_active();
        pool.get("a").unwrap().inc_active();
        let lb = LoadBalancer::new(pool, Arc::new(MetricsCollector::new()), LoadBalancingStrategy::LeastConnections);
        let sel = lb.select().unwrap();
        assert_eq!(sel.entry.name(), "b");
        sel.finish();
    }

    #[test]
    fn response_time_prefers_unsampled_provider_as_bootstrap() {
        let pool = pool_with(&[("a", 1), ("b", 1)]);
        let metrics = Arc::new(MetricsCollector::new());
        metrics.provider("a").record(500, true, None, None);
        let lb = LoadBalancer::new(pool, metrics, LoadBalancingStrategy::ResponseTime);
        let sel = lb.select().unwrap();
        assert_eq!(sel.entry.name(), "b");
        sel.finish();
    }

    #[test]
    fn adaptive_rewards_low_latency_high_success_low_load() {
        let pool = pool_with(&[("a", 1), ("b", 1)]);
        let metrics = Arc::new(MetricsCollector::new());
        metrics.provider("a").record(10, true, None, None);
        metrics.provider("b").record(500, true, None, None);
        let lb = LoadBalancer::new(pool, metrics, LoadBalancingStrategy::Adaptive);
        let sel = lb.select().unwrap();
        assert_eq!(sel.entry.name(), "a");
        sel.finish();
    }

    #[test]
    fn finish_decrements_active_requests() {
        let pool = pool_with(&[("a", 1)]);
        let lb = LoadBalancer::new(pool, Arc::new(MetricsCollector::new()), LoadBalancingStrategy::RoundRobin);
        let sel = lb.select().unwrap();
        assert_eq!(sel.entry.active_requests(), 1);
        sel.finish();
        assert_eq!(sel.entry.active_requests(), 0);
    }
}
