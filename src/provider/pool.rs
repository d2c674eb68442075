//! Provider pool (C2, §3, §4.2).
//!
//! Holds `name -> ProviderEntry`, reader/writer-locked as a map (`dashmap`,
//! matching the teacher's `BackendRegistry`), with each entry's mutable
//! state further serialized per-entry (I3) via the entry's own circuit
//! breaker lock and a `parking_lot::RwLock<HealthStatus>`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};
use crate::provider::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::provider::ProviderDriver;

/// Provider health classification (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Not yet probed.
    Unknown,
    /// Responding within budget.
    Healthy,
    /// Responding, but slower than budget.
    Degraded,
    /// Not responding, or circuit open (I1).
    Unhealthy,
}

/// The durable handle for one backend (§3 ProviderEntry).
pub struct ProviderEntry {
    name: String,
    driver: Arc<dyn ProviderDriver>,
    /// Selection weight; 0 is valid (§9: excluded from weighted candidacy
    /// only, still eligible under other strategies).
    weight: u32,
    health: RwLock<HealthStatus>,
    circuit: CircuitBreaker,
    last_used_ms: AtomicU64,
    last_check_ms: AtomicU64,
    /// Active in-flight request count, maintained by the load balancer (C5).
    active_requests: std::sync::atomic::AtomicU32,
}

impl ProviderEntry {
    fn new(driver: Arc<dyn ProviderDriver>, weight: u32, cb_config: &CircuitBreakerConfig) -> Self {
        let name = driver.name().to_string();
        Self {
            circuit: CircuitBreaker::new(&name, cb_config),
            name,
            driver,
            weight,
            health: RwLock::new(HealthStatus::Unknown),
            last_used_ms: AtomicU64::new(0),
            last_check_ms: AtomicU64::new(0),
            active_requests: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Provider name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured selection weight.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// The driver handle.
    #[must_use]
    pub fn driver(&self) -> Arc<dyn ProviderDriver> {
        Arc::clone(&self.driver)
    }

    /// Current health classification.
    #[must_use]
    pub fn health(&self) -> HealthStatus {
        *self.health.read()
    }

    /// Current circuit state.
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    /// Current consecutive-failure count (I2), sourced from the breaker so
    /// there is a single counter of truth.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.circuit.stats().current_failures
    }

    /// Epoch-millisecond timestamp of the last selection.
    #[must_use]
    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    /// Epoch-millisecond timestamp of the last health probe.
    #[must_use]
    pub fn last_check_ms(&self) -> u64 {
        self.last_check_ms.load(Ordering::Relaxed)
    }

    /// Eligible per §4.5: `health=Healthy` and `circuit_state=Closed`.
    /// `HalfOpen` admission is a dedicated C4 path, never an LB eligibility
    /// outcome (§9 Open Question resolution).
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.health() == HealthStatus::Healthy && self.circuit_state() == CircuitState::Closed
    }

    /// Admission check delegated to the circuit breaker (C4).
    #[must_use]
    pub fn can_proceed(&self) -> bool {
        self.circuit.can_proceed()
    }

    /// Active in-flight request gauge, used by the `least_connections`
    /// strategy (§4.5).
    #[must_use]
    pub fn active_requests(&self) -> u32 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_active(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_active(&self) {
        self.active_requests
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
            .ok();
    }

    fn touch_used(&self) {
        self.last_used_ms.store(epoch_millis_now(), Ordering::Relaxed);
    }
}

/// C2: owns provider instances; tracks per-entry health, circuit state,
/// usage; mediates mutation.
pub struct ProviderPool {
    entries: DashMap<String, Arc<ProviderEntry>>,
    circuit_breaker_config: CircuitBreakerConfig,
}

impl ProviderPool {
    /// Construct an empty pool.
    #[must_use]
    pub fn new(circuit_breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            entries: DashMap::new(),
            circuit_breaker_config,
        }
    }

    /// Register a new provider (§4.2 `add`). `weight=0` is accepted (§9).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderAlreadyExists`] if `name` is already
    /// registered.
    pub fn add(&self, driver: Arc<dyn ProviderDriver>, weight: u32) -> Result<()> {
        let name = driver.name().to_string();
        if self.entries.contains_key(&name) {
            return Err(Error::ProviderAlreadyExists(name));
        }
        let entry = Arc::new(ProviderEntry::new(driver, weight, &self.circuit_breaker_config));
        self.entries.insert(name, entry);
        Ok(())
    }

    /// Remove and sever a provider's driver (§4.2 `remove`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderNotFound`] if `name` is not registered.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let (_, entry) = self
            .entries
            .remove(name)
            .ok_or_else(|| Error::ProviderNotFound(name.to_string()))?;
        entry.driver.close().await
    }

    /// Look up one entry.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ProviderEntry>> {
        self.entries.get(name).map(|e| Arc::clone(e.value()))
    }

    /// All registered entries; insertion order is not preserved (§4.2).
    #[must_use]
    pub fn list(&self) -> Vec<Arc<ProviderEntry>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Snapshot of every entry's health classification.
    #[must_use]
    pub fn get_health_map(&self) -> std::collections::HashMap<String, HealthStatus> {
        self.entries.iter().map(|e| (e.key().clone(), e.value().health())).collect()
    }

    /// Record a successful request on the request path (§4.2): resets the
    /// failure count and, if the circuit was `HalfOpen`, closes it and
    /// marks the entry `Healthy` (I1 is thereby preserved: a `Closed`
    /// circuit is never forced `Unhealthy` here).
    pub fn record_success(&self, name: &str) {
        let Some(entry) = self.get(name) else { return };
        let was_half_open = entry.circuit_state() == CircuitState::HalfOpen;
        entry.circuit.record_success();
        if was_half_open && entry.circuit_state() == CircuitState::Closed {
            *entry.health.write() = HealthStatus::Healthy;
        }
        entry.touch_used();
    }

    /// Record a failed request on the request path (§4.2): increments the
    /// failure count and, if the circuit trips to `Open`, marks the entry
    /// `Unhealthy` to preserve I1.
    pub fn record_failure(&self, name: &str) {
        let Some(entry) = self.get(name) else { return };
        entry.circuit.record_failure();
        if entry.circuit_state() == CircuitState::Open {
            *entry.health.write() = HealthStatus::Unhealthy;
        }
        entry.touch_used();
    }

    /// Apply the outcome of a health-checker probe (C3, §4.3): unlike the
    /// request path, any driver error marks the entry `Unhealthy`
    /// unconditionally, and a success is further classified `Healthy` or
    /// `Degraded` by how it compares to half the probe timeout — unless the
    /// circuit is `Open`, in which case I1 forces `Unhealthy` regardless of
    /// latency.
    pub(crate) fn apply_health_probe(&self, name: &str, outcome: &Result<Duration>, timeout: Duration) {
        let Some(entry) = self.get(name) else { return };
        entry.last_check_ms.store(epoch_millis_now(), Ordering::Relaxed);
        match outcome {
            Err(_) => {
                entry.circuit.record_failure();
                *entry.health.write() = HealthStatus::Unhealthy;
            }
            Ok(latency) => {
                entry.circuit.record_success();
                let status = if entry.circuit_state() == CircuitState::Open {
                    HealthStatus::Unhealthy
                } else if *latency <= timeout / 2 {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                };
                *entry.health.write() = status;
            }
        }
    }

    /// Sever every driver and clear the map (§4.2 `close`).
    pub async fn close(&self) {
        let names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, entry)) = self.entries.remove(&name) {
                let _ = entry.driver.close().await;
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn epoch_millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        Capabilities, GenerationRequest, GenerationResponse, StreamChunk, ToolGenerationRequest,
        ToolGenerationResponse, ToolStreamChunk,
    };
    use async_trait::async_trait;

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

    fn pool() -> ProviderPool {
        ProviderPool::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::ZERO,
        })
    }

    #[test]
    fn add_rejects_duplicate_name() {
        let p = pool();
        p.add(Arc::new(MockDriver { name: "a".into() }), 1).unwrap();
        let err = p.add(Arc::new(MockDriver { name: "a".into() }), 1).unwrap_err();
        assert!(matches!(err, Error::ProviderAlreadyExists(_)));
    }

    #[tokio::test]
    async fn remove_missing_is_not_found() {
        let p = pool();
        let err = p.remove("missing").await.unwrap_err();
        assert!(matches!(err, Error::ProviderNotFound(_)));
    }

    #[test]
    fn i1_invariant_circuit_open_implies_unhealthy() {
        let p = pool();
        p.add(Arc::new(MockDriver { name: "a".into() }), 1).unwrap();
        p.record_failure("a");
        p.record_failure("a");
        let entry = p.get("a").unwrap();
        assert_eq!(entry.circuit_state(), CircuitState::Open);
        assert_eq!(entry.health(), HealthStatus::Unhealthy);
    }

    #[test]
    fn apply_health_probe_classifies_healthy_vs_degraded() {
        let p = pool();
        p.add(Arc::new(MockDriver { name: "a".into() }), 1).unwrap();
        p.apply_health_probe("a", &Ok(Duration::from_millis(10)), Duration::from_millis(100));
        assert_eq!(p.get("a").unwrap().health(), HealthStatus::Healthy);

        p.apply_health_probe("a", &Ok(Duration::from_millis(90)), Duration::from_millis(100));
        assert_eq!(p.get("a").unwrap().health(), HealthStatus::Degraded);
    }

    #[test]
    fn apply_health_probe_error_is_unconditionally_unhealthy() {
        let p = pool();
        p.add(Arc::new(MockDriver { name: "a".into() }), 1).unwrap();
        p.apply_health_probe(
            "a",
            &Err(Error::Timeout("probe".into())),
            Duration::from_millis(100),
        );
        assert_eq!(p.get("a").unwrap().health(), HealthStatus::Unhealthy);
    }

    #[test]
    fn active_requests_never_goes_negative() {
        let p = pool();
        p.add(Arc::new(MockDriver { name: "a".into() }), 1).unwrap();
        let entry = p.get("a").unwrap();
        entry.dec_active();
        assert_eq!(entry.active_requests(), 0);
        entry.inc_active();
        entry.inc_active();
        entry.dec_active();
        assert_eq!(entry.active_requests(), 1);
    }
}
