//! Per-provider circuit breaker (C4, §4.4).
//!
//! Adapted from the teacher's `failsafe::circuit_breaker`: same state type,
//! same epoch-millisecond bookkeeping and observability snapshot, same
//! `build_circuit_breaker_error` shape. The admission rule in `HalfOpen`
//! differs from the teacher on purpose — §4.4 calls for exactly one
//! probe-like request admitted per half-open episode, not a multi-success
//! threshold, which this implements with a single in-flight-probe flag
//! instead of a success counter (§9 Open Question: "HalfOpen is gated
//! exclusively by the breaker, not the LB").

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::CircuitBreakerConfig;

/// Circuit breaker state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Allowing requests.
    Closed,
    /// Rejecting requests with `ProviderUnhealthy`.
    Open,
    /// Admitting exactly one probe request while recovery is evaluated.
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Cheap-to-clone observability snapshot.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Number of Closed -> Open transitions so far.
    pub trips_count: u64,
    /// Epoch-millisecond timestamp of the last trip (0 = never).
    pub last_trip_ms: u64,
    /// Milliseconds until a retry probe is admissible (0 when not Open).
    pub retry_after_ms: u64,
    /// Current consecutive failure count.
    pub current_failures: u32,
    /// Configured failure threshold.
    pub failure_threshold: u32,
}

/// Per-provider circuit breaker (C4).
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: RwLock<CircuitState>,
    failures: AtomicU32,
    last_state_change_ms: AtomicU64,
    trips_count: AtomicU64,
    last_trip_ms: AtomicU64,
    /// Set while a HalfOpen probe is outstanding; admission in HalfOpen
    /// succeeds only for the caller that flips this `false -> true`.
    half_open_probe_in_flight: AtomicBool,
}

impl CircuitBreaker {
    /// Construct a breaker starting Closed with a zero failure count (§3
    /// ProviderEntry lifecycle: "created by AddProvider").
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout,
            state: RwLock::new(CircuitState::Closed),
            failures: AtomicU32::new(0),
            last_state_change_ms: AtomicU64::new(0),
            trips_count: AtomicU64::new(0),
            last_trip_ms: AtomicU64::new(0),
            half_open_probe_in_flight: AtomicBool::new(false),
        }
    }

    /// Admission check (§4.4). `Closed` always admits; `Open` admits only
    /// once `recovery_timeout` has elapsed, at which point it transitions to
    /// `HalfOpen` and the triggering call becomes the probe; `HalfOpen`
    /// admits exactly the next caller and rejects all others until the
    /// probe resolves.
    #[tracing::instrument(skip(self), fields(provider = %self.name))]
    pub fn can_proceed(&self) -> bool {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed_ms = epoch_millis_now().saturating_sub(self.last_state_change_ms.load(Ordering::Relaxed));
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = self.recovery_timeout.as_millis() as u64;
                if elapsed_ms >= timeout_ms {
                    self.transition_to(CircuitState::HalfOpen);
                    self.half_open_probe_in_flight.store(true, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self
                .half_open_probe_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
        }
    }

    /// Record a successful call (§4.4: `Closed` resets the failure count;
    /// `HalfOpen` closes the circuit; `Open` is a stale result and ignored).
    pub fn record_success(&self) {
        match *self.state.read() {
            CircuitState::Closed => self.failures.store(0, Ordering::Relaxed),
            CircuitState::HalfOpen => self.transition_to(CircuitState::Closed),
            CircuitState::Open => {}
        }
    }

    /// Record a failed call (§4.4: `Closed` trips the breaker at
    /// `failure_threshold`; `HalfOpen` reopens immediately; `Open` is
    /// ignored).
    pub fn record_failure(&self) {
        match *self.state.read() {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition_to(CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    /// Observability snapshot, lock-free except for the state read.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = *self.state.read();
        let last_trip_ms = self.last_trip_ms.load(Ordering::Relaxed);
        let retry_after_ms = if state == CircuitState::Open && last_trip_ms > 0 {
            let elapsed_ms = epoch_millis_now().saturating_sub(last_trip_ms);
            #[allow(clippy::cast_possible_truncation)]
            let reset_ms = self.recovery_timeout.as_millis() as u64;
            reset_ms.saturating_sub(elapsed_ms)
        } else {
            0
        };
        CircuitBreakerStats {
            state,
            trips_count: self.trips_count.load(Ordering::Relaxed),
            last_trip_ms,
            retry_after_ms,
            current_failures: self.failures.load(Ordering::Relaxed),
            failure_threshold: self.failure_threshold,
        }
    }

    fn transition_to(&self, new_state: CircuitState) {
        let mut state = self.state.write();
        if *state == new_state {
            return;
        }
        *state = new_state;
        let epoch_ms = epoch_millis_now();
        self.last_state_change_ms.store(epoch_ms, Ordering::Relaxed);

        match new_state {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::Relaxed);
                self.half_open_probe_in_flight.store(false, Ordering::SeqCst);
                tracing::info!(provider = %self.name, "circuit breaker closed");
            }
            CircuitState::Open => {
                self.trips_count.fetch_add(1, Ordering::Relaxed);
                self.last_trip_ms.store(epoch_ms, Ordering::Relaxed);
                self.half_open_probe_in_flight.store(false, Ordering::SeqCst);
                tracing::warn!(provider = %self.name, failures = self.failures.load(Ordering::Relaxed), "circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                tracing::debug!(provider = %self.name, "circuit breaker half-open");
            }
        }
    }
}

/// Build the `ProviderUnhealthy` message for a rejected request.
#[must_use]
pub fn build_circuit_breaker_error(provider: &str, stats: &CircuitBreakerStats) -> String {
    let state_label = stats.state.as_str();
    match stats.state {
        CircuitState::Open => {
            let opened_ago_ms = if stats.last_trip_ms > 0 {
                epoch_millis_now().saturating_sub(stats.last_trip_ms)
            } else {
                0
            };
            format!(
                "circuit breaker for '{provider}' is {state_label} (tripped {} time(s)). \
                 opened ~{opened_ago_ms}ms ago. retry probe allowed in ~{}ms.",
                stats.trips_count, stats.retry_after_ms,
            )
        }
        _ => format!("circuit breaker for '{provider}' is {state_label}; request rejected"),
    }
}

/// Current time as milliseconds since UNIX epoch. Truncation to `u64` is
/// safe: epoch-ms fits comfortably for centuries.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn epoch_millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(failure_threshold: u32, recovery_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig { failure_threshold, recovery_timeout }
    }

    #[test]
    fn starts_closed_and_allows_requests() {
        let cb = CircuitBreaker::new("p", &cfg(3, Duration::from_secs(30)));
        assert!(cb.can_proceed());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_after_exactly_k_consecutive_failures() {
        let cb = CircuitBreaker::new("p", &cfg(3, Duration::from_secs(30)));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_proceed());
    }

    #[test]
    fn success_resets_failure_count_in_closed() {
        let cb = CircuitBreaker::new("p", &cfg(3, Duration::from_secs(30)));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed, "failure count should have reset");
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let cb = CircuitBreaker::new("p", &cfg(1, Duration::ZERO));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(cb.can_proceed(), "zero recovery_timeout admits the probe immediately");
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.can_proceed(), "a second concurrent caller must be rejected");
    }

    #[test]
    fn half_open_success_closes_immediately() {
        let cb = CircuitBreaker::new("p", &cfg(1, Duration::ZERO));
        cb.record_failure();
        assert!(cb.can_proceed());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_timer() {
        let cb = CircuitBreaker::new("p", &cfg(1, Duration::ZERO));
        cb.record_failure();
        assert!(cb.can_proceed());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().trips_count, 2);
    }

    #[test]
    fn stats_retry_after_ms_nonzero_when_open_then_zero_when_closed() {
        let cb = CircuitBreaker::new("p", &cfg(1, Duration::from_secs(60)));
        cb.record_failure();
        let s = cb.stats();
        assert_eq!(s.state, CircuitState::Open);
        assert!(s.retry_after_ms > 0 && s.retry_after_ms <= 60_000);

        let cb2 = CircuitBreaker::new("p", &cfg(3, Duration::from_secs(30)));
        assert_eq!(cb2.stats().retry_after_ms, 0);
    }

    #[test]
    fn error_message_mentions_provider_and_state() {
        let stats = CircuitBreakerStats {
            state: CircuitState::Open,
            trips_count: 2,
            last_trip_ms: epoch_millis_now().saturating_sub(500),
            retry_after_ms: 29_500,
            current_failures: 3,
            failure_threshold: 3,
        };
        let msg = build_circuit_breaker_error("my-provider", &stats);
        assert!(msg.contains("my-provider"));
        assert!(msg.contains("open"));
        assert!(msg.contains("2 time(s)"));
    }
}
