//! Health checker (C3, §4.3): periodic and on-demand probing of every pool
//! entry, classifying Healthy/Degraded/Unhealthy.
//!
//! Structured the way the teacher structures its background loops in
//! `gateway/server.rs`: a `tokio::spawn` loop gated by `tokio::select!`
//! against a broadcast shutdown signal, with an idempotent `stop`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::error::Result;
use crate::provider::pool::{HealthStatus, ProviderPool};

/// Periodic and on-demand health prober for the provider pool.
pub struct HealthChecker {
    pool: Arc<ProviderPool>,
    interval: Duration,
    timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthChecker {
    /// Construct a checker bound to `pool`. Call [`start`](Self::start) once
    /// per service lifetime to begin the periodic loop.
    #[must_use]
    pub fn new(pool: Arc<ProviderPool>, interval: Duration, timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { pool, interval, timeout, shutdown_tx }
    }

    /// Probe every registered entry in parallel, synchronously, and return
    /// their resulting classification (§4.3 "on-demand `check_now`").
    pub async fn check_now(&self) -> std::collections::HashMap<String, HealthStatus> {
        let entries = self.pool.list();
        let timeout = self.timeout;
        let probes = entries.into_iter().map(|entry| {
            let pool = Arc::clone(&self.pool);
            async move {
                let driver = entry.driver();
                let started = Instant::now();
                let outcome: Result<Duration> = match tokio::time::timeout(timeout, driver.health()).await {
                    Ok(Ok(())) => Ok(started.elapsed()),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(crate::error::Error::Timeout(format!(
                        "health probe for '{}' exceeded {:?}",
                        entry.name(),
                        timeout
                    ))),
                };
                pool.apply_health_probe(entry.name(), &outcome, timeout);
            }
        });
        futures::future::join_all(probes).await;
        self.pool.get_health_map()
    }

    /// Start the periodic probing loop as a background task. Starting twice
    /// is harmless: each call spawns an independent loop sharing the same
    /// shutdown signal, but callers are expected to call this once (§4.3
    /// "starts once per service lifetime").
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown_rx = this.shutdown_tx.subscribe();
            let mut ticker = tokio::time::interval(this.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.check_now().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Stop the periodic loop. Idempotent: a second call is a harmless
    /// no-op broadcast with no subscribers left.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
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
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyDriver {
        name: String,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ProviderDriver for FlakyDriver {
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
            if self.fail.load(Ordering::Relaxed) {
                Err(crate::error::Error::Network {
                    host: "mock".into(),
                    operation: "probe".into(),
                    message: "refused".into(),
                    cause: None,
                })
            } else {
                Ok(())
            }
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn check_now_marks_failing_driver_unhealthy() {
        let pool = Arc::new(ProviderPool::new(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }));
        pool.add(
            Arc::new(FlakyDriver { name: "a".into(), fail: AtomicBool::new(true) }),
            1,
        )
        .unwrap();
        let checker = HealthChecker::new(Arc::clone(&pool), Duration::from_secs(30), Duration::from_secs(1));
        let result = checker.check_now().await;
        assert_eq!(result.get("a"), Some(&HealthStatus::Unhealthy));
    }

    #[tokio::test]
    async fn check_now_marks_succeeding_driver_healthy() {
        let pool = Arc::new(ProviderPool::new(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }));
        pool.add(
            Arc::new(FlakyDriver { name: "a".into(), fail: AtomicBool::new(false) }),
            1,
        )
        .unwrap();
        let checker = HealthChecker::new(Arc::clone(&pool), Duration::from_secs(30), Duration::from_secs(1));
        let result = checker.check_now().await;
        assert_eq!(result.get("a"), Some(&HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let pool = Arc::new(ProviderPool::new(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }));
        let checker = Arc::new(HealthChecker::new(pool, Duration::from_millis(10), Duration::from_secs(1)));
        checker.start();
        checker.stop();
        checker.stop();
    }
}
