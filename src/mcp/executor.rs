//! Tool Executor (C13, §4.13): worker-pool based tool execution with
//! caching, per-tool rate limiting, retries, and bounded back-pressure.
//!
//! The retry/backoff shape and per-call instrumentation follow the
//! teacher's `Backend::request` (latency measurement around a
//! [`crate::retry::with_retry`] call, `tracing::instrument`'d); the
//! rate-limit guard reuses `governor` the way the teacher's
//! `failsafe::rate_limiter::RateLimiter` does. The worker pool itself is
//! modeled as a pair of semaphores rather than literal OS/green threads,
//! since tasks here are already `tokio` futures: `queue` (width
//! `2 * workers`) gates admission (back-pressure when full), `workers`
//! (width `workers`) gates concurrent execution.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::{Quota, RateLimiter as GovernorLimiter};
use parking_lot::Mutex as PLMutex;
use serde_json::Value;
use tokio::sync::{oneshot, Semaphore};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::mcp::cache::ToolCache;
use crate::mcp::manager::McpManager;
use crate::mcp::metrics::McpMetricsCollector;
use crate::mcp::registry::ToolRegistry;
use crate::retry::{with_retry, RetryPolicy};

/// Default worker-pool width (§4.13 "default 10").
pub const DEFAULT_WORKERS: usize = 10;

type GovernorDirect = GovernorLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// A per-tool request-per-second cap (§4.13 step 2).
pub struct ToolRateLimit {
    /// Requests per second permitted.
    pub rps: u32,
    /// Burst allowance.
    pub burst: u32,
}

/// Owns the worker pool, per-tool rate limiters, cache, and retry policy
/// for dispatching MCP tool calls.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    manager: Arc<McpManager>,
    cache: Arc<ToolCache>,
    metrics: Arc<McpMetricsCollector>,
    retry_policy: RetryPolicy,
    cache_enabled: bool,
    default_cache_ttl: Duration,
    rate_limiters: DashMap<String, Arc<PLMutex<GovernorDirect>>>,
    rate_limits: DashMap<String, ToolRateLimit>,
    queue: Semaphore,
    workers: Semaphore,
    inflight: AtomicU32,
}

/// A single tool-call request (§4.13). Isolation is a per-server property
/// fixed at registration (§4.13 "the core only passes the mode through to
/// C8 at server registration"), not a per-call parameter.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Composite tool id, `"<server>:<tool>"`.
    pub tool_id: String,
    /// Argument map passed to the tool.
    pub arguments: Value,
}

impl ToolExecutor {
    /// Construct an executor with `workers` concurrent slots and a queue of
    /// `2 * workers` (§4.13).
    #[must_use]
    pub fn new(
        registry: Arc<ToolRegistry>,
        manager: Arc<McpManager>,
        cache: Arc<ToolCache>,
        metrics: Arc<McpMetricsCollector>,
        retry_policy: RetryPolicy,
        cache_enabled: bool,
        default_cache_ttl: Duration,
        workers: usize,
    ) -> Self {
        let workers = workers.max(1);
        Self {
            registry,
            manager,
            cache,
            metrics,
            retry_policy,
            cache_enabled,
            default_cache_ttl,
            rate_limiters: DashMap::new(),
            rate_limits: DashMap::new(),
            queue: Semaphore::new(workers * 2),
            workers: Semaphore::new(workers),
            inflight: AtomicU32::new(0),
        }
    }

    /// Configure a per-tool rate limit, enforced before cache/dispatch.
    pub fn set_rate_limit(&self, tool_id: &str, rps: u32, burst: u32) {
        self.rate_limits.insert(tool_id.to_string(), ToolRateLimit { rps, burst });
    }

    /// Execute a single tool call, consulting the cache, enforcing the
    /// per-tool rate limit, and retrying retryable failures (§4.13).
    #[tracing::instrument(skip(self, request), fields(tool = %request.tool_id))]
    pub async fn execute(&self, request: &ToolCallRequest) -> Result<Value> {
        let tool = self
            .registry
            .get(&request.tool_id)
            .filter(|t| t.available)
            .ok_or_else(|| Error::ToolNotFound(request.tool_id.clone()))?;

        if !self.try_acquire_rate_limit(&request.tool_id) {
            return Err(Error::QuotaExceeded(request.tool_id.clone()));
        }

        let cache_key = ToolCache::build_key(&request.tool_id, &request.arguments);
        if self.cache_enabled {
            if let Some(cached) = self.cache.get(&cache_key) {
                self.metrics.record_cache_hit(&tool.server, &tool.name);
                return Ok(cached);
            }
            self.metrics.record_cache_miss(&tool.server, &tool.name);
        }

        // Back-pressure: wait for a queue slot, then a worker slot.
        let _queue_permit = self.queue.acquire().await.map_err(|_| Error::ServiceUnavailable("executor closed".into()))?;
        let _worker_permit = self.workers.acquire().await.map_err(|_| Error::ServiceUnavailable("executor closed".into()))?;
        self.inflight.fetch_add(1, Ordering::SeqCst);

        let started = Instant::now();
        let result = self.dispatch(&tool.server, &tool.name, request).await;
        let latency = started.elapsed();
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        match &result {
            Ok(value) => {
                if self.cache_enabled {
                    self.cache.set(&cache_key, value.clone(), self.default_cache_ttl, &tool.server);
                }
                self.metrics.record_call(&tool.server, &tool.name, latency, true);
                info!(tool = %request.tool_id, latency_ms = latency.as_millis(), "tool call succeeded");
            }
            Err(e) => {
                self.metrics.record_call(&tool.server, &tool.name, latency, false);
                warn!(tool = %request.tool_id, error = %e, "tool call failed");
            }
        }
        result
    }

    /// Batch execution, bounded by the same worker pool (§4.13 "Batch tool
    /// execution fans out with bounded concurrency via the same pool").
    pub async fn execute_batch(&self, requests: &[ToolCallRequest]) -> Vec<Result<Value>> {
        futures::future::join_all(requests.iter().map(|r| self.execute(r))).await
    }

    /// Fire-and-await-elsewhere form: spawns the call and returns a
    /// receiver that yields the single response (§4.13 "async form returns
    /// a future channel that delivers one response").
    pub fn execute_async(self: &Arc<Self>, request: ToolCallRequest) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.execute(&request).await;
            let _ = tx.send(result);
        });
        rx
    }

    async fn dispatch(&self, server: &str, tool_name: &str, request: &ToolCallRequest) -> Result<Value> {
        let instance = self
            .manager
            .get(server)
            .ok_or_else(|| Error::ServerNotFound(server.to_string()))?;
        let timeout = instance.config().timeout;
        let policy = RetryPolicy { max_attempts: instance.config().retries + 1, ..self.retry_policy.clone() };
        let tool_name = tool_name.to_string();
        let args = request.arguments.clone();

        let outcome = with_retry(&policy, || {
            let instance = Arc::clone(&instance);
            let tool_name = tool_name.clone();
            let args = args.clone();
            async move {
                let Some(client) = instance.client() else {
                    return Err(Error::ServerUnhealthy(instance.name().to_string()));
                };
                match tokio::time::timeout(timeout, client.call_tool(&tool_name, args)).await {
                    Ok(Ok(outcome)) if outcome.success => Ok(outcome.data.unwrap_or(Value::Null)),
                    Ok(Ok(outcome)) => Err(Error::ToolCallFailed(outcome.error.unwrap_or_else(|| "tool reported failure".into()))),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(Error::ToolTimeout(format!("'{tool_name}' exceeded {timeout:?}"))),
                }
            }
        })
        .await;

        outcome.map(|o| o.value)
    }

    fn try_acquire_rate_limit(&self, tool_id: &str) -> bool {
        let Some(limit) = self.rate_limits.get(tool_id) else { return true };
        let limiter = Arc::clone(&self.rate_limiters.entry(tool_id.to_string()).or_insert_with(|| {
            let quota = Quota::per_second(NonZeroU32::new(limit.rps).unwrap_or(NonZeroU32::MIN))
                .allow_burst(NonZeroU32::new(limit.burst).unwrap_or(NonZeroU32::MIN));
            Arc::new(PLMutex::new(GovernorLimiter::direct(quota)))
        }));
        limiter.lock().check().is_ok()
    }

    /// Number of calls currently past admission and inside the worker pool.
    #[must_use]
    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::McpServerConfig;
    use crate::mcp::cache::EvictionPolicy;
    use crate::mcp::registry::DiscoveredTool;
    use crate::mcp::{IsolationMode, McpClient, McpClientFactory, ServerInfo, ToolCallOutcome, ToolSpec};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use std::sync::atomic::Ordering as StdOrdering;

    struct CountingClient {
        calls: StdAtomicU32,
        fail_first_n: u32,
    }

    #[async_trait]
    impl McpClient for CountingClient {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn get_tools(&self) -> Result<HashMap<String, ToolSpec>> {
            Ok(HashMap::new())
        }
        async fn call_tool(&self, _name: &str, args: Value) -> Result<ToolCallOutcome> {
            let n = self.calls.fetch_add(1, StdOrdering::SeqCst);
            if n < self.fail_first_n {
                return Err(Error::Network {
                    host: "mock".into(),
                    operation: "call".into(),
                    message: "connection refused".into(),
                    cause: None,
                });
            }
            Ok(ToolCallOutcome { success: true, data: Some(args), error: None })
        }
        fn get_server_info(&self) -> ServerInfo {
            ServerInfo::default()
        }
    }

    struct FixedFactory {
        fail_first_n: u32,
    }
    impl McpClientFactory for FixedFactory {
        fn build(&self, _config: &McpServerConfig, _isolation: IsolationMode) -> Arc<dyn McpClient> {
            Arc::new(CountingClient { calls: StdAtomicU32::new(0), fail_first_n: self.fail_first_n })
        }
    }

    async fn setup(fail_first_n: u32) -> (Arc<ToolExecutor>, Arc<ToolRegistry>) {
        let manager = Arc::new(McpManager::new(Arc::new(FixedFactory { fail_first_n })));
        manager
            .register(
                McpServerConfig { name: "s1".into(), retries: 3, ..Default::default() },
                IsolationMode::None,
            )
            .await
            .unwrap();
        let registry = Arc::new(ToolRegistry::new());
        registry.upsert_server_tools(
            "s1",
            vec![DiscoveredTool {
                id: "s1:echo".into(),
                name: "echo".into(),
                server: "s1".into(),
                description: String::new(),
                category: "general".into(),
                input_schema: Value::Null,
                last_seen: 0,
                available: true,
            }],
        );
        let cache = Arc::new(ToolCache::new(EvictionPolicy::Lru, 100, None));
        let metrics = Arc::new(McpMetricsCollector::new());
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&registry),
            manager,
            cache,
            metrics,
            RetryPolicy { initial_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), ..Default::default() },
            true,
            Duration::from_secs(60),
            2,
        ));
        (executor, registry)
    }

    #[tokio::test]
    async fn missing_tool_fails_not_found() {
        let (executor, _registry) = setup(0).await;
        let err = executor
            .execute(&ToolCallRequest { tool_id: "s1:missing".into(), arguments: Value::Null })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn successful_call_is_cached_on_second_call() {
        let (executor, _registry) = setup(0).await;
        let request = ToolCallRequest { tool_id: "s1:echo".into(), arguments: serde_json::json!({"x": 1}) };
        executor.execute(&request).await.unwrap();
        executor.execute(&request).await.unwrap();
        // two calls, only the first should have reached the driver
        assert_eq!(executor.cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn retries_a_retryable_failure_and_eventually_succeeds() {
        let (executor, _registry) = setup(2).await;
        let request = ToolCallRequest { tool_id: "s1:echo".into(), arguments: Value::Null };
        let result = executor.execute(&request).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn batch_preserves_order_and_count() {
        let (executor, _registry) = setup(0).await;
        let requests: Vec<_> = (0..4)
            .map(|i| ToolCallRequest { tool_id: "s1:echo".into(), arguments: serde_json::json!(i) })
            .collect();
        let results = executor.execute_batch(&requests).await;
        assert_eq!(results.len(), 4);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.as_ref().unwrap(), &serde_json::json!(i));
        }
    }

    #[tokio::test]
    async fn rate_limit_trips_quota_exceeded() {
        let (executor, _registry) = setup(0).await;
        executor.set_rate_limit("s1:echo", 1, 1);
        let request = ToolCallRequest { tool_id: "s1:echo".into(), arguments: Value::Null };
        executor.execute(&request).await.unwrap();
        let err = executor.execute(&request).await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));
    }
}
