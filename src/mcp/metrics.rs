//! MCP Metrics Collector (C14, §4.14): per-server and per-tool counters,
//! a 1-minute aggregation loop recomputing derived fields and global
//! tallies.
//!
//! Structured like [`crate::provider::metrics::MetricsCollector`]: atomic
//! counters per entity, `DashMap` for the per-entity handles, a cheap
//! `snapshot()` for observability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::mcp::manager::McpManager;
use crate::mcp::ServerStatus;

/// Default aggregation cadence (§4.14 "A 1-minute aggregation loop").
pub const DEFAULT_AGGREGATION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct ServerCounters {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    total_latency_ms: AtomicU64,
    restart_count: AtomicU64,
    health_check_passes: AtomicU64,
    health_check_failures: AtomicU64,
    recovery_attempts: AtomicU64,
    recovery_successes: AtomicU64,
}

#[derive(Default)]
struct ToolCounters {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    total_latency_ms: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Point-in-time per-server metrics (§4.14).
#[derive(Debug, Clone, Serialize)]
pub struct ServerMetricsSnapshot {
    /// Server name.
    pub name: String,
    /// Total calls dispatched to tools on this server.
    pub total_calls: u64,
    /// Calls that succeeded.
    pub successful_calls: u64,
    /// Calls that failed.
    pub failed_calls: u64,
    /// Mean latency across recorded calls, milliseconds.
    pub avg_response_time_ms: f64,
    /// `failed_calls / total_calls`, 0.0-1.0.
    pub error_rate: f64,
    /// Total restarts performed by C8/C9.
    pub restart_count: u64,
    /// Health-probe pass/fail tallies (C9).
    pub health_check_passes: u64,
    /// See above.
    pub health_check_failures: u64,
    /// Auto-restart attempts triggered by C9.
    pub recovery_attempts: u64,
    /// Auto-restarts that resulted in a Healthy instance.
    pub recovery_successes: u64,
}

/// Point-in-time per-tool metrics (§4.14).
#[derive(Debug, Clone, Serialize)]
pub struct ToolMetricsSnapshot {
    /// Composite tool id.
    pub tool_id: String,
    /// Total calls.
    pub total_calls: u64,
    /// Calls that succeeded.
    pub successful_calls: u64,
    /// Calls that failed.
    pub failed_calls: u64,
    /// Mean latency across recorded calls, milliseconds.
    pub avg_response_time_ms: f64,
    /// `failed_calls / total_calls`, 0.0-1.0.
    pub error_rate: f64,
    /// Cache hits for this tool.
    pub cache_hits: u64,
    /// Cache misses for this tool.
    pub cache_misses: u64,
}

/// Global tallies recomputed each aggregation round (§4.14).
#[derive(Debug, Clone, Serialize, Default)]
pub struct GlobalMcpMetricsSnapshot {
    /// Total tool calls across all servers.
    pub total_calls: u64,
    /// Total successful tool calls.
    pub successful_calls: u64,
    /// Total failed tool calls.
    pub failed_calls: u64,
    /// Servers currently Healthy.
    pub healthy_server_count: usize,
    /// Servers currently Unhealthy.
    pub unhealthy_server_count: usize,
    /// Distinct tools known to the registry-backed counters.
    pub tool_count: usize,
}

/// Aggregates per-server and per-tool call metrics for the MCP subsystem.
pub struct McpMetricsCollector {
    servers: DashMap<String, ServerCounters>,
    tools: DashMap<String, ToolCounters>,
    global: parking_lot::RwLock<GlobalMcpMetricsSnapshot>,
    shutdown_tx: broadcast::Sender<()>,
}

impl McpMetricsCollector {
    /// Construct an empty collector.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            servers: DashMap::new(),
            tools: DashMap::new(),
            global: parking_lot::RwLock::new(GlobalMcpMetricsSnapshot::default()),
            shutdown_tx,
        }
    }

    /// Record one tool call outcome (§4.13 step 7).
    pub fn record_call(&self, server: &str, tool_name: &str, latency: Duration, success: bool) {
        let tool_id = format!("{server}:{tool_name}");
        #[allow(clippy::cast_possible_truncation)]
        let latency_ms = latency.as_millis() as u64;

        let server_counters = self.servers.entry(server.to_string()).or_default();
        server_counters.total_calls.fetch_add(1, Ordering::Relaxed);
        server_counters.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        if success {
            server_counters.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            server_counters.failed_calls.fetch_add(1, Ordering::Relaxed);
        }

        let tool_counters = self.tools.entry(tool_id).or_default();
        tool_counters.total_calls.fetch_add(1, Ordering::Relaxed);
        tool_counters.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        if success {
            tool_counters.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            tool_counters.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a cache hit for `tool_id = "<server>:<tool>"`.
    pub fn record_cache_hit(&self, server: &str, tool_name: &str) {
        self.tools.entry(format!("{server}:{tool_name}")).or_default().cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache miss for `tool_id = "<server>:<tool>"`.
    pub fn record_cache_miss(&self, server: &str, tool_name: &str) {
        self.tools.entry(format!("{server}:{tool_name}")).or_default().cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a health-probe outcome for `server` (C9).
    pub fn record_health_check(&self, server: &str, passed: bool) {
        let counters = self.servers.entry(server.to_string()).or_default();
        if passed {
            counters.health_check_passes.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.health_check_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an auto-restart attempt and whether it recovered the server.
    pub fn record_recovery(&self, server: &str, succeeded: bool) {
        let counters = self.servers.entry(server.to_string()).or_default();
        counters.recovery_attempts.fetch_add(1, Ordering::Relaxed);
        counters.restart_count.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            counters.recovery_successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot of one server's metrics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn server_snapshot(&self, server: &str) -> Option<ServerMetricsSnapshot> {
        self.servers.get(server).map(|c| {
            let total = c.total_calls.load(Ordering::Relaxed);
            let failed = c.failed_calls.load(Ordering::Relaxed);
            ServerMetricsSnapshot {
                name: server.to_string(),
                total_calls: total,
                successful_calls: c.successful_calls.load(Ordering::Relaxed),
                failed_calls: failed,
                avg_response_time_ms: if total == 0 { 0.0 } else { c.total_latency_ms.load(Ordering::Relaxed) as f64 / total as f64 },
                error_rate: if total == 0 { 0.0 } else { failed as f64 / total as f64 },
                restart_count: c.restart_count.load(Ordering::Relaxed),
                health_check_passes: c.health_check_passes.load(Ordering::Relaxed),
                health_check_failures: c.health_check_failures.load(Ordering::Relaxed),
                recovery_attempts: c.recovery_attempts.load(Ordering::Relaxed),
                recovery_successes: c.recovery_successes.load(Ordering::Relaxed),
            }
        })
    }

    /// Snapshot of one tool's metrics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn tool_snapshot(&self, tool_id: &str) -> Option<ToolMetricsSnapshot> {
        self.tools.get(tool_id).map(|c| {
            let total = c.total_calls.load(Ordering::Relaxed);
            let failed = c.failed_calls.load(Ordering::Relaxed);
            ToolMetricsSnapshot {
                tool_id: tool_id.to_string(),
                total_calls: total,
                successful_calls: c.successful_calls.load(Ordering::Relaxed),
                failed_calls: failed,
                avg_response_time_ms: if total == 0 { 0.0 } else { c.total_latency_ms.load(Ordering::Relaxed) as f64 / total as f64 },
                error_rate: if total == 0 { 0.0 } else { failed as f64 / total as f64 },
                cache_hits: c.cache_hits.load(Ordering::Relaxed),
                cache_misses: c.cache_misses.load(Ordering::Relaxed),
            }
        })
    }

    /// Current global tallies (as of the last aggregation round, or zeroed
    /// if [`Self::aggregate`] has never run).
    #[must_use]
    pub fn global_snapshot(&self) -> GlobalMcpMetricsSnapshot {
        self.global.read().clone()
    }

    /// Recompute global tallies against `manager`'s current server set
    /// (§4.14 "recomputes derived fields and global tallies").
    pub fn aggregate(&self, manager: &McpManager) {
        let instances = manager.list();
        let healthy_server_count = instances.iter().filter(|i| i.status() == ServerStatus::Healthy).count();
        let unhealthy_server_count = instances.iter().filter(|i| i.status() == ServerStatus::Unhealthy).count();
        let total_calls: u64 = self.servers.iter().map(|c| c.total_calls.load(Ordering::Relaxed)).sum();
        let successful_calls: u64 = self.servers.iter().map(|c| c.successful_calls.load(Ordering::Relaxed)).sum();
        let failed_calls: u64 = self.servers.iter().map(|c| c.failed_calls.load(Ordering::Relaxed)).sum();
        *self.global.write() = GlobalMcpMetricsSnapshot {
            total_calls,
            successful_calls,
            failed_calls,
            healthy_server_count,
            unhealthy_server_count,
            tool_count: self.tools.len(),
        };
    }

    /// Start the periodic aggregation loop.
    pub fn start(self: &Arc<Self>, manager: Arc<McpManager>, interval: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown_rx = this.shutdown_tx.subscribe();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.aggregate(&manager),
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Stop the periodic aggregation loop. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Per-tool snapshots, keyed by tool id.
    #[must_use]
    pub fn all_tools(&self) -> HashMap<String, ToolMetricsSnapshot> {
        self.tools.iter().filter_map(|e| self.tool_snapshot(e.key())).map(|s| (s.tool_id.clone(), s)).collect()
    }
}

impl Default for McpMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::McpServerConfig;
    use crate::mcp::{IsolationMode, McpClient, McpClientFactory, ServerInfo, ToolCallOutcome, ToolSpec};
    use async_trait::async_trait;
    use serde_json::Value;

    struct NoopClient;
    #[async_trait]
    impl McpClient for NoopClient {
        async fn connect(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn close(&self) -> crate::error::Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn get_tools(&self) -> crate::error::Result<std::collections::HashMap<String, ToolSpec>> {
            Ok(std::collections::HashMap::new())
        }
        async fn call_tool(&self, _name: &str, _args: Value) -> crate::error::Result<ToolCallOutcome> {
            Ok(ToolCallOutcome { success: true, data: None, error: None })
        }
        fn get_server_info(&self) -> ServerInfo {
            ServerInfo::default()
        }
    }
    struct NoopFactory;
    impl McpClientFactory for NoopFactory {
        fn build(&self, _config: &McpServerConfig, _isolation: IsolationMode) -> Arc<dyn McpClient> {
            Arc::new(NoopClient)
        }
    }

    #[test]
    fn record_call_updates_server_and_tool_counters() {
        let metrics = McpMetricsCollector::new();
        metrics.record_call("s1", "echo", Duration::from_millis(10), true);
        metrics.record_call("s1", "echo", Duration::from_millis(30), false);

        let server = metrics.server_snapshot("s1").unwrap();
        assert_eq!(server.total_calls, 2);
        assert_eq!(server.failed_calls, 1);
        assert!((server.error_rate - 0.5).abs() < f64::EPSILON);
        assert!((server.avg_response_time_ms - 20.0).abs() < f64::EPSILON);

        let tool = metrics.tool_snapshot("s1:echo").unwrap();
        assert_eq!(tool.total_calls, 2);
    }

    #[test]
    fn cache_hit_and_miss_tracked_per_tool() {
        let metrics = McpMetricsCollector::new();
        metrics.record_cache_hit("s1", "echo");
        metrics.record_cache_miss("s1", "echo");
        let tool = metrics.tool_snapshot("s1:echo").unwrap();
        assert_eq!(tool.cache_hits, 1);
        assert_eq!(tool.cache_misses, 1);
    }

    #[tokio::test]
    async fn aggregate_counts_healthy_and_unhealthy_servers() {
        let manager = Arc::new(McpManager::new(Arc::new(NoopFactory)));
        manager.register(McpServerConfig { name: "a".into(), ..Default::default() }, IsolationMode::None).await.unwrap();
        manager.register(McpServerConfig { name: "b".into(), ..Default::default() }, IsolationMode::None).await.unwrap();
        manager.get("b").unwrap().set_status(ServerStatus::Unhealthy);

        let metrics = McpMetricsCollector::new();
        metrics.record_call("a", "echo", Duration::from_millis(5), true);
        metrics.aggregate(&manager);

        let global = metrics.global_snapshot();
        assert_eq!(global.healthy_server_count, 1);
        assert_eq!(global.unhealthy_server_count, 1);
        assert_eq!(global.total_calls, 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let manager = Arc::new(McpManager::new(Arc::new(NoopFactory)));
        let metrics = Arc::new(McpMetricsCollector::new());
        metrics.start(manager, Duration::from_millis(10));
        metrics.stop();
        metrics.stop();
    }
}
