//! MCP Health Monitor (C9, §4.9): periodic parallel probing of every
//! registered MCP server, with consecutive-failure-triggered restarts.
//!
//! Background-loop shape mirrors [`crate::provider::health::HealthChecker`]:
//! a `tokio::spawn` task gated by `tokio::select!` against a broadcast
//! shutdown signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::mcp::manager::McpManager;
use crate::mcp::ServerStatus;

/// Consecutive failed probes before a server is marked Unhealthy (§4.9).
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// Bounded context applied to each probe (§4.9 "within a 5-second bounded
/// context").
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically probes every MCP server instance and triggers restarts for
/// those that cross the consecutive-failure threshold.
pub struct McpHealthMonitor {
    manager: Arc<McpManager>,
    interval: Duration,
    consecutive_fails: DashMap<String, Arc<AtomicU32>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl McpHealthMonitor {
    /// Construct a monitor bound to `manager`, probing every `interval`.
    #[must_use]
    pub fn new(manager: Arc<McpManager>, interval: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { manager, interval, consecutive_fails: DashMap::new(), shutdown_tx }
    }

    /// Probe every registered instance once, synchronously, in parallel.
    /// Returns the instance names that crossed into Unhealthy this round.
    pub async fn check_now(&self) -> Vec<String> {
        let instances = self.manager.list();
        let probes = instances.into_iter().map(|instance| {
            let fails = Arc::clone(
                &self
                    .consecutive_fails
                    .entry(instance.name().to_string())
                    .or_insert_with(|| Arc::new(AtomicU32::new(0))),
            );
            async move {
                let healthy = probe(&instance).await;
                if healthy {
                    fails.store(0, Ordering::SeqCst);
                    instance.mark_healthy();
                    None
                } else {
                    let count = fails.fetch_add(1, Ordering::SeqCst) + 1;
                    if count >= UNHEALTHY_THRESHOLD {
                        instance.mark_unhealthy();
                        warn!(server = %instance.name(), consecutive_fails = count, "MCP server unhealthy");
                        if instance.can_restart() {
                            let manager = Arc::clone(&self.manager);
                            let name = instance.name().to_string();
                            tokio::spawn(async move {
                                if let Err(e) = manager.restart(&name).await {
                                    warn!(server = %name, error = %e, "auto-restart failed");
                                }
                            });
                        }
                        Some(instance.name().to_string())
                    } else {
                        None
                    }
                }
            }
        });
        futures::future::join_all(probes).await.into_iter().flatten().collect()
    }

    /// Start the periodic probing loop as a background task.
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

    /// Stop the periodic loop. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// One probe: connected AND a tool-list retrieval succeeds within the
/// bounded context (§4.9).
async fn probe(instance: &Arc<crate::mcp::ServerInstance>) -> bool {
    let Some(client) = instance.client() else { return false };
    if !client.is_connected() {
        return false;
    }
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, client.get_tools()).await,
        Ok(Ok(_))
    )
}
