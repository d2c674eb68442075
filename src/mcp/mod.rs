//! MCP tool execution control plane: server lifecycle (§4.8), health
//! monitoring (§4.9), tool discovery (§4.10), registry (§4.11), cache
//! (§4.12), executor (§4.13) and MCP-side metrics (§4.14).
//!
//! The client plug-in contract below is the C1 analogue for the tool side
//! (§6 "MCP client plug-in contract"): opaque adapters the core treats
//! uniformly, constructed through an injected factory the way C2 constructs
//! [`crate::provider::ProviderDriver`]s through a driver factory.

pub mod cache;
pub mod discovery;
pub mod executor;
pub mod health_monitor;
pub mod manager;
pub mod metrics;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::McpServerConfig;
use crate::error::Result;
use crate::provider::circuit_breaker::epoch_millis_now;

/// How a tool call is isolated from the gateway process (§4.13). The
/// concrete isolation is a driver decision; the core only threads the mode
/// through to server registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationMode {
    /// Runs in-process, no isolation.
    #[default]
    None,
    /// Runs in a separate OS process.
    Process,
    /// Runs in a container.
    Container,
}

/// A tool exported by an MCP server, as returned by `get_tools` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name, unique within its server.
    pub name: String,
    /// Human-readable description, also used for categorization (§4.10).
    pub description: String,
    /// JSON-Schema describing the tool's argument map.
    pub input_schema: Value,
}

/// Result of a single `call_tool` invocation (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallOutcome {
    /// Whether the call succeeded.
    pub success: bool,
    /// Response payload on success.
    pub data: Option<Value>,
    /// Error message on failure.
    pub error: Option<String>,
}

/// Identity reported by `get_server_info` (§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server name as reported by the MCP process itself.
    pub name: String,
    /// Server-reported version string.
    pub version: String,
}

/// The MCP client plug-in contract (§6): the uniform surface every MCP
/// transport adapter implements. Wire framing (stdio/HTTP) is explicitly
/// out of scope (§1) — implementations of this trait own that detail.
#[async_trait]
pub trait McpClient: Send + Sync {
    /// Establish the connection (spawn the process / open the transport).
    async fn connect(&self) -> Result<()>;
    /// Tear the connection down. Safe to call more than once.
    async fn close(&self) -> Result<()>;
    /// Whether the transport is currently connected.
    fn is_connected(&self) -> bool;
    /// Fetch the server's current tool catalog.
    async fn get_tools(&self) -> Result<HashMap<String, ToolSpec>>;
    /// Invoke a named tool with an argument map.
    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolCallOutcome>;
    /// Static identity information.
    fn get_server_info(&self) -> ServerInfo;
}

/// Constructs an [`McpClient`] for a server configuration (§4.8 "constructs
/// a driver via an injected client factory"). Injected so tests can
/// substitute an in-memory double without touching real process spawning.
pub trait McpClientFactory: Send + Sync {
    /// Build a (not-yet-connected) client for `config`.
    fn build(&self, config: &McpServerConfig, isolation: IsolationMode) -> Arc<dyn McpClient>;
}

/// Lifecycle status of a [`ServerInstance`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Registered but never probed.
    Unknown,
    /// Connecting / awaiting initial probe.
    Starting,
    /// Connected and responsive.
    Healthy,
    /// Connected but failing probes, or probe-unreachable.
    Unhealthy,
    /// Mid auto-restart cycle.
    Restarting,
    /// Deliberately stopped (unregistered or shut down).
    Stopped,
    /// Exhausted its restart budget; terminal until re-registered.
    Failed,
}

struct InstanceState {
    status: ServerStatus,
    restart_count: u32,
    started_at: Option<u64>,
    last_healthy: Option<u64>,
}

/// The durable handle for one MCP server process (§3 ServerInstance).
///
/// `status`/`restart_count`/`started_at`/`last_healthy` are guarded by a
/// single lock per §5 ("ServerInstance is instance-locked for
/// status/restart_count/started_at").
pub struct ServerInstance {
    name: String,
    config: McpServerConfig,
    isolation: IsolationMode,
    client: RwLock<Option<Arc<dyn McpClient>>>,
    state: RwLock<InstanceState>,
}

impl ServerInstance {
    pub(crate) fn new(config: McpServerConfig, isolation: IsolationMode) -> Self {
        Self {
            name: config.name.clone(),
            config,
            isolation,
            client: RwLock::new(None),
            state: RwLock::new(InstanceState {
                status: ServerStatus::Unknown,
                restart_count: 0,
                started_at: None,
                last_healthy: None,
            }),
        }
    }

    /// Server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Static configuration this instance was registered with.
    #[must_use]
    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    /// Isolation mode passed through at registration (§4.13).
    #[must_use]
    pub fn isolation(&self) -> IsolationMode {
        self.isolation
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        self.state.read().status
    }

    /// Number of restarts performed so far.
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.state.read().restart_count
    }

    /// Epoch-millis timestamp of the most recent successful start, if any.
    #[must_use]
    pub fn started_at(&self) -> Option<u64> {
        self.state.read().started_at
    }

    /// Epoch-millis timestamp of the most recent healthy probe, if any.
    #[must_use]
    pub fn last_healthy(&self) -> Option<u64> {
        self.state.read().last_healthy
    }

    /// The connected client, if currently started.
    #[must_use]
    pub fn client(&self) -> Option<Arc<dyn McpClient>> {
        self.client.read().clone()
    }

    pub(crate) fn set_client(&self, client: Option<Arc<dyn McpClient>>) {
        *self.client.write() = client;
    }

    pub(crate) fn set_status(&self, status: ServerStatus) {
        self.state.write().status = status;
    }

    /// Transition Starting→Healthy on a successful initial probe, recording
    /// the start timestamp (I4).
    pub(crate) fn mark_started_healthy(&self) {
        let mut state = self.state.write();
        state.status = ServerStatus::Healthy;
        state.started_at = Some(epoch_millis_now());
        state.last_healthy = Some(epoch_millis_now());
    }

    /// Record a healthy probe outcome without touching `started_at`.
    pub(crate) fn mark_healthy(&self) {
        let mut state = self.state.write();
        state.status = ServerStatus::Healthy;
        state.last_healthy = Some(epoch_millis_now());
    }

    pub(crate) fn mark_unhealthy(&self) {
        self.state.write().status = ServerStatus::Unhealthy;
    }

    pub(crate) fn begin_restart(&self) {
        let mut state = self.state.write();
        state.status = ServerStatus::Restarting;
        state.restart_count += 1;
    }

    pub(crate) fn mark_stopped(&self) {
        let mut state = self.state.write();
        state.status = ServerStatus::Stopped;
        state.started_at = None;
    }

    /// Transition into the terminal Failed state (I6).
    pub(crate) fn mark_failed(&self) {
        self.state.write().status = ServerStatus::Failed;
    }

    /// Whether another restart is permitted under the configured budget.
    #[must_use]
    pub fn can_restart(&self) -> bool {
        self.config.restart_on_failure && self.restart_count() < self.config.max_restarts
    }
}
