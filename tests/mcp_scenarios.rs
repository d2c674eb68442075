//! Cross-module integration tests for the MCP control plane: a registered
//! server's tools flow through discovery into the registry, then through
//! the executor and cache, covering spec scenarios 3 and 4.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use llm_gateway_core::config::McpServerConfig;
use llm_gateway_core::error::{Error, Result};
use llm_gateway_core::mcp::cache::{EvictionPolicy, ToolCache};
use llm_gateway_core::mcp::discovery::DiscoveryService;
use llm_gateway_core::mcp::executor::{ToolCallRequest, ToolExecutor};
use llm_gateway_core::mcp::manager::McpManager;
use llm_gateway_core::mcp::metrics::McpMetricsCollector;
use llm_gateway_core::mcp::registry::ToolRegistry;
use llm_gateway_core::mcp::{IsolationMode, McpClient, McpClientFactory, ServerInfo, ToolCallOutcome, ToolSpec};
use llm_gateway_core::retry::RetryPolicy;

struct CountingClient {
    tool: ToolSpec,
    calls: AtomicU32,
    connected: std::sync::atomic::AtomicBool,
    unreachable: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl McpClient for CountingClient {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_tools(&self) -> Result<HashMap<String, ToolSpec>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Network { host: "mock".into(), operation: "get_tools".into(), message: "connection reset".into(), cause: None });
        }
        Ok(HashMap::from([(self.tool.name.clone(), self.tool.clone())]))
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolCallOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if name != self.tool.name {
            return Ok(ToolCallOutcome { success: false, data: None, error: Some(format!("unknown tool {name}")) });
        }
        Ok(ToolCallOutcome { success: true, data: Some(json!({"echoed": args})), error: None })
    }

    fn get_server_info(&self) -> ServerInfo {
        ServerInfo { name: "files".into(), version: "1.0".into() }
    }
}

struct CountingFactory {
    client: Arc<CountingClient>,
}

impl McpClientFactory for CountingFactory {
    fn build(&self, _config: &McpServerConfig, _isolation: IsolationMode) -> Arc<dyn McpClient> {
        Arc::clone(&self.client) as Arc<dyn McpClient>
    }
}

fn read_file_tool() -> ToolSpec {
    ToolSpec { name: "read_file".into(), description: "Reads a file".into(), input_schema: json!({"type": "object"}) }
}

/// Scenario 3: a tool call result is served from cache on the second
/// invocation with identical arguments, so only one call reaches the client.
#[tokio::test]
async fn tool_cache_hit_avoids_second_client_call() {
    let client = Arc::new(CountingClient {
        tool: read_file_tool(),
        calls: AtomicU32::new(0),
        connected: std::sync::atomic::AtomicBool::new(false),
        unreachable: std::sync::atomic::AtomicBool::new(false),
    });
    let manager = Arc::new(McpManager::new(Arc::new(CountingFactory { client: Arc::clone(&client) })));
    manager.register(McpServerConfig { name: "files".into(), command: "true".into(), ..Default::default() }, IsolationMode::None).await.unwrap();

    let registry = Arc::new(ToolRegistry::new());
    let discovery = Arc::new(DiscoveryService::new(Arc::clone(&manager), Arc::clone(&registry), Duration::from_secs(60), DiscoveryService::default_registry_path()));
    discovery.run_once().await;
    assert_eq!(registry.get("files:read_file").unwrap().category, "filesystem");

    let cache = Arc::new(ToolCache::new(EvictionPolicy::Lru, 100, None));
    let metrics = Arc::new(McpMetricsCollector::new());
    let executor = Arc::new(ToolExecutor::new(
        Arc::clone(&registry),
        Arc::clone(&manager),
        cache,
        metrics,
        RetryPolicy::default(),
        true,
        Duration::from_secs(60),
        4,
    ));

    let request = ToolCallRequest { tool_id: "files:read_file".into(), arguments: json!({"path": "/etc/hostname"}) };
    let first = executor.execute(&request).await.unwrap();
    let second = executor.execute(&request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
}

/// Scenario 4: a server that goes unreachable during a discovery round has
/// its tools marked unavailable (but not deregistered), and a subsequent
/// call against one of those tools fails with `ToolNotFound` rather than
/// reaching the (now-absent) client.
#[tokio::test]
async fn discovery_downgrade_makes_tool_unavailable_to_the_executor() {
    let client = Arc::new(CountingClient {
        tool: read_file_tool(),
        calls: AtomicU32::new(0),
        connected: std::sync::atomic::AtomicBool::new(false),
        unreachable: std::sync::atomic::AtomicBool::new(false),
    });
    let manager = Arc::new(McpManager::new(Arc::new(CountingFactory { client: Arc::clone(&client) })));
    manager.register(McpServerConfig { name: "files".into(), command: "true".into(), ..Default::default() }, IsolationMode::None).await.unwrap();

    let registry = Arc::new(ToolRegistry::new());
    let discovery = Arc::new(DiscoveryService::new(Arc::clone(&manager), Arc::clone(&registry), Duration::from_secs(60), DiscoveryService::default_registry_path()));
    discovery.run_once().await;
    assert!(registry.get("files:read_file").unwrap().available);

    // Server becomes unreachable mid-session: the next discovery round's
    // tool listing call fails, downgrading its tools without deregistering it.
    client.unreachable.store(true, Ordering::SeqCst);

    discovery.run_once().await;
    let tool = registry.get("files:read_file").unwrap();
    assert!(!tool.available);
    assert_eq!(tool.server, "files");

    let cache = Arc::new(ToolCache::new(EvictionPolicy::Lru, 100, None));
    let metrics = Arc::new(McpMetricsCollector::new());
    let executor = Arc::new(ToolExecutor::new(registry, manager, cache, metrics, RetryPolicy::default(), true, Duration::from_secs(60), 4));
    let err = executor.execute(&ToolCallRequest { tool_id: "files:read_file".into(), arguments: Value::Null }).await.unwrap_err();
    assert!(matches!(err, Error::ToolNotFound(_)));
}
