//! Demo binary: wires a mock provider driver and a mock MCP client into the
//! library to exercise the generation path and the MCP tool-execution path
//! end to end, without any real backend or MCP server process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use tracing::info;

use llm_gateway_core::config::{Config, McpServerConfig};
use llm_gateway_core::error::Result;
use llm_gateway_core::mcp::cache::{EvictionPolicy, ToolCache};
use llm_gateway_core::mcp::discovery::DiscoveryService;
use llm_gateway_core::mcp::health_monitor::McpHealthMonitor;
use llm_gateway_core::mcp::manager::McpManager;
use llm_gateway_core::mcp::metrics::McpMetricsCollector;
use llm_gateway_core::mcp::registry::ToolRegistry;
use llm_gateway_core::mcp::{
    IsolationMode, McpClient, McpClientFactory, ServerInfo, ToolCallOutcome, ToolSpec,
};
use llm_gateway_core::provider::{
    Capabilities, GenerationRequest, GenerationResponse, ProviderDriver, StreamChunk,
    ToolGenerationRequest, ToolGenerationResponse, ToolStreamChunk,
};
use llm_gateway_core::service::LlmService;
use llm_gateway_core::{setup_tracing, Error};

/// Runs a fixed demo sequence against mock backends.
#[derive(Parser, Debug)]
#[command(name = "llm-gateway-demo")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML); defaults built in if absent.
    #[arg(short, long, env = "LLM_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "LLM_GATEWAY_LOG_LEVEL")]
    log_level: String,

    /// Log format (text, json).
    #[arg(long, env = "LLM_GATEWAY_LOG_FORMAT")]
    log_format: Option<String>,
}

/// A deterministic in-memory [`ProviderDriver`] for the demo.
struct MockProvider {
    name: String,
}

#[async_trait]
impl ProviderDriver for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-echo-1"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { streaming: true, tool_calls: false, batch: true, max_tokens: 4096, max_context: 8192 }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        Ok(GenerationResponse {
            content: format!("echo: {}", request.prompt),
            provider: self.name.clone(),
            model: self.model().to_string(),
            usage: None,
        })
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        sink: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> Result<()> {
        let mut content = String::new();
        for word in request.prompt.split_whitespace() {
            let delta = format!("{word} ");
            content.push_str(&delta);
            sink(StreamChunk { content: content.clone(), delta, finished: false, usage: None });
        }
        sink(StreamChunk { content, delta: String::new(), finished: true, usage: None });
        Ok(())
    }

    async fn generate_with_tools(&self, _request: &ToolGenerationRequest) -> Result<ToolGenerationResponse> {
        Err(Error::ToolGenerationFailed("mock provider does not support tool calls".into()))
    }

    async fn stream_with_tools(
        &self,
        _request: &ToolGenerationRequest,
        _sink: &mut (dyn FnMut(ToolStreamChunk) + Send),
    ) -> Result<()> {
        Err(Error::ToolStreamingFailed("mock provider does not support tool calls".into()))
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A single-tool in-memory [`McpClient`] for the demo.
struct MockMcpClient {
    tool: ToolSpec,
}

#[async_trait]
impl McpClient for MockMcpClient {
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
        Ok(HashMap::from([(self.tool.name.clone(), self.tool.clone())]))
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolCallOutcome> {
        if name != self.tool.name {
            return Ok(ToolCallOutcome { success: false, data: None, error: Some(format!("unknown tool {name}")) });
        }
        Ok(ToolCallOutcome { success: true, data: Some(json!({"echoed": args})), error: None })
    }

    fn get_server_info(&self) -> ServerInfo {
        ServerInfo { name: "demo-fs".into(), version: "0.1.0".into() }
    }
}

struct MockMcpClientFactory;

impl McpClientFactory for MockMcpClientFactory {
    fn build(&self, _config: &McpServerConfig, _isolation: IsolationMode) -> Arc<dyn McpClient> {
        Arc::new(MockMcpClient {
            tool: ToolSpec {
                name: "read_file".into(),
                description: "Reads a file from the local filesystem".into(),
                input_schema: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
            },
        })
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("failed to set up tracing: {e}");
        return std::process::ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration, using defaults");
            Config::default()
        }
    };

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "demo run failed");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn run(config: Config) -> Result<()> {
    let service = Arc::new(LlmService::new(&config));
    service.add_provider(Arc::new(MockProvider { name: "mock-1".into() }), 1).await?;
    service.start();

    let response = service
        .generate(&GenerationRequest { prompt: "hello gateway".into(), ..Default::default() })
        .await?;
    info!(content = %response.content, provider = %response.provider, "generation complete");

    let manager = Arc::new(McpManager::new(Arc::new(MockMcpClientFactory)));
    let registry = Arc::new(ToolRegistry::new());
    let cache = Arc::new(ToolCache::new(EvictionPolicy::Lru, config.mcp.cache_size, None));
    let metrics = Arc::new(McpMetricsCollector::new());

    manager
        .register(
            McpServerConfig { name: "demo-fs".into(), command: "true".into(), ..Default::default() },
            IsolationMode::None,
        )
        .await?;

    let discovery = Arc::new(DiscoveryService::new(
        Arc::clone(&manager),
        Arc::clone(&registry),
        Duration::from_secs(60),
        DiscoveryService::default_registry_path(),
    ));
    discovery.run_once().await;
    info!(tool_count = registry.list().len(), version = registry.version(), "tool discovery round complete");

    let health_monitor = Arc::new(McpHealthMonitor::new(Arc::clone(&manager), Duration::from_secs(30)));
    let _ = health_monitor.check_now().await;

    let executor = Arc::new(llm_gateway_core::mcp::executor::ToolExecutor::new(
        Arc::clone(&registry),
        Arc::clone(&manager),
        cache,
        metrics,
        llm_gateway_core::retry::RetryPolicy::default(),
        config.mcp.tool_execution.enable_cache,
        config.mcp.cache_ttl,
        config.mcp.tool_execution.max_concurrent,
    ));

    let result = executor
        .execute(&llm_gateway_core::mcp::executor::ToolCallRequest {
            tool_id: "demo-fs:read_file".into(),
            arguments: json!({"path": "/etc/hostname"}),
        })
        .await?;
    info!(result = %result, "tool call complete");

    service.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
