//! LLM Service facade (C7, §4.7): request normalization, policy
//! orchestration, streaming bridging, batch fan-out.
//!
//! Grounded in the teacher's `gateway/server.rs` for lifecycle shape
//! (`start`/graceful `shutdown` with an in-flight semaphore drain) and in
//! `gateway/meta_mcp.rs` for the one-way service -> MCP collaborator
//! reference (§9 "broken by a one-way optional reference held by C7").

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::provider::circuit_breaker::CircuitState;
use crate::provider::health::HealthChecker;
use crate::provider::load_balancer::{LoadBalancer, Selection};
use crate::provider::metrics::{MetricsCollector, ServiceMetricsSnapshot};
use crate::provider::pool::{HealthStatus, ProviderPool};
use crate::provider::{
    Capabilities, GenerationRequest, GenerationResponse, Message, ProviderDriver, StreamChunk,
    ToolCall, ToolChoice, ToolGenerationRequest, ToolGenerationResponse, ToolSpec, ToolStreamChunk,
};

/// Reserved prefix distinguishing MCP-provisioned tools from caller-defined
/// ones (§4.7).
const MCP_TOOL_PREFIX: &str = "mcp_";

/// Default bounded fan-out width for [`LlmService::generate_batch`] (§4.7
/// "bounded parallel group (default width 5)").
const DEFAULT_BATCH_CONCURRENCY: usize = 5;

/// Large initial permit count for the graceful-drain semaphore, matching
/// the teacher's `inflight` gauge in `gateway/server.rs`.
const INFLIGHT_PERMITS: u32 = 10_000;

/// One-way collaborator reference for tool provisioning (§9 "cyclic
/// references ... broken by a one-way optional reference held by C7").
#[async_trait]
pub trait McpToolProvider: Send + Sync {
    /// Tools currently available across the managed MCP fleet.
    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;
}

/// Summary row for [`LlmService::list_providers`].
#[derive(Debug, Clone)]
pub struct ProviderSummary {
    /// Provider name.
    pub name: String,
    /// Configured weight.
    pub weight: u32,
    /// Current health classification.
    pub health: HealthStatus,
    /// Current circuit state.
    pub circuit_state: CircuitState,
    /// Current in-flight request count.
    pub active_requests: u32,
}

/// Result of [`LlmService::generate_structured`] (§4.7, §8 P7): never
/// throws on invalid JSON, always carries the raw text.
#[derive(Debug, Clone)]
pub struct StructuredResult {
    /// Raw driver output, fences and all.
    pub raw: String,
    /// Parsed JSON value, present only if `valid`.
    pub value: Option<serde_json::Value>,
    /// Whether `raw` parsed as JSON after fence-stripping.
    pub valid: bool,
}

/// Extracted metadata produced by [`LlmService::extract_metadata`]: a
/// fixed-shape convenience built on [`LlmService::generate_structured`] for
/// the common title/summary/tags use case.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ExtractedMetadata {
    /// Short title.
    #[serde(default)]
    pub title: String,
    /// One-paragraph summary.
    #[serde(default)]
    pub summary: String,
    /// Free-form topical tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Facade over the provider pool, load balancer, health checker, and
/// metrics collector (C7).
pub struct LlmService {
    pool: Arc<ProviderPool>,
    load_balancer: Arc<LoadBalancer>,
    health_checker: Arc<HealthChecker>,
    metrics: Arc<MetricsCollector>,
    mcp_service: RwLock<Option<Arc<dyn McpToolProvider>>>,
    batch_concurrency: usize,
    inflight: Arc<Semaphore>,
    started: AtomicBool,
}

impl LlmService {
    /// Construct a service from configuration. Call [`start`](Self::start)
    /// once before issuing requests.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let pool = Arc::new(ProviderPool::new(config.circuit_breaker.clone()));
        let metrics = Arc::new(MetricsCollector::new());
        let load_balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&pool),
            Arc::clone(&metrics),
            config.load_balancing.strategy,
        ));
        let health_checker = Arc::new(HealthChecker::new(
            Arc::clone(&pool),
            config.health_check.interval,
            config.health_check.timeout,
        ));
        Self {
            pool,
            load_balancer,
            health_checker,
            metrics,
            mcp_service: RwLock::new(None),
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
            inflight: Arc::new(Semaphore::new(INFLIGHT_PERMITS as usize)),
            started: AtomicBool::new(false),
        }
    }

    /// Attach (or detach) the MCP tool-provisioning collaborator (§9
    /// `set_mcp_service`).
    pub fn set_mcp_service(&self, provider: Option<Arc<dyn McpToolProvider>>) {
        *self.mcp_service.write() = provider;
    }

    /// Start the service: begins the background health-check loop. Must be
    /// called once per service lifetime.
    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.health_checker.start();
    }

    /// Gracefully drain: stop admitting new in-flight work and wait up to
    /// `deadline` for currently in-flight requests to complete, then close
    /// every provider driver (teacher's `gateway/server.rs` drain idiom).
    pub async fn shutdown(&self, deadline: Duration) {
        self.started.store(false, Ordering::SeqCst);
        self.health_checker.stop();

        match tokio::time::timeout(deadline, self.inflight.acquire_many(INFLIGHT_PERMITS)).await {
            Ok(Ok(_permits)) => tracing::info!("llm service drained cleanly"),
            Ok(Err(_)) => tracing::warn!("inflight semaphore closed unexpectedly during drain"),
            Err(_) => {
                let remaining = INFLIGHT_PERMITS as usize - self.inflight.available_permits();
                tracing::warn!(remaining, "drain timeout reached, proceeding with shutdown");
            }
        }

        self.pool.close().await;
    }

    fn ensure_started(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ServiceUnavailable("service not started".to_string()))
        }
    }

    /// Select an eligible provider via C5; if none is eligible, fall back to
    /// asking every registered entry's circuit breaker directly, which is
    /// how a timed-out `Open` entry is admitted as the single HalfOpen
    /// probe (§4.4, §8 scenario 2) even though it is not `eligible` in the
    /// §4.5 sense.
    fn select_provider(&self) -> Result<Selection> {
        match self.load_balancer.select() {
            Ok(selection) => Ok(selection),
            Err(Error::NoProvidersAvailable) => self
                .pool
                .list()
                .into_iter()
                .find(|entry| entry.can_proceed())
                .map(LoadBalancer::adopt)
                .ok_or(Error::NoProvidersAvailable),
            Err(other) => Err(other),
        }
    }

    fn finish_request(&self, selection: &Selection, elapsed: Duration, success: bool, error_kind: Option<crate::error::ErrorKind>, usage: Option<(u32, u32, u32)>) {
        let name = selection.entry.name().to_string();
        if success {
            self.pool.record_success(&name);
        } else {
            self.pool.record_failure(&name);
        }
        #[allow(clippy::cast_possible_truncation)]
        let latency_ms = elapsed.as_millis() as u64;
        self.metrics.record(&name, latency_ms, success, error_kind, usage);
        selection.finish();
    }

    /// Produce a plain completion (§4.7 steps 1-7).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceUnavailable`] if not started,
    /// [`Error::NoProvidersAvailable`] if no provider can be admitted, or a
    /// [`Error::GenerationFailed`] wrapping the driver's error.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        self.ensure_started()?;
        let _permit = self.acquire_inflight().await?;
        let selection = self.select_provider()?;
        let driver = selection.entry.driver();
        let started = Instant::now();
        let result = driver.generate(request).await;
        self.finish_request(&selection, started.elapsed(), result.is_ok(), result.as_ref().err().map(crate::error::Error::kind), result.as_ref().ok().and_then(usage_triple));
        result.map(|resp| GenerationResponse { provider: selection.entry.name().to_string(), ..resp }).map_err(|e| e.context("generation failed"))
    }

    /// Produce a streaming completion, delivering ordered chunks to `sink`
    /// (§4.7, §5 "stream callbacks receive no further chunks after
    /// cancellation", §8 scenario 5).
    ///
    /// # Errors
    ///
    /// See [`generate`](Self::generate); additionally returns
    /// [`Error::StreamingFailed`] if the driver fails mid-stream and
    /// [`Error::StreamingNotSupported`] if the driver declares no streaming
    /// capability.
    pub async fn stream(&self, request: &GenerationRequest, sink: &mut (dyn FnMut(StreamChunk) + Send)) -> Result<()> {
        self.ensure_started()?;
        let _permit = self.acquire_inflight().await?;
        let selection = self.select_provider()?;
        let driver = selection.entry.driver();
        if !driver.capabilities().streaming {
            selection.finish();
            return Err(Error::StreamingNotSupported(selection.entry.name().to_string()));
        }
        let started = Instant::now();
        let result = driver.stream(request, sink).await;
        self.finish_request(&selection, started.elapsed(), result.is_ok(), result.as_ref().err().map(crate::error::Error::kind), None);
        result.map_err(|e| {
            if matches!(e, Error::Canceled) { e } else { e.context("streaming failed") }
        })
    }

    /// Tool-augmented completion (§4.7 "Tool-augmented paths"): silently
    /// degrades when the driver lacks `tool_calls` capability (§8 scenario
    /// 6), and auto-attaches MCP-provisioned tools under the `mcp_` prefix
    /// when the caller supplied none and a collaborator is attached.
    ///
    /// # Errors
    ///
    /// See [`generate`](Self::generate).
    pub async fn generate_with_tools(&self, request: &ToolGenerationRequest) -> Result<ToolGenerationResponse> {
        self.ensure_started()?;
        let _permit = self.acquire_inflight().await?;
        let selection = self.select_provider()?;
        let driver = selection.entry.driver();

        if !driver.capabilities().tool_calls {
            let started = Instant::now();
            let result = driver.generate(&request.request).await;
            self.finish_request(&selection, started.elapsed(), result.is_ok(), result.as_ref().err().map(crate::error::Error::kind), result.as_ref().ok().and_then(usage_triple));
            return result
                .map(|response| ToolGenerationResponse { response, tool_calls: Vec::new() })
                .map_err(|e| e.context("generation failed"));
        }

        let request = self.attach_mcp_tools(request.clone()).await?;
        let started = Instant::now();
        let result = driver.generate_with_tools(&request).await;
        self.finish_request(&selection, started.elapsed(), result.is_ok(), result.as_ref().err().map(crate::error::Error::kind), result.as_ref().ok().and_then(|r| usage_triple(&r.response)));
        result.map_err(|e| e.context("tool generation failed"))
    }

    /// Streaming tool-augmented completion; mirrors
    /// [`generate_with_tools`](Self::generate_with_tools)'s degradation and
    /// tool-attachment rules.
    ///
    /// # Errors
    ///
    /// See [`stream`](Self::stream).
    pub async fn stream_with_tools(&self, request: &ToolGenerationRequest, sink: &mut (dyn FnMut(ToolStreamChunk) + Send)) -> Result<()> {
        self.ensure_started()?;
        let _permit = self.acquire_inflight().await?;
        let selection = self.select_provider()?;
        let driver = selection.entry.driver();

        if !driver.capabilities().tool_calls {
            let mut plain_sink = |chunk: StreamChunk| {
                sink(ToolStreamChunk { chunk, tool_calls: Vec::new() });
            };
            let started = Instant::now();
            let result = driver.stream(&request.request, &mut plain_sink).await;
            self.finish_request(&selection, started.elapsed(), result.is_ok(), result.as_ref().err().map(crate::error::Error::kind), None);
            return result.map_err(|e| e.context("streaming failed"));
        }

        let request = self.attach_mcp_tools(request.clone()).await?;
        let started = Instant::now();
        let result = driver.stream_with_tools(&request, sink).await;
        self.finish_request(&selection, started.elapsed(), result.is_ok(), result.as_ref().err().map(crate::error::Error::kind), None);
        result.map_err(|e| e.context("tool streaming failed"))
    }

    async fn attach_mcp_tools(&self, mut request: ToolGenerationRequest) -> Result<ToolGenerationRequest> {
        if !request.tools.is_empty() {
            return Ok(request);
        }
        let provider = self.mcp_service.read().clone();
        if let Some(provider) = provider {
            let mut tools = provider.list_tools().await?;
            for tool in &mut tools {
                if !tool.name.starts_with(MCP_TOOL_PREFIX) {
                    tool.name = format!("{MCP_TOOL_PREFIX}{}", tool.name);
                }
            }
            request.tools = tools;
        }
        Ok(request)
    }

    /// Fan out `requests` into a bounded parallel group (§4.7, §8 P8).
    /// Individual failures are suppressed from the result list unless every
    /// request fails, in which case the batch itself fails
    /// `GenerationFailed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GenerationFailed`] only if every request failed.
    pub async fn generate_batch(&self, requests: Vec<GenerationRequest>) -> Result<Vec<GenerationResponse>> {
        self.ensure_started()?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let semaphore = Arc::new(Semaphore::new(self.batch_concurrency));
        let futures = requests.into_iter().map(|request| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.expect("batch semaphore is never closed");
                self.generate(&request).await
            }
        });
        let results = futures::future::join_all(futures).await;
        let successes: Vec<GenerationResponse> = results.iter().filter_map(|r| r.as_ref().ok().cloned()).collect();
        if successes.is_empty() {
            return Err(Error::GenerationFailed("all requests in batch failed".to_string()));
        }
        Ok(successes)
    }

    /// Structured generation (§4.7, §8 P7): appends the schema/example to
    /// the prompt, strips code fences from the driver's output, and parses
    /// it as JSON. Never throws on invalid JSON — `valid` carries that
    /// instead.
    ///
    /// # Errors
    ///
    /// See [`generate`](Self::generate) (the underlying driver call only).
    pub async fn generate_structured(&self, mut request: GenerationRequest, schema: &serde_json::Value, example: Option<&serde_json::Value>) -> Result<StructuredResult> {
        let mut prompt = request.prompt.clone();
        prompt.push_str("\n\nRespond with JSON only, matching this schema:\n");
        prompt.push_str(&schema.to_string());
        if let Some(example) = example {
            prompt.push_str("\n\nExample:\n");
            prompt.push_str(&example.to_string());
        }
        request.prompt = prompt;
        request.parameters.insert("response_format".to_string(), serde_json::json!({"type": "json_object"}));

        let response = self.generate(&request).await?;
        Ok(Self::parse_structured(response.content))
    }

    fn parse_structured(raw: String) -> StructuredResult {
        let trimmed = strip_json_fences(&raw);
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => StructuredResult { raw, value: Some(value), valid: true },
            Err(_) => StructuredResult { raw, value: None, valid: false },
        }
    }

    /// Extract title/summary/tags metadata from `text` via
    /// [`generate_structured`](Self::generate_structured) against a fixed
    /// schema. Returns `None` if the driver's output did not parse or did
    /// not match the expected shape, matching the non-throwing contract of
    /// structured generation.
    ///
    /// # Errors
    ///
    /// See [`generate`](Self::generate) (the underlying driver call only).
    pub async fn extract_metadata(&self, text: &str) -> Result<Option<ExtractedMetadata>> {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "summary": {"type": "string"},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["title", "summary", "tags"]
        });
        let request = GenerationRequest {
            prompt: format!("Extract a short title, one-paragraph summary, and topical tags for the following text:\n\n{text}"),
            ..Default::default()
        };
        let structured = self.generate_structured(request, &schema, None).await?;
        Ok(structured.value.and_then(|v| serde_json::from_value(v).ok()))
    }

    /// Register a new provider (§4.2 `add`), triggering an immediate probe
    /// so it is not left `Unknown` until the next periodic round.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderAlreadyExists`] if already registered.
    pub async fn add_provider(&self, driver: Arc<dyn ProviderDriver>, weight: u32) -> Result<()> {
        self.pool.add(driver, weight)?;
        self.health_checker.check_now().await;
        Ok(())
    }

    /// Remove a provider, severing its driver.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderNotFound`] if not registered.
    pub async fn remove_provider(&self, name: &str) -> Result<()> {
        self.pool.remove(name).await
    }

    /// Summaries of every registered provider.
    #[must_use]
    pub fn list_providers(&self) -> Vec<ProviderSummary> {
        self.pool
            .list()
            .into_iter()
            .map(|entry| ProviderSummary {
                name: entry.name().to_string(),
                weight: entry.weight(),
                health: entry.health(),
                circuit_state: entry.circuit_state(),
                active_requests: entry.active_requests(),
            })
            .collect()
    }

    /// Current health classification for one provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderNotFound`] if not registered.
    pub fn get_provider_health(&self, name: &str) -> Result<HealthStatus> {
        self.pool.get(name).map(|e| e.health()).ok_or_else(|| Error::ProviderNotFound(name.to_string()))
    }

    /// Synchronously probe every provider now (§4.3 `check_now`).
    pub async fn trigger_health_check(&self) -> HashMap<String, HealthStatus> {
        self.health_checker.check_now().await
    }

    /// Service-wide metrics snapshot (C6).
    #[must_use]
    pub fn get_metrics(&self) -> ServiceMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn acquire_inflight(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.inflight.acquire().await.map_err(|_| Error::ServiceUnavailable("service is draining".to_string()))
    }
}

/// Build the message list the driver sees from `context` + `prompt`,
/// defaulting unknown roles to `"user"` (§4.7 step 4).
#[must_use]
pub fn build_driver_messages(context: &[Message], prompt: &str) -> Vec<Message> {
    let mut messages: Vec<Message> = context
        .iter()
        .map(|m| Message {
            role: Message::normalize_role(&m.role).to_string(),
            content: m.content.clone(),
            tool_call_id: m.tool_call_id.clone(),
        })
        .collect();
    messages.push(Message { role: "user".to_string(), content: prompt.to_string(), tool_call_id: None });
    messages
}

fn usage_triple(response: &GenerationResponse) -> Option<(u32, u32, u32)> {
    response.usage.map(|u| (u.prompt_tokens, u.completion_tokens, u.total_tokens))
}

fn strip_json_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(without_open) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let without_open = without_open.strip_prefix("json").unwrap_or(without_open);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}
