//! Provider driver interface (C1) and the shared request/response types
//! every backend adapter speaks.
//!
//! Adapters are opaque: the core treats any `Err` returned from a driver
//! method as a failure signal for the circuit breaker (C4) and never
//! inspects backend-specific wire detail. This mirrors the teacher's
//! `Transport` trait in `backend/mod.rs`, generalized from MCP transports to
//! LLM backends.

pub mod circuit_breaker;
pub mod health;
pub mod load_balancer;
pub mod metrics;
pub mod pool;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// One message in a conversation (§6 inbound envelope `context`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role; unknown roles default to `"user"` per §4.7 step 4.
    pub role: String,
    /// Message content.
    pub content: String,
    /// Tool-call id this message answers, if it is a tool result.
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Normalize an arbitrary role string, defaulting unknown roles to
    /// `"user"` (§4.7 step 4).
    #[must_use]
    pub fn normalize_role(role: &str) -> &'static str {
        match role {
            "system" => "system",
            "assistant" => "assistant",
            "tool" => "tool",
            _ => "user",
        }
    }
}

/// A caller-facing generation request (§6 inbound envelope).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// The prompt proper.
    pub prompt: String,
    /// Optional model override.
    pub model: Option<String>,
    /// Prior conversation turns.
    pub context: Vec<Message>,
    /// Opaque driver-specific parameters.
    pub parameters: HashMap<String, Value>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Whether the caller asked for a streaming response.
    pub stream: bool,
}

/// Tool-choice policy for tool-augmented requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// The driver decides whether to call a tool.
    #[default]
    Auto,
    /// The driver must not call a tool.
    None,
    /// The driver must call a tool.
    Required,
}

/// A tool definition offered to the driver (§6 tool-augmented form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name, possibly `mcp_`-prefixed (§4.7).
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON-Schema describing the argument shape.
    pub input_schema: Value,
}

/// Extension of [`GenerationRequest`] for tool-augmented calls.
#[derive(Debug, Clone, Default)]
pub struct ToolGenerationRequest {
    /// The underlying generation request.
    pub request: GenerationRequest,
    /// Tools offered to the driver.
    pub tools: Vec<ToolSpec>,
    /// Tool-choice policy.
    pub tool_choice: ToolChoice,
    /// Maximum number of tool calls the driver may make.
    pub max_tool_calls: Option<u32>,
}

/// A tool invocation requested by the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique id for this call, used to correlate a later tool result.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments, as an opaque JSON value.
    pub arguments: Value,
}

/// Token usage reported by a driver, where available.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub prompt_tokens: u32,
    /// Completion tokens.
    pub completion_tokens: u32,
    /// Total tokens.
    pub total_tokens: u32,
}

/// A completed generation response.
#[derive(Debug, Clone, Default)]
pub struct GenerationResponse {
    /// Generated content.
    pub content: String,
    /// Name of the provider that produced this response.
    pub provider: String,
    /// Model that produced this response.
    pub model: String,
    /// Token usage, if the driver reports it.
    pub usage: Option<TokenUsage>,
}

/// A tool-augmented generation response (§4.7 "Tool-augmented paths").
#[derive(Debug, Clone, Default)]
pub struct ToolGenerationResponse {
    /// The underlying generation response.
    pub response: GenerationResponse,
    /// Tool calls requested by the driver (empty on graceful degradation).
    pub tool_calls: Vec<ToolCall>,
}

/// One streamed chunk (§6 streaming sinks).
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    /// Cumulative content observed so far.
    pub content: String,
    /// Just this chunk's delta.
    pub delta: String,
    /// True on the final chunk.
    pub finished: bool,
    /// Token usage, populated on the final chunk where the wire supports it.
    pub usage: Option<TokenUsage>,
}

/// A streamed chunk that also carries the accumulating tool-call list.
#[derive(Debug, Clone, Default)]
pub struct ToolStreamChunk {
    /// The underlying stream chunk.
    pub chunk: StreamChunk,
    /// Tool calls accumulated so far.
    pub tool_calls: Vec<ToolCall>,
}

/// Declared capabilities of a driver (§4.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// Whether `stream`/`stream_with_tools` are supported.
    pub streaming: bool,
    /// Whether `generate_with_tools`/`stream_with_tools` are supported.
    pub tool_calls: bool,
    /// Whether the driver can usefully participate in batch fan-out.
    pub batch: bool,
    /// Maximum tokens the driver will generate in one call.
    pub max_tokens: u32,
    /// Maximum context window, in tokens.
    pub max_context: u32,
}

/// Uniform contract every backend adapter implements (C1, §4.1).
///
/// A driver is opaque: any `Err` it returns is a failure signal for the
/// circuit breaker, with no further interpretation by the core.
#[async_trait]
pub trait ProviderDriver: Send + Sync {
    /// Provider instance name.
    fn name(&self) -> &str;

    /// Driver type tag (e.g. `"openai"`, `"anthropic"`, `"mock"`).
    fn provider_type(&self) -> &str;

    /// Configured model name.
    fn model(&self) -> &str;

    /// Declared capabilities.
    fn capabilities(&self) -> Capabilities;

    /// Produce a plain completion.
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse>;

    /// Produce a streaming completion, delivering ordered chunks to `sink`.
    async fn stream(
        &self,
        request: &GenerationRequest,
        sink: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> Result<()>;

    /// Produce a completion with tools attached.
    async fn generate_with_tools(
        &self,
        request: &ToolGenerationRequest,
    ) -> Result<ToolGenerationResponse>;

    /// Produce a streaming completion with tools attached.
    async fn stream_with_tools(
        &self,
        request: &ToolGenerationRequest,
        sink: &mut (dyn FnMut(ToolStreamChunk) + Send),
    ) -> Result<()>;

    /// Liveness probe used by the health checker (C3).
    async fn health(&self) -> Result<()>;

    /// Release any resources held by this driver (connections, processes).
    async fn close(&self) -> Result<()>;
}
