//! Error taxonomy for the gateway control plane (§7 of the specification).
//!
//! One flat `thiserror` enum, no class hierarchy: callers match on variants,
//! and [`Error::kind`] buckets them into the coarse taxonomy the metrics
//! collector (C6) records errors-by-kind under.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway control-plane errors (§7).
#[derive(Error, Debug)]
pub enum Error {
    /// No provider registered under this name.
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    /// A provider with this name is already registered.
    #[error("provider already exists: {0}")]
    ProviderAlreadyExists(String),

    /// No MCP server registered under this name.
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// An MCP server with this name is already registered.
    #[error("server already exists: {0}")]
    ServerAlreadyExists(String),

    /// No tool registered under this id, or the tool is unavailable.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The circuit breaker rejected the request (Open state).
    #[error("provider unhealthy: {0}")]
    ProviderUnhealthy(String),

    /// The MCP server is unhealthy or unreachable.
    #[error("server unhealthy: {0}")]
    ServerUnhealthy(String),

    /// The load balancer found no eligible provider.
    #[error("no providers available")]
    NoProvidersAvailable,

    /// The service has not been started, or is draining/shut down.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The driver returned an error while generating a plain completion.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// The driver does not support streaming.
    #[error("streaming not supported by provider: {0}")]
    StreamingNotSupported(String),

    /// The driver returned an error while streaming a completion.
    #[error("streaming failed: {0}")]
    StreamingFailed(String),

    /// The driver returned an error while generating with tools attached.
    #[error("tool generation failed: {0}")]
    ToolGenerationFailed(String),

    /// The driver returned an error while streaming with tools attached.
    #[error("tool streaming failed: {0}")]
    ToolStreamingFailed(String),

    /// An MCP tool call returned a non-retryable failure.
    #[error("tool call failed: {0}")]
    ToolCallFailed(String),

    /// A tool execution exhausted its retry budget.
    #[error("tool execution failed: {0}")]
    ToolExecutionFailed(String),

    /// A driver or MCP client violated the expected protocol shape.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A rate limit or quota was exceeded.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A provider-level request exceeded its effective deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A tool call exceeded its per-tool timeout.
    #[error("tool timeout: {0}")]
    ToolTimeout(String),

    /// The caller's request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration is structurally invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A single-field validation failure.
    #[error("validation failed for {field}={value}: {message}")]
    Validation {
        /// Field name.
        field: String,
        /// Offending value, stringified.
        value: String,
        /// Human-readable explanation.
        message: String,
    },

    /// A configuration problem localized to one component/field.
    #[error("configuration error in {component}.{field}: {message}")]
    Configuration {
        /// Component name (e.g. `load_balancing`).
        component: String,
        /// Field name within the component.
        field: String,
        /// Human-readable explanation.
        message: String,
        /// Underlying cause, if any.
        #[source]
        cause: Option<Box<Error>>,
    },

    /// A transport-level failure talking to an external host.
    #[error("network error ({operation} {host}): {message}")]
    Network {
        /// Remote host or address.
        host: String,
        /// Operation being attempted (e.g. "connect", "probe").
        operation: String,
        /// Human-readable explanation.
        message: String,
        /// Underlying cause, if any.
        #[source]
        cause: Option<Box<Error>>,
    },

    /// The operation was canceled by the caller before completion.
    #[error("canceled")]
    Canceled,

    /// Caller is not authorized to perform the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Generic not-found, for identities outside the core's own taxonomy
    /// (documents, workflows, agents — §7 names these as siblings the core
    /// does not otherwise use).
    #[error("not found: {0}")]
    NotFound(String),

    /// Catch-all for conditions with no more specific taxonomy entry.
    #[error("internal error: {0}")]
    Internal(String),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem I/O failure (tool registry persistence, config loading).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classification the metrics collector (§4.6) records
/// errors-by-kind under: `{timeout, network, generation_failed,
/// streaming_failed, tool_generation_failed, tool_streaming_failed,
/// provider_unhealthy}`, plus an `other` bucket for the rest of §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Request exceeded its effective deadline.
    Timeout,
    /// Transport-level failure.
    Network,
    /// Plain generation failed.
    GenerationFailed,
    /// Streaming generation failed.
    StreamingFailed,
    /// Tool-augmented generation failed.
    ToolGenerationFailed,
    /// Tool-augmented streaming failed.
    ToolStreamingFailed,
    /// Circuit breaker rejected the request.
    ProviderUnhealthy,
    /// Anything not covered by the above.
    Other,
}

impl ErrorKind {
    /// Stable lowercase label, used as a metrics map key.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::GenerationFailed => "generation_failed",
            Self::StreamingFailed => "streaming_failed",
            Self::ToolGenerationFailed => "tool_generation_failed",
            Self::ToolStreamingFailed => "tool_streaming_failed",
            Self::ProviderUnhealthy => "provider_unhealthy",
            Self::Other => "other",
        }
    }
}

impl Error {
    /// Classify this error into the §4.6 metrics bucket.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) | Self::ToolTimeout(_) => ErrorKind::Timeout,
            Self::Network { .. } => ErrorKind::Network,
            Self::GenerationFailed(_) => ErrorKind::GenerationFailed,
            Self::StreamingFailed(_) => ErrorKind::StreamingFailed,
            Self::ToolGenerationFailed(_) => ErrorKind::ToolGenerationFailed,
            Self::ToolStreamingFailed(_) => ErrorKind::ToolStreamingFailed,
            Self::ProviderUnhealthy(_) => ErrorKind::ProviderUnhealthy,
            _ => ErrorKind::Other,
        }
    }

    /// Wrap with a short context prefix (§6 "Error surface"), preserving
    /// the variant so classification still works.
    #[must_use]
    pub fn context(self, prefix: &str) -> Self {
        match self {
            Self::GenerationFailed(m) => Self::GenerationFailed(format!("{prefix}: {m}")),
            Self::StreamingFailed(m) => Self::StreamingFailed(format!("{prefix}: {m}")),
            Self::ToolGenerationFailed(m) => Self::ToolGenerationFailed(format!("{prefix}: {m}")),
            Self::ToolStreamingFailed(m) => Self::ToolStreamingFailed(format!("{prefix}: {m}")),
            other => other,
        }
    }

    /// True if this error's message substring-matches one of `patterns`,
    /// case-insensitively (§4.13 step 6, the tool executor's retry gate).
    #[must_use]
    pub fn matches_any_pattern(&self, patterns: &[String]) -> bool {
        let text = self.to_string().to_lowercase();
        patterns.iter().any(|p| text.contains(&p.to_lowercase()))
    }

    /// Default retryable-error substrings (§4.13 step 6) used when no
    /// user-configured patterns are supplied.
    #[must_use]
    pub fn default_retryable_patterns() -> Vec<String> {
        ["timeout", "connection refused", "temporary failure", "rate limit"]
            .iter()
            .map(|s| (*s).to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classifies_timeout_variants() {
        assert_eq!(Error::Timeout("x".into()).kind(), ErrorKind::Timeout);
        assert_eq!(Error::ToolTimeout("x".into()).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn kind_defaults_to_other() {
        assert_eq!(Error::Internal("x".into()).kind(), ErrorKind::Other);
        assert_eq!(Error::Canceled.kind(), ErrorKind::Other);
    }

    #[test]
    fn context_prefixes_message_and_preserves_variant() {
        let e = Error::GenerationFailed("boom".into()).context("generation failed");
        assert!(matches!(e, Error::GenerationFailed(_)));
        assert_eq!(e.to_string(), "generation failed: boom");
    }

    #[test]
    fn matches_any_pattern_is_case_insensitive() {
        let e = Error::Network {
            host: "h".into(),
            operation: "call".into(),
            message: "Connection Refused".into(),
            cause: None,
        };
        assert!(e.matches_any_pattern(&["connection refused".to_string()]));
        assert!(!e.matches_any_pattern(&["timeout".to_string()]));
    }

    #[test]
    fn default_retryable_patterns_cover_spec_defaults() {
        let patterns = Error::default_retryable_patterns();
        assert!(patterns.iter().any(|p| p == "rate limit"));
        assert_eq!(patterns.len(), 4);
    }
}
