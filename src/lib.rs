//! LLM Gateway Core
//!
//! Provider pool, load balancing, and circuit breaking for a
//! multi-provider LLM gateway, plus an MCP tool execution control plane
//! that manages MCP server processes, discovers and caches their tools,
//! and dispatches calls against them with retries and rate limiting.
//!
//! # Features
//!
//! - **Provider pool**: health-checked, load-balanced fan-out across
//!   multiple LLM backends with per-provider circuit breaking.
//! - **MCP control plane**: server lifecycle, health monitoring, tool
//!   discovery, a versioned tool registry, result caching, and a
//!   worker-pool tool executor.
//! - **Resilience**: circuit breakers, retries with backoff, per-tool rate
//!   limiting, graceful shutdown draining in-flight work.
//! - **Observability**: structured `tracing`, provider and MCP metrics
//!   collectors.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod mcp;
pub mod provider;
pub mod retry;
pub mod service;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global `tracing` subscriber.
///
/// `level` is used as the default filter when `RUST_LOG` is unset.
/// `format` of `Some("json")` emits structured JSON; anything else falls
/// back to human-readable text.
///
/// # Errors
/// Never fails today; returns `Result` so callers can propagate future
/// subscriber-construction failures without a signature change.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).init(),
        _ => subscriber.with(fmt::layer()).init(),
    }

    Ok(())
}
