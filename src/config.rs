//! Configuration for the gateway control plane (§6 "Configuration recognized
//! options").
//!
//! Loaded the way the teacher loads its own: a YAML file merged with
//! prefixed environment variables via `figment`, every sub-struct carrying
//! `#[serde(default)]` so a partial file (or none at all) still produces a
//! usable [`Config`].

use std::{collections::HashMap, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Root configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Load-balancing strategy selection and its own health-check knobs.
    pub load_balancing: LoadBalancingConfig,
    /// Provider health-checker cadence.
    pub health_check: HealthCheckConfig,
    /// Per-provider circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Provider name -> provider configuration.
    pub providers: HashMap<String, ProviderConfig>,
    /// MCP server fleet and tool-execution configuration.
    pub mcp: McpConfig,
}

impl Config {
    /// Load configuration from an optional YAML file merged with
    /// `LLM_GATEWAY_`-prefixed environment variables (`__` as the nesting
    /// separator, matching the teacher's `MCP_GATEWAY_` convention).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the file is missing or the
    /// merged document does not match this shape.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::InvalidConfiguration(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("LLM_GATEWAY_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))
    }

    /// Providers configured with non-zero weight; §9's weight=0 resolution
    /// ("excluded from weighted candidacy only") means this is consulted by
    /// the weighted strategy alone, not by eligibility filtering.
    pub fn weighted_providers(&self) -> impl Iterator<Item = (&String, &ProviderConfig)> {
        self.providers.iter().filter(|(_, p)| p.weight > 0)
    }
}

/// Load-balancing strategy (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Global monotone counter modulo eligible count.
    #[default]
    RoundRobin,
    /// Cumulative-weight random selection.
    Weighted,
    /// Minimum active-request gauge.
    LeastConnections,
    /// Minimum exponentially-smoothed average latency.
    ResponseTime,
    /// Composite success-rate/latency/load/weight score.
    Adaptive,
}

/// Load balancer configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    /// Selection strategy.
    pub strategy: LoadBalancingStrategy,
    /// Whether eligibility should consult the health checker at all (when
    /// false, only circuit state gates eligibility).
    pub health_check: bool,
    /// Interval between unsolicited eligibility re-evaluations.
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            health_check: true,
            check_interval: Duration::from_secs(30),
        }
    }
}

/// Health checker configuration (§4.3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable the periodic health-check loop.
    pub enabled: bool,
    /// Interval between probe rounds.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Per-probe bounded timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Consecutive-failure count used elsewhere for retry budgets.
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retries: 3,
        }
    }
}

/// Circuit breaker configuration (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before Closed -> Open (`maxFailures`, default 3).
    pub failure_threshold: u32,
    /// Time after which Open -> HalfOpen becomes admissible.
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// One backend provider entry (§6 "providers" map).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Driver type tag, resolved by the driver factory (§6).
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Base URL for the backend API, if applicable.
    pub base_url: Option<String>,
    /// API key, if applicable (supports `env:VAR` expansion the way the
    /// teacher's `ApiKeyConfig::resolve_key` does).
    pub api_key: Option<String>,
    /// Model name to request from this provider.
    pub model: String,
    /// Opaque passthrough parameters for the driver.
    pub parameters: HashMap<String, serde_json::Value>,
    /// Selection weight; 0 is permitted (§3, §9 Open Question resolution).
    pub weight: u32,
    /// Per-provider request timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: String::new(),
            base_url: None,
            api_key: None,
            model: String::new(),
            parameters: HashMap::new(),
            weight: 1,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ProviderConfig {
    /// Resolve `api_key`, expanding an `env:VAR_NAME` value the way the
    /// teacher's `ApiKeyConfig::resolve_key` does.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.as_ref().map(|key| {
            key.strip_prefix("env:")
                .map(|var| std::env::var(var).unwrap_or_else(|_| key.clone()))
                .unwrap_or_else(|| key.clone())
        })
    }
}

/// MCP fleet configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    /// Optional directory of server-definition files, scanned at startup.
    pub servers_path: Option<String>,
    /// Statically configured server entries.
    pub servers: Vec<McpServerConfig>,
    /// Interval between MCP health-monitor rounds (C9).
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Tool cache capacity (C12 `max_size`).
    pub cache_size: usize,
    /// Default tool cache entry TTL.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Tool executor worker-pool and cache-enable knobs.
    pub tool_execution: ToolExecutionConfig,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            servers_path: None,
            servers: Vec::new(),
            health_check_interval: Duration::from_secs(30),
            cache_size: 10_000,
            cache_ttl: Duration::from_secs(300),
            tool_execution: ToolExecutionConfig::default(),
        }
    }
}

/// Tool executor configuration (§4.13).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolExecutionConfig {
    /// Worker pool size (default 10).
    pub max_concurrent: usize,
    /// Per-tool default timeout when the tool itself declares none.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Whether cacheable tool results consult the tool cache.
    pub enable_cache: bool,
    /// Default per-entry cache TTL.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for ToolExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            default_timeout: Duration::from_secs(30),
            enable_cache: true,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// One MCP server entry (§6 "server entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    /// Unique server name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Spawn command.
    pub command: String,
    /// Spawn arguments.
    pub args: Vec<String>,
    /// Spawn environment variables.
    pub env: HashMap<String, String>,
    /// Spawn working directory.
    pub working_dir: Option<String>,
    /// Per-call timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Retry budget surfaced to the tool executor for calls to this server.
    pub retries: u32,
    /// Register and start automatically during service startup.
    pub auto_start: bool,
    /// Restart on health-monitor failure (C9).
    pub restart_on_failure: bool,
    /// Maximum automatic restarts (C9/C8 `restart`).
    pub max_restarts: u32,
    /// Delay before the restarted process is started again.
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,
    /// Declared capability tags, passed through to C8 registration.
    pub capabilities: Vec<String>,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            timeout: Duration::from_secs(30),
            retries: 3,
            auto_start: false,
            restart_on_failure: true,
            max_restarts: 5,
            restart_delay: Duration::from_secs(2),
            capabilities: Vec::new(),
        }
    }
}

/// Human-readable duration (de)serialization, matching the teacher's
/// hand-rolled `humantime_serde` module (no external crate: `"30s"`,
/// `"5m"`, `"100ms"`, or a bare integer taken as seconds).
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize as a whole-second, unit-suffixed string.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize `"30s"`, `"5m"`, `"100ms"`, or a bare integer (seconds).
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
