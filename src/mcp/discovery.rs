//! Tool Discovery Service (C10, §4.10): periodically catalogs tools from
//! healthy MCP servers into the [`crate::mcp::registry::ToolRegistry`],
//! persisting it across restarts.
//!
//! Background-loop shape mirrors [`crate::mcp::health_monitor::McpHealthMonitor`].
//! Persistence follows the teacher's config-loading convention of "absent
//! file is not an error, malformed file is logged and ignored" (§6).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::Result;
use crate::mcp::manager::McpManager;
use crate::mcp::registry::{DiscoveredTool, ToolRegistry};
use crate::mcp::{ServerStatus, ToolSpec};

/// Default interval between discovery rounds (§4.10 "every 60 s").
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Keyword→category table, matched case-insensitively against name then
/// description (§4.10, §9 "real case-insensitive contains").
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("filesystem", &["file", "directory", "path", "read", "write"]),
    ("network", &["http", "api", "request", "fetch", "url"]),
    ("database", &["query", "sql", "database", "table", "record"]),
    ("system", &["process", "system", "exec", "command", "shell"]),
    ("data", &["parse", "json", "xml", "csv", "transform"]),
];

/// Classify a tool into a category by keyword match against its name, then
/// its description; falls back to `"general"`.
#[must_use]
pub fn categorize(name: &str, description: &str) -> &'static str {
    let name_lower = name.to_lowercase();
    let desc_lower = description.to_lowercase();
    for (category, keywords) in CATEGORY_KEYWORDS {
        if keywords.iter().any(|kw| name_lower.contains(kw)) {
            return category;
        }
    }
    for (category, keywords) in CATEGORY_KEYWORDS {
        if keywords.iter().any(|kw| desc_lower.contains(kw)) {
            return category;
        }
    }
    "general"
}

/// Periodically enumerates C8 instances and upserts their tools into C11.
pub struct DiscoveryService {
    manager: Arc<McpManager>,
    registry: Arc<ToolRegistry>,
    interval: Duration,
    registry_path: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
}

impl DiscoveryService {
    /// Construct a service bound to `manager`/`registry`, scanning every
    /// `interval` and persisting at `registry_path`.
    #[must_use]
    pub fn new(
        manager: Arc<McpManager>,
        registry: Arc<ToolRegistry>,
        interval: Duration,
        registry_path: PathBuf,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { manager, registry, interval, registry_path, shutdown_tx }
    }

    /// Default persisted-registry location, `<home>/.rago/mcp_tool_registry.json`
    /// (§6 "Persisted state").
    #[must_use]
    pub fn default_registry_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| Path::new(".").to_path_buf())
            .join(".rago")
            .join("mcp_tool_registry.json")
    }

    /// Run one discovery round synchronously (§4.10). All servers in the
    /// round are folded into a single registry version bump (P5).
    pub async fn run_once(&self) {
        let mut healthy = Vec::new();
        let mut unavailable = Vec::new();
        for instance in self.manager.list() {
            if instance.status() != ServerStatus::Healthy {
                unavailable.push(instance.name().to_string());
                continue;
            }
            let Some(client) = instance.client() else {
                unavailable.push(instance.name().to_string());
                continue;
            };
            match client.get_tools().await {
                Ok(tools) => healthy.push((instance.name().to_string(), tools_to_discovered(instance.name(), tools))),
                Err(e) => {
                    warn!(server = %instance.name(), error = %e, "tool listing failed during discovery round");
                    unavailable.push(instance.name().to_string());
                }
            }
        }
        if !healthy.is_empty() || !unavailable.is_empty() {
            self.registry.apply_round(healthy, unavailable);
        }
    }

    /// Load the persisted registry, if present, ignoring an absent or
    /// malformed file (§6).
    pub async fn load(&self) {
        match tokio::fs::read_to_string(&self.registry_path).await {
            Ok(contents) => match serde_json::from_str::<Vec<DiscoveredTool>>(&contents) {
                Ok(tools) => self.registry.restore(tools),
                Err(e) => warn!(path = %self.registry_path.display(), error = %e, "malformed tool registry file, ignoring"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.registry_path.display(), error = %e, "unreadable tool registry file, ignoring"),
        }
    }

    /// Persist the registry to `registry_path` (§6 "written on stop").
    ///
    /// # Errors
    /// Returns an error if serialization or the filesystem write fails.
    pub async fn persist(&self) -> Result<()> {
        if let Some(parent) = self.registry_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&self.registry.snapshot())?;
        tokio::fs::write(&self.registry_path, json).await?;
        Ok(())
    }

    /// Start the periodic scanning loop as a background task.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown_rx = this.shutdown_tx.subscribe();
            let mut ticker = tokio::time::interval(this.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.run_once().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Stop the periodic loop and persist the registry (§6 "written on
    /// stop"). Idempotent with respect to the loop itself.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.persist().await {
            warn!(error = %e, "failed to persist tool registry on stop");
        } else {
            info!(path = %self.registry_path.display(), "tool registry persisted");
        }
    }
}

fn tools_to_discovered(server: &str, tools: std::collections::HashMap<String, ToolSpec>) -> Vec<DiscoveredTool> {
    tools
        .into_values()
        .map(|tool| {
            let category = categorize(&tool.name, &tool.description).to_string();
            DiscoveredTool {
                id: format!("{server}:{}", tool.name),
                name: tool.name,
                server: server.to_string(),
                description: tool.description,
                category,
                input_schema: tool.input_schema,
                last_seen: crate::provider::circuit_breaker::epoch_millis_now(),
                available: true,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorize_matches_filesystem_keyword_in_name() {
        assert_eq!(categorize("read_file", "does a thing"), "filesystem");
    }

    #[test]
    fn categorize_matches_keyword_in_description_when_name_is_opaque() {
        assert_eq!(categorize("op7", "Executes a SQL query against the database"), "database");
    }

    #[test]
    fn categorize_falls_back_to_general() {
        assert_eq!(categorize("frobnicate", "does something unrelated"), "general");
    }

    #[test]
    fn categorize_is_case_insensitive() {
        assert_eq!(categorize("FETCH_URL", "Makes an HTTP Request"), "network");
    }
}
