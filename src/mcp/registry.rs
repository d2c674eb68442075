//! Tool Registry (C11, §4.11): in-memory index of discovered tools with
//! availability tracking and a monotone version counter.
//!
//! Indexed the way [`crate::provider::pool::ProviderPool`] indexes
//! providers (a `DashMap` by id) plus two derived secondary indices (by
//! server, by category) recomputed from the primary map on read, which
//! keeps invariant I8 (monotone version) trivially satisfiable at a single
//! mutation point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One discovered tool (§3 DiscoveredTool).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredTool {
    /// Composite id `"<server>:<tool>"`.
    pub id: String,
    /// Tool name, unique within its server.
    pub name: String,
    /// Owning server name.
    pub server: String,
    /// Human-readable description.
    pub description: String,
    /// Heuristic category (§4.10).
    pub category: String,
    /// JSON-Schema of the tool's argument map.
    pub input_schema: Value,
    /// Epoch-millis timestamp of the discovery round that last saw it.
    pub last_seen: u64,
    /// Whether the tool was present in the most recent round (I7).
    pub available: bool,
}

/// In-memory index of [`DiscoveredTool`]s, keyed by composite id.
pub struct ToolRegistry {
    tools: DashMap<String, DiscoveredTool>,
    version: AtomicU64,
}

impl ToolRegistry {
    /// Construct an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { tools: DashMap::new(), version: AtomicU64::new(0) }
    }

    /// Current registry version (I8: increases monotonically on each
    /// discovery round).
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Look up a tool by composite id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<DiscoveredTool> {
        self.tools.get(id).map(|e| e.clone())
    }

    /// All tools currently indexed.
    #[must_use]
    pub fn list(&self) -> Vec<DiscoveredTool> {
        self.tools.iter().map(|e| e.clone()).collect()
    }

    /// Tools belonging to `server`.
    #[must_use]
    pub fn by_server(&self, server: &str) -> Vec<DiscoveredTool> {
        self.tools.iter().filter(|e| e.server == server).map(|e| e.clone()).collect()
    }

    /// Tools classified under `category`.
    #[must_use]
    pub fn by_category(&self, category: &str) -> Vec<DiscoveredTool> {
        self.tools.iter().filter(|e| e.category == category).map(|e| e.clone()).collect()
    }

    /// Upsert every tool a discovery round observed for `server` (idempotent
    /// on id, §4.11), and mark any previously-known tool of this server that
    /// was NOT seen this round as `available=false` (I7) while keeping its
    /// previous server binding. Bumps the version once for this call; use
    /// [`Self::apply_round`] to fold several servers into a single version
    /// bump the way a real discovery round does (P5).
    pub fn upsert_server_tools(&self, server: &str, seen: Vec<DiscoveredTool>) {
        self.upsert_server_tools_inner(server, seen);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn upsert_server_tools_inner(&self, server: &str, seen: Vec<DiscoveredTool>) {
        let seen_ids: std::collections::HashSet<&str> = seen.iter().map(|t| t.id.as_str()).collect();
        for mut existing in self.tools.iter_mut() {
            if existing.server == server && !seen_ids.contains(existing.id.as_str()) {
                existing.available = false;
            }
        }
        for tool in seen {
            self.tools.insert(tool.id.clone(), tool);
        }
    }

    /// Mark every tool known for `server` unavailable without touching their
    /// server binding, e.g. because the server reported Unhealthy or its
    /// tool list failed to fetch this round (§4.10, I7). Bumps the version
    /// once for this call; see [`Self::apply_round`] for the whole-round form.
    pub fn mark_server_unavailable(&self, server: &str) {
        self.mark_server_unavailable_inner(server);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn mark_server_unavailable_inner(&self, server: &str) {
        for mut existing in self.tools.iter_mut() {
            if existing.server == server {
                existing.available = false;
            }
        }
    }

    /// Apply a full discovery round in one step: upsert tools for every
    /// healthy server observed, mark every unhealthy/unreachable server's
    /// tools unavailable, and bump the version counter exactly once for the
    /// whole round (§4.10, P5 "version incremented by exactly 1").
    pub fn apply_round(&self, healthy: Vec<(String, Vec<DiscoveredTool>)>, unavailable: Vec<String>) {
        for (server, tools) in healthy {
            self.upsert_server_tools_inner(&server, tools);
        }
        for server in unavailable {
            self.mark_server_unavailable_inner(&server);
        }
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Replace the registry contents wholesale, e.g. loading persisted
    /// state at startup. Does not bump the version counter (this is a
    /// restore, not a discovery round).
    pub fn restore(&self, tools: Vec<DiscoveredTool>) {
        self.tools.clear();
        for tool in tools {
            self.tools.insert(tool.id.clone(), tool);
        }
    }

    /// A serializable snapshot of every tool, for persistence (§6).
    #[must_use]
    pub fn snapshot(&self) -> Vec<DiscoveredTool> {
        self.list()
    }

    /// Tools indexed by category, for diagnostics.
    #[must_use]
    pub fn category_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for entry in self.tools.iter() {
            *counts.entry(entry.category.clone()).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
