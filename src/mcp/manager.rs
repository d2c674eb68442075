//! MCP Server Manager (C8, §4.8): lifecycle (register/start/stop/restart)
//! of MCP server processes with auto-start and auto-restart.
//!
//! Structured after [`crate::provider::pool::ProviderPool`]: a `DashMap`
//! name→handle, per-instance mutation serialized by the handle's own lock
//! (I3-equivalent for ServerInstance), with registration hooks so C10 can
//! react to lifecycle transitions without C8 depending on C10.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::McpServerConfig;
use crate::error::{Error, Result};
use crate::mcp::{IsolationMode, McpClientFactory, ServerInstance, ServerStatus};

/// Called after a registration or lifecycle transition so downstream
/// components (notably C10 Tool Discovery) can react without C8 holding a
/// reference to them (§4.8 "registration hooks").
pub type LifecycleHook = Arc<dyn Fn(Arc<ServerInstance>) + Send + Sync>;

/// Owns every registered [`ServerInstance`] and mediates its lifecycle.
pub struct McpManager {
    instances: DashMap<String, Arc<ServerInstance>>,
    /// Per-instance restart serialization (§4.8 "restart: serialized per
    /// instance"); keyed separately from the DashMap entry lock so a
    /// restart in flight doesn't block unrelated reads of the instance.
    restart_locks: DashMap<String, Arc<Mutex<()>>>,
    client_factory: Arc<dyn McpClientFactory>,
    on_register: parking_lot::RwLock<Vec<LifecycleHook>>,
}

impl McpManager {
    /// Construct a manager that builds clients through `client_factory`.
    #[must_use]
    pub fn new(client_factory: Arc<dyn McpClientFactory>) -> Self {
        Self {
            instances: DashMap::new(),
            restart_locks: DashMap::new(),
            client_factory,
            on_register: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Register a callback invoked after every successful `register` and
    /// after every restart transition back to Healthy.
    pub fn on_register(&self, hook: LifecycleHook) {
        self.on_register.write().push(hook);
    }

    fn fire_hooks(&self, instance: &Arc<ServerInstance>) {
        for hook in self.on_register.read().iter() {
            hook(Arc::clone(instance));
        }
    }

    /// Register and start a new server (§4.8 "register").
    ///
    /// # Errors
    /// Returns an error if `config.name` is already registered, or if the
    /// constructed client fails to connect or complete its initial probe.
    pub async fn register(
        &self,
        config: McpServerConfig,
        isolation: IsolationMode,
    ) -> Result<Arc<ServerInstance>> {
        if self.instances.contains_key(&config.name) {
            return Err(Error::ServerAlreadyExists(config.name.clone()));
        }

        let instance = Arc::new(ServerInstance::new(config, isolation));
        self.instances
            .insert(instance.name().to_string(), Arc::clone(&instance));
        self.restart_locks
            .insert(instance.name().to_string(), Arc::new(Mutex::new(())));

        self.start_instance(&instance).await;
        self.fire_hooks(&instance);
        Ok(instance)
    }

    /// Start (or restart) the client for an already-registered instance and
    /// transition Starting→Healthy on a successful initial probe (I4). A
    /// failed initial probe leaves the instance Unhealthy rather than
    /// failing `register` outright, mirroring §4.8's "auto-start failures
    /// are logged and do not abort startup" for the single-instance case.
    async fn start_instance(&self, instance: &Arc<ServerInstance>) {
        instance.set_status(ServerStatus::Starting);
        let client = self
            .client_factory
            .build(instance.config(), instance.isolation());

        match client.connect().await {
            Ok(()) => match client.get_tools().await {
                Ok(_) => {
                    instance.set_client(Some(client));
                    instance.mark_started_healthy();
                    info!(server = %instance.name(), "MCP server started");
                }
                Err(e) => {
                    instance.set_client(Some(client));
                    instance.mark_unhealthy();
                    warn!(server = %instance.name(), error = %e, "initial tool probe failed");
                }
            },
            Err(e) => {
                instance.mark_unhealthy();
                warn!(server = %instance.name(), error = %e, "MCP server failed to connect");
            }
        }
    }

    /// Stop and remove a server (§4.8 "unregister").
    ///
    /// # Errors
    /// Returns `ServerNotFound` if no such server is registered.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let (_, instance) = self
            .instances
            .remove(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        self.restart_locks.remove(name);
        self.stop_instance(&instance).await;
        Ok(())
    }

    async fn stop_instance(&self, instance: &Arc<ServerInstance>) {
        if let Some(client) = instance.client() {
            if let Err(e) = client.close().await {
                warn!(server = %instance.name(), error = %e, "error closing MCP client");
            }
        }
        instance.set_client(None);
        instance.mark_stopped();
    }

    /// Restart a registered instance: Restarting→stop→sleep(restart_delay)→
    /// start, `restart_count` incremented (§4.8). Serialized per instance so
    /// concurrent restart requests for the same server don't race.
    ///
    /// # Errors
    /// Returns `ServerNotFound` if no such server is registered.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let instance = self.get(name).ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        let lock = self
            .restart_locks
            .get(name)
            .map(|l| Arc::clone(&l))
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        let _guard = lock.lock().await;

        instance.begin_restart();
        self.stop_instance(&instance).await;
        tokio::time::sleep(instance.config().restart_delay).await;
        self.start_instance(&instance).await;

        if instance.status() == ServerStatus::Healthy {
            self.fire_hooks(&instance);
        } else if !instance.can_restart() {
            instance.mark_failed();
        }

        Ok(())
    }

    /// Look up a registered instance by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ServerInstance>> {
        self.instances.get(name).map(|e| Arc::clone(&e))
    }

    /// All registered instances.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<ServerInstance>> {
        self.instances.iter().map(|e| Arc::clone(&e)).collect()
    }

    /// Register every `auto_start=true` entry from `configs`. Failures are
    /// logged and do not abort startup (§4.8 "start").
    pub async fn start(&self, configs: Vec<McpServerConfig>, isolation: IsolationMode) {
        for config in configs.into_iter().filter(|c| c.auto_start) {
            let name = config.name.clone();
            if let Err(e) = self.register(config, isolation).await {
                warn!(server = %name, error = %e, "auto-start registration failed");
            }
        }
    }

    /// Stop every registered instance, severing its client.
    pub async fn shutdown(&self) {
        for instance in self.list() {
            self.stop_instance(&instance).await;
        }
    }
}
