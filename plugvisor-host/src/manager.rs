//! Plugin manager facade.
//!
//! Wires the capability registry, grant table, store, sandbox allocator,
//! scheduler, installer and telemetry together and exposes the public
//! lifecycle and execution API. Must be built inside a Tokio runtime.

use crate::broker::{HostBridge, NullHost};
use crate::capabilities::CapabilityRegistry;
use crate::config::PluginManagerConfig;
use crate::context::ExecutionScope;
use crate::error::{PluginError, PluginResult};
use crate::ids::TaskId;
use crate::installer::{Ed25519Verifier, InstallOptions, Installer, SignatureVerifier};
use crate::permissions::{GrantTable, Permission};
use crate::plugin::{Plugin, PluginStatus};
use crate::runtime::{SandboxRuntime, WasmRuntime};
use crate::sandbox::{PluginSandbox, SandboxAllocator};
use crate::scheduler::{
    ExecutionHandle, SchedulerDeps, SchedulerHandle, SchedulerStats, Settlement, TaskRequest,
    TaskState,
};
use crate::store::{MemoryStore, PluginStore};
use crate::telemetry::{PluginLogEntry, TelemetrySink};
use plugvisor_bundle::PluginBundle;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
pub struct PluginManagerBuilder {
    config: PluginManagerConfig,
    store: Option<Arc<dyn PluginStore>>,
    runtime: Option<Arc<dyn SandboxRuntime>>,
    host: Option<Arc<dyn HostBridge>>,
    registry: Option<CapabilityRegistry>,
    telemetry: Option<Arc<TelemetrySink>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
}

impl PluginManagerBuilder {
    pub fn config(mut self, config: PluginManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn PluginStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn SandboxRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn host(mut self, host: Arc<dyn HostBridge>) -> Self {
        self.host = Some(host);
        self
    }

    /// Replaces the built-in capability registry.
    pub fn registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Validates the config, loads installed plugins and starts the scheduler.
    pub fn build(self) -> PluginResult<PluginManager> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let runtime = self.runtime.unwrap_or_else(|| Arc::new(WasmRuntime::new()));
        let telemetry = match (self.telemetry, &config.telemetry.journal_path) {
            (Some(telemetry), _) => telemetry,
            (None, Some(path)) => Arc::new(TelemetrySink::open(path)?),
            (None, None) => Arc::new(TelemetrySink::new()),
        };
        let registry = Arc::new(
            self.registry
                .unwrap_or_else(CapabilityRegistry::with_builtins),
        );
        let grants = Arc::new(GrantTable::new());
        let allocator = Arc::new(SandboxAllocator::new(runtime, Arc::clone(&config)));

        let scheduler = SchedulerHandle::spawn(SchedulerDeps {
            config: Arc::clone(&config),
            allocator: Arc::clone(&allocator),
            registry: Arc::clone(&registry),
            grants: Arc::clone(&grants),
            store: Arc::clone(&store),
            host: self.host.unwrap_or_else(|| Arc::new(NullHost)),
            telemetry: Arc::clone(&telemetry),
        });
        let installer = Installer::load(
            Arc::clone(&config),
            store,
            grants,
            Arc::clone(&telemetry),
            self.verifier.unwrap_or_else(|| Arc::new(Ed25519Verifier)),
        )?
        .attach(scheduler.clone(), Arc::clone(&allocator));

        info!(
            runtime = allocator.runtime_name(),
            engine = %config.engine_version,
            installed = installer.plugins().len(),
            "Plugin manager ready"
        );
        Ok(PluginManager {
            config,
            registry,
            allocator,
            scheduler,
            installer,
            telemetry,
        })
    }
}

pub struct PluginManager {
    config: Arc<PluginManagerConfig>,
    registry: Arc<CapabilityRegistry>,
    allocator: Arc<SandboxAllocator>,
    scheduler: SchedulerHandle,
    installer: Installer,
    telemetry: Arc<TelemetrySink>,
}

impl PluginManager {
    pub fn builder() -> PluginManagerBuilder {
        PluginManagerBuilder::default()
    }

    // ================================================================
    // Lifecycle
    // ================================================================

    pub async fn install_plugin(
        &self,
        bundle: &PluginBundle,
        options: InstallOptions,
    ) -> PluginResult<Arc<Plugin>> {
        self.installer.install(bundle, options).await
    }

    pub async fn update_plugin(
        &self,
        plugin_id: &str,
        bundle: &PluginBundle,
        options: InstallOptions,
    ) -> PluginResult<Arc<Plugin>> {
        self.installer.update(plugin_id, bundle, options).await
    }

    pub async fn uninstall_plugin(&self, plugin_id: &str) -> PluginResult<()> {
        self.installer.uninstall(plugin_id).await
    }

    pub async fn rollback_plugin(&self, plugin_id: &str) -> PluginResult<Arc<Plugin>> {
        self.installer.rollback(plugin_id).await
    }

    pub async fn grant_permission(
        &self,
        plugin_id: &str,
        permission: Permission,
    ) -> PluginResult<Arc<Plugin>> {
        self.installer.grant_permission(plugin_id, permission).await
    }

    pub async fn revoke_permission(
        &self,
        plugin_id: &str,
        permission: Permission,
    ) -> PluginResult<Arc<Plugin>> {
        self.installer.revoke_permission(plugin_id, permission).await
    }

    // ================================================================
    // Execution
    // ================================================================

    /// Queues an execution and returns without waiting for it.
    pub async fn submit(
        &self,
        plugin_id: &str,
        function: &str,
        args: Value,
        scope: ExecutionScope,
    ) -> PluginResult<ExecutionHandle> {
        let plugin = self
            .installer
            .plugin(plugin_id)
            .ok_or_else(|| PluginError::PluginNotFound(plugin_id.to_string()))?;
        self.scheduler
            .submit(TaskRequest {
                plugin,
                function: function.to_string(),
                args,
                scope,
            })
            .await
    }

    /// Runs a function and waits for its settlement.
    pub async fn execute_plugin(
        &self,
        plugin_id: &str,
        function: &str,
        args: Value,
        scope: ExecutionScope,
    ) -> Settlement {
        self.submit(plugin_id, function, args, scope)
            .await?
            .wait()
            .await
    }

    pub async fn cancel(&self, task_id: TaskId) -> PluginResult<()> {
        self.scheduler.cancel(task_id).await
    }

    pub async fn task_state(&self, task_id: TaskId) -> PluginResult<Option<TaskState>> {
        self.scheduler.task_state(task_id).await
    }

    // ================================================================
    // Queries
    // ================================================================

    /// Status of a plugin; an unknown id reports `installed: false`.
    pub async fn get_plugin_status(&self, plugin_id: &str) -> PluginResult<PluginStatus> {
        let Some(plugin) = self.installer.plugin(plugin_id) else {
            return Ok(PluginStatus {
                plugin_id: plugin_id.to_string(),
                ..Default::default()
            });
        };
        let activity = self.scheduler.plugin_activity(plugin_id).await?;
        let crash = self.telemetry.degraded(plugin_id);
        Ok(PluginStatus {
            plugin_id: plugin.id.clone(),
            installed: true,
            active: activity.is_active(),
            version: Some(plugin.version),
            manifest_version: Some(plugin.manifest.version.clone()),
            trusted: plugin.trusted,
            running_tasks: activity.running,
            queued_tasks: activity.queued,
            degraded: crash.is_some(),
            error: crash,
        })
    }

    pub fn get_audit_log(&self, plugin_id: &str) -> Vec<PluginLogEntry> {
        self.telemetry.audit_log(plugin_id)
    }

    pub fn list_plugins(&self) -> Vec<Arc<Plugin>> {
        self.installer.plugins()
    }

    pub fn plugin(&self, plugin_id: &str) -> Option<Arc<Plugin>> {
        self.installer.plugin(plugin_id)
    }

    pub fn has_backup(&self, plugin_id: &str) -> PluginResult<bool> {
        self.installer.has_backup(plugin_id)
    }

    pub fn live_sandboxes(&self, plugin_id: &str) -> Vec<PluginSandbox> {
        self.allocator.live_for_plugin(plugin_id)
    }

    pub async fn stats(&self) -> PluginResult<SchedulerStats> {
        self.scheduler.stats().await
    }

    pub fn config(&self) -> &PluginManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn telemetry(&self) -> &TelemetrySink {
        &self.telemetry
    }

    /// Cancels outstanding tasks and stops the scheduler.
    pub async fn shutdown(&self) -> PluginResult<usize> {
        self.scheduler.shutdown().await
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        self.scheduler.shutdown_now();
    }
}
