//! Sandbox allocation: one isolated execution unit per active plugin instance.
//!
//! A `PluginSandbox` carries:
//! - A fresh `WorkerId`, never reused across allocations
//! - Memory, storage, and timeout ceilings resolved once at creation
//! - A network allowlist for egress checks
//! - A CPU fuel budget for the Wasm isolate
//!
//! Limits are immutable for the sandbox's lifetime; changing them means
//! destroying the sandbox and creating a new one.
//!
//! Allocation has two halves. `reserve` resolves limits and registers the
//! sandbox; it never touches the runtime and is cheap enough for the
//! scheduler's control loop. `launch` spawns the isolate (possibly compiling
//! plugin code) and runs on a worker thread.

use crate::config::PluginManagerConfig;
use crate::error::{PluginError, PluginResult};
use crate::ids::WorkerId;
use crate::plugin::Plugin;
use crate::runtime::{Isolate, SandboxRuntime};
use chrono::{DateTime, Utc};
use plugvisor_bundle::ManifestLimits;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info};

/// Resource limits for a plugin sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxLimits {
    pub memory_bytes: u64,
    pub storage_quota_bytes: u64,
    pub timeout_ms: u64,
    /// CPU fuel budget per invocation (prevents infinite loops).
    pub fuel_per_call: u64,
    pub network_allowlist: Vec<String>,
}

impl SandboxLimits {
    /// Config defaults with the manifest's overrides applied.
    ///
    /// Overrides may lower a ceiling but never raise it.
    pub fn resolve(
        plugin_id: &str,
        requested: &ManifestLimits,
        config: &PluginManagerConfig,
    ) -> PluginResult<Self> {
        let memory_bytes = requested.memory_bytes.unwrap_or(config.sandbox_memory_limit);
        if memory_bytes > config.sandbox_memory_limit {
            return Err(PluginError::ResourceLimitExceeded {
                plugin_id: plugin_id.to_string(),
                detail: format!(
                    "requested {memory_bytes} bytes of memory, ceiling is {}",
                    config.sandbox_memory_limit
                ),
            });
        }
        let storage_quota_bytes = requested
            .storage_quota_bytes
            .unwrap_or(config.default_storage_quota);
        if storage_quota_bytes > config.default_storage_quota {
            return Err(PluginError::ResourceLimitExceeded {
                plugin_id: plugin_id.to_string(),
                detail: format!(
                    "requested {storage_quota_bytes} bytes of storage, ceiling is {}",
                    config.default_storage_quota
                ),
            });
        }
        let timeout_ms = requested.timeout_ms.unwrap_or(config.default_timeout_ms);
        if timeout_ms == 0 || timeout_ms > config.default_timeout_ms {
            return Err(PluginError::ResourceLimitExceeded {
                plugin_id: plugin_id.to_string(),
                detail: format!(
                    "requested timeout {timeout_ms}ms, allowed 1..={}ms",
                    config.default_timeout_ms
                ),
            });
        }
        let fuel_per_call = requested.fuel_per_call.unwrap_or(config.default_fuel_per_call);
        if fuel_per_call > config.default_fuel_per_call {
            return Err(PluginError::ResourceLimitExceeded {
                plugin_id: plugin_id.to_string(),
                detail: format!(
                    "requested {fuel_per_call} fuel per call, ceiling is {}",
                    config.default_fuel_per_call
                ),
            });
        }

        Ok(Self {
            memory_bytes,
            storage_quota_bytes,
            timeout_ms,
            fuel_per_call,
            network_allowlist: requested.network_allowlist.clone(),
        })
    }

    /// True when `host` matches an allowlist entry. `*.example.com` matches
    /// subdomains of example.com but not example.com itself.
    pub fn allows_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.network_allowlist.iter().any(|entry| {
            let entry = entry.to_ascii_lowercase();
            match entry.strip_prefix("*.") {
                Some(suffix) => host
                    .strip_suffix(suffix)
                    .is_some_and(|rest| rest.ends_with('.') && rest.len() > 1),
                None => entry == host,
            }
        })
    }
}

/// An isolated execution unit bound to one plugin version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSandbox {
    worker_id: WorkerId,
    plugin_id: String,
    plugin_version: u64,
    limits: SandboxLimits,
    created_at: DateTime<Utc>,
}

impl PluginSandbox {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn plugin_version(&self) -> u64 {
        self.plugin_version
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn timeout_ms(&self) -> u64 {
        self.limits.timeout_ms
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Always true; there is no shared-mode sandbox.
    pub fn isolated(&self) -> bool {
        true
    }
}

/// A sandbox together with its isolate, once launched.
pub struct LiveSandbox {
    sandbox: PluginSandbox,
    isolate: OnceLock<Arc<dyn Isolate>>,
    terminated: Arc<AtomicBool>,
}

impl LiveSandbox {
    pub fn sandbox(&self) -> &PluginSandbox {
        &self.sandbox
    }

    /// `None` until the sandbox has been launched.
    pub fn isolate(&self) -> Option<Arc<dyn Isolate>> {
        self.isolate.get().cloned()
    }

    pub fn peak_memory_bytes(&self) -> u64 {
        self.isolate.get().map_or(0, |i| i.peak_memory_bytes())
    }

    /// Flag raised when the sandbox is destroyed; the I/O broker refuses
    /// further boundary calls once it is set.
    pub fn terminated_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminated)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Creates and destroys sandboxes through the host runtime.
pub struct SandboxAllocator {
    runtime: Arc<dyn SandboxRuntime>,
    config: Arc<PluginManagerConfig>,
    live: Mutex<HashMap<WorkerId, Arc<LiveSandbox>>>,
}

impl SandboxAllocator {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: Arc<PluginManagerConfig>) -> Self {
        Self {
            runtime,
            config,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime_name(&self) -> &'static str {
        self.runtime.name()
    }

    /// Allocates a fresh sandbox for `plugin` and spawns its isolate.
    pub fn create_sandbox(&self, plugin: &Plugin) -> PluginResult<Arc<LiveSandbox>> {
        let live = self.reserve(plugin)?;
        if let Err(e) = self.launch(plugin, &live) {
            self.lock().remove(&live.sandbox.worker_id);
            return Err(e);
        }
        Ok(live)
    }

    /// Resolves limits and registers a sandbox without spawning its isolate.
    pub fn reserve(&self, plugin: &Plugin) -> PluginResult<Arc<LiveSandbox>> {
        let limits = SandboxLimits::resolve(&plugin.id, &plugin.manifest.limits, &self.config)?;
        let live = Arc::new(LiveSandbox {
            sandbox: PluginSandbox {
                worker_id: WorkerId::new(),
                plugin_id: plugin.id.clone(),
                plugin_version: plugin.version,
                limits,
                created_at: Utc::now(),
            },
            isolate: OnceLock::new(),
            terminated: Arc::new(AtomicBool::new(false)),
        });

        debug!(
            plugin_id = %plugin.id,
            worker_id = %live.sandbox.worker_id,
            runtime = self.runtime.name(),
            memory = live.sandbox.limits.memory_bytes,
            timeout_ms = live.sandbox.limits.timeout_ms,
            "Sandbox created"
        );
        self.lock().insert(live.sandbox.worker_id, Arc::clone(&live));
        Ok(live)
    }

    /// Spawns the isolate of a reserved sandbox. Blocking: the runtime may
    /// compile plugin code here.
    ///
    /// A sandbox destroyed while its isolate was spawning gets the new
    /// isolate terminated before it is returned.
    pub fn launch(&self, plugin: &Plugin, live: &LiveSandbox) -> PluginResult<Arc<dyn Isolate>> {
        if let Some(isolate) = live.isolate() {
            return Ok(isolate);
        }
        let spawned = self.runtime.spawn(plugin, &live.sandbox)?;
        let isolate = Arc::clone(live.isolate.get_or_init(|| spawned));
        if live.is_terminated() {
            isolate.terminate();
        }
        Ok(isolate)
    }

    /// Terminates and releases a sandbox. Returns false if it was already gone.
    pub fn destroy_sandbox(&self, worker_id: WorkerId) -> bool {
        let Some(live) = self.lock().remove(&worker_id) else {
            return false;
        };
        live.terminated.store(true, Ordering::SeqCst);
        if let Some(isolate) = live.isolate.get() {
            isolate.terminate();
        }
        debug!(
            plugin_id = %live.sandbox.plugin_id,
            worker_id = %worker_id,
            "Sandbox destroyed"
        );
        true
    }

    /// Destroys every sandbox of a plugin. Returns how many were live.
    pub fn destroy_for_plugin(&self, plugin_id: &str) -> usize {
        let ids: Vec<WorkerId> = self
            .lock()
            .values()
            .filter(|l| l.sandbox.plugin_id == plugin_id)
            .map(|l| l.sandbox.worker_id)
            .collect();
        let destroyed = ids
            .into_iter()
            .filter(|id| self.destroy_sandbox(*id))
            .count();
        if destroyed > 0 {
            info!(plugin_id = %plugin_id, destroyed, "Destroyed plugin sandboxes");
        }
        destroyed
    }

    /// Tells the runtime the plugin is gone, e.g. to drop compiled code.
    pub fn evict(&self, plugin_id: &str) {
        self.runtime.evict(plugin_id);
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    pub fn live_for_plugin(&self, plugin_id: &str) -> Vec<PluginSandbox> {
        self.lock()
            .values()
            .filter(|l| l.sandbox.plugin_id == plugin_id)
            .map(|l| l.sandbox.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WorkerId, Arc<LiveSandbox>>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}
