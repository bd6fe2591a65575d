//! I/O broker: the only path from plugin code to the outside world.
//!
//! One broker per execution. Every boundary call is looked up in the
//! capability registry, checked by the permission enforcer, and then served
//! by the handler for its kind: the plugin's storage namespace, outbound
//! HTTP, the host bridge, or the execution's log.

use crate::capabilities::CapabilityRequest;
use crate::context::PluginExecutionContext;
use crate::enforcer::{BoundaryAction, BoundaryEffect, PermissionEnforcer};
use crate::error::{PluginError, PluginResult};
use crate::ids::TaskId;
use crate::runtime::Fault;
use crate::store::PluginStore;
use crate::telemetry::{LogLevel, PluginLogEntry};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Log entries kept per execution; later ones are counted and dropped.
const MAX_LOG_ENTRIES: usize = 1_000;

/// Host-side operations a plugin may reach through `host.invoke`.
pub trait HostBridge: Send + Sync {
    fn invoke(&self, plugin_id: &str, operation: &str, payload: Value) -> PluginResult<Value>;
}

/// Bridge for hosts that expose nothing: every operation returns `null`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl HostBridge for NullHost {
    fn invoke(&self, plugin_id: &str, operation: &str, _payload: Value) -> PluginResult<Value> {
        debug!(plugin_id = %plugin_id, operation = %operation, "Null host invoked");
        Ok(Value::Null)
    }
}

/// Cooperative cancellation flag shared between the scheduler and a worker.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct BrokerJournal {
    logs: Vec<PluginLogEntry>,
    dropped_logs: usize,
    network_requests: u64,
    errors: u64,
    last_denial: Option<PluginError>,
}

/// What the broker observed during one execution.
#[derive(Debug, Clone, Default)]
pub struct BrokerReport {
    pub logs: Vec<PluginLogEntry>,
    pub network_requests: u64,
    /// Boundary calls that failed.
    pub errors: u64,
    /// Most recent permission or quota denial, if any.
    pub last_denial: Option<PluginError>,
}

pub struct IoBroker {
    task_id: TaskId,
    ctx: PluginExecutionContext,
    enforcer: PermissionEnforcer,
    store: Arc<dyn PluginStore>,
    host: Arc<dyn HostBridge>,
    cancel: CancelSignal,
    terminated: Arc<AtomicBool>,
    journal: Mutex<BrokerJournal>,
}

impl IoBroker {
    pub fn new(
        task_id: TaskId,
        ctx: PluginExecutionContext,
        enforcer: PermissionEnforcer,
        store: Arc<dyn PluginStore>,
        host: Arc<dyn HostBridge>,
        cancel: CancelSignal,
        terminated: Arc<AtomicBool>,
    ) -> Self {
        Self {
            task_id,
            ctx,
            enforcer,
            store,
            host,
            cancel,
            terminated,
            journal: Mutex::new(BrokerJournal::default()),
        }
    }

    pub fn context(&self) -> &PluginExecutionContext {
        &self.ctx
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_requested() || self.terminated.load(Ordering::SeqCst)
    }

    /// Performs one boundary call on behalf of the plugin.
    pub fn call(&self, capability: &str, request: CapabilityRequest) -> Result<Value, Fault> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Fault::Terminated);
        }
        if self.cancel.is_requested() {
            return Err(Fault::Boundary(PluginError::Cancelled {
                plugin_id: self.ctx.plugin_id.clone(),
                task_id: self.task_id,
            }));
        }

        let label = request.label();
        let result = self.dispatch(capability, request);
        if let Err(e) = &result {
            let mut journal = self.lock();
            journal.errors += 1;
            if e.is_boundary_violation() {
                journal.last_denial = Some(e.clone());
            }
            debug!(
                plugin_id = %self.ctx.plugin_id,
                task_id = %self.task_id,
                capability = %capability,
                request = label,
                error = %e,
                "Boundary call failed"
            );
        }
        result.map_err(Fault::Boundary)
    }

    pub fn log(&self, level: LogLevel, message: String) {
        let mut journal = self.lock();
        if journal.logs.len() >= MAX_LOG_ENTRIES {
            journal.dropped_logs += 1;
            return;
        }
        journal.logs.push(PluginLogEntry::new(level, message));
    }

    /// Bytes the plugin's namespace uses now. Reads the store.
    pub fn storage_used_bytes(&self) -> u64 {
        match self.store.storage_usage(&self.ctx.plugin_id) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(plugin_id = %self.ctx.plugin_id, error = %e, "Failed to read storage usage");
                0
            }
        }
    }

    /// Snapshot of logs and counters. Never touches the store.
    pub fn report(&self) -> BrokerReport {
        let journal = self.lock();
        let mut logs = journal.logs.clone();
        if journal.dropped_logs > 0 {
            logs.push(PluginLogEntry::new(
                LogLevel::Warn,
                format!("{} log entries dropped", journal.dropped_logs),
            ));
        }
        BrokerReport {
            logs,
            network_requests: journal.network_requests,
            errors: journal.errors,
            last_denial: journal.last_denial.clone(),
        }
    }

    fn dispatch(&self, capability: &str, request: CapabilityRequest) -> PluginResult<Value> {
        let entry = self
            .enforcer
            .registry()
            .lookup(capability)
            .ok_or_else(|| PluginError::CapabilityNotFound(capability.to_string()))?;
        if !entry.kind.accepts(&request) {
            return Err(PluginError::CapabilityMismatch {
                capability: capability.to_string(),
                request: request.label().to_string(),
            });
        }
        let plugin_id = self.ctx.plugin_id.as_str();

        match request {
            CapabilityRequest::StorageGet { key } => {
                self.enforce(capability, BoundaryEffect::StorageRead { key: Some(key.clone()) })?;
                Ok(self.store.storage_get(plugin_id, &key)?.unwrap_or(Value::Null))
            }
            CapabilityRequest::StorageList => {
                self.enforce(capability, BoundaryEffect::StorageRead { key: None })?;
                let keys: Vec<String> =
                    self.store.storage_snapshot(plugin_id)?.into_keys().collect();
                Ok(json!(keys))
            }
            CapabilityRequest::StorageSet { key, value } => {
                // The quota check runs under the namespace lock, so two
                // writers can never both fit into the same headroom.
                let mut denial = None;
                let mut admit = |projected_bytes| {
                    let effect = BoundaryEffect::StorageWrite {
                        key: key.clone(),
                        projected_bytes,
                    };
                    self.enforce(capability, effect)
                        .map_err(|e| denial = Some(e))
                        .is_ok()
                };
                self.store.storage_set_if(plugin_id, &key, value, &mut admit)?;
                match denial {
                    Some(e) => Err(e),
                    None => Ok(Value::Null),
                }
            }
            CapabilityRequest::StorageDelete { key } => {
                self.enforce(capability, BoundaryEffect::StorageDelete { key: key.clone() })?;
                Ok(Value::Bool(self.store.storage_delete(plugin_id, &key)?))
            }
            CapabilityRequest::Fetch { url } => {
                self.enforce(capability, BoundaryEffect::NetworkEgress { url: url.clone() })?;
                self.lock().network_requests += 1;
                self.fetch(&url)
            }
            CapabilityRequest::HostInvoke { operation, payload } => {
                self.enforce(
                    capability,
                    BoundaryEffect::HostAccess {
                        operation: operation.clone(),
                    },
                )?;
                self.host.invoke(plugin_id, &operation, payload)
            }
            CapabilityRequest::Log { level, message } => {
                self.enforce(capability, BoundaryEffect::Log)?;
                self.log(level, message);
                Ok(Value::Null)
            }
        }
    }

    fn enforce(&self, capability: &str, effect: BoundaryEffect) -> PluginResult<()> {
        self.enforcer.enforce_boundary(
            &self.ctx,
            &BoundaryAction {
                capability: capability.to_string(),
                effect,
            },
        )
    }

    fn fetch(&self, url: &str) -> PluginResult<Value> {
        // Redirects are not followed: the target could leave the allowlist.
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(self.ctx.sandbox.timeout_ms()))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| PluginError::Network(e.to_string()))?;
        let response = client
            .get(url)
            .send()
            .map_err(|e| PluginError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| PluginError::Network(e.to_string()))?;
        Ok(json!({ "status": status, "body": body }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerJournal> {
        self.journal.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        CapabilityRegistry, HOST_INVOKE, LOG_WRITE, NETWORK_FETCH, STORAGE_GET, STORAGE_LIST,
        STORAGE_SET,
    };
    use crate::config::PluginManagerConfig;
    use crate::context::ExecutionScope;
    use crate::permissions::{GrantTable, Permission, PermissionSet};
    use crate::plugin::tests::sample_plugin;
    use crate::runtime::NativeRuntime;
    use crate::sandbox::SandboxAllocator;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    struct Fixture {
        broker: IoBroker,
        grants: Arc<GrantTable>,
        cancel: CancelSignal,
        terminated: Arc<AtomicBool>,
    }

    fn fixture(quota: u64) -> Fixture {
        let mut plugin = sample_plugin("acme.broker");
        plugin.permissions = [
            Permission::Logger,
            Permission::StorageRead,
            Permission::StorageWrite,
            Permission::Network,
            Permission::HostAccess,
        ]
        .into();
        plugin.manifest.limits.storage_quota_bytes = Some(quota);

        let registry = Arc::new(CapabilityRegistry::with_builtins());
        let grants = Arc::new(GrantTable::new());
        grants.set(
            &plugin.id,
            PermissionSet::from_granted(plugin.permissions.iter().copied()),
        );
        let allocator = SandboxAllocator::new(
            Arc::new(NativeRuntime::new()),
            Arc::new(PluginManagerConfig::default()),
        );
        let live = allocator.create_sandbox(&plugin).unwrap();
        let ctx = PluginExecutionContext::new(
            &plugin,
            ExecutionScope::user("u"),
            &registry,
            live.sandbox().clone(),
            Arc::clone(&grants),
        );
        let cancel = CancelSignal::new();
        let terminated = Arc::new(AtomicBool::new(false));
        let broker = IoBroker::new(
            TaskId::new(),
            ctx,
            PermissionEnforcer::new(registry),
            Arc::new(MemoryStore::new()),
            Arc::new(NullHost),
            cancel.clone(),
            Arc::clone(&terminated),
        );
        Fixture {
            broker,
            grants,
            cancel,
            terminated,
        }
    }

    #[test]
    fn storage_roundtrip_through_capabilities() {
        let f = fixture(1024);
        f.broker
            .call(
                STORAGE_SET,
                CapabilityRequest::StorageSet {
                    key: "count".into(),
                    value: json!(3),
                },
            )
            .unwrap();
        let value = f
            .broker
            .call(STORAGE_GET, CapabilityRequest::StorageGet { key: "count".into() })
            .unwrap();
        assert_eq!(value, json!(3));
        let keys = f.broker.call(STORAGE_LIST, CapabilityRequest::StorageList).unwrap();
        assert_eq!(keys, json!(["count"]));
        assert_eq!(f.broker.storage_used_bytes(), 6);
    }

    #[test]
    fn quota_counts_replaced_values_once() {
        let f = fixture(10);
        let set = |v: Value| {
            f.broker.call(
                STORAGE_SET,
                CapabilityRequest::StorageSet {
                    key: "k".into(),
                    value: v,
                },
            )
        };
        set(json!("abcdefg")).unwrap(); // 1 + 9 bytes
        set(json!("gfedcba")).unwrap();
        let err = set(json!("abcdefgh")).unwrap_err();
        assert!(matches!(
            err,
            Fault::Boundary(PluginError::ResourceLimitExceeded { .. })
        ));
        let report = f.broker.report();
        assert_eq!(report.errors, 1);
        assert!(report.last_denial.is_some());
    }

    #[test]
    fn revoked_network_is_denied_and_remembered() {
        let f = fixture(1024);
        f.grants.revoke("acme.broker", Permission::Network);
        let err = f
            .broker
            .call(
                NETWORK_FETCH,
                CapabilityRequest::Fetch {
                    url: "https://api.acme.dev/".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Fault::Boundary(PluginError::PermissionDenied { .. })
        ));
        let report = f.broker.report();
        assert_eq!(report.network_requests, 0);
        assert!(matches!(
            report.last_denial,
            Some(PluginError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn unknown_and_mismatched_capabilities() {
        let f = fixture(1024);
        assert!(matches!(
            f.broker.call("fs.read", CapabilityRequest::StorageList),
            Err(Fault::Boundary(PluginError::CapabilityNotFound(_)))
        ));
        assert!(matches!(
            f.broker.call(LOG_WRITE, CapabilityRequest::StorageList),
            Err(Fault::Boundary(PluginError::CapabilityMismatch { .. }))
        ));
    }

    #[test]
    fn host_invoke_reaches_bridge() {
        let f = fixture(1024);
        let out = f
            .broker
            .call(
                HOST_INVOKE,
                CapabilityRequest::HostInvoke {
                    operation: "ping".into(),
                    payload: Value::Null,
                },
            )
            .unwrap();
        assert_eq!(out, Value::Null);
    }

    #[test]
    fn logs_keep_order() {
        let f = fixture(1024);
        f.broker.log(LogLevel::Info, "one".into());
        f.broker
            .call(
                LOG_WRITE,
                CapabilityRequest::Log {
                    level: LogLevel::Warn,
                    message: "two".into(),
                },
            )
            .unwrap();
        let messages: Vec<_> = f
            .broker
            .report()
            .logs
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["one", "two"]);
    }

    #[test]
    fn cancelled_and_terminated_calls_refused() {
        let f = fixture(1024);
        f.cancel.request();
        assert!(f.broker.is_cancelled());
        assert!(matches!(
            f.broker.call(STORAGE_LIST, CapabilityRequest::StorageList),
            Err(Fault::Boundary(PluginError::Cancelled { .. }))
        ));

        f.terminated.store(true, Ordering::SeqCst);
        assert!(matches!(
            f.broker.call(STORAGE_LIST, CapabilityRequest::StorageList),
            Err(Fault::Terminated)
        ));
    }

    #[test]
    fn concurrent_writes_cannot_share_quota_headroom() {
        let f = Arc::new(fixture(100));
        // 1-byte key plus a 59-byte string value: 60 bytes each.
        let value = json!("x".repeat(57));
        let writers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|key| {
                let f = Arc::clone(&f);
                let value = value.clone();
                std::thread::spawn(move || {
                    f.broker.call(
                        STORAGE_SET,
                        CapabilityRequest::StorageSet {
                            key: key.into(),
                            value,
                        },
                    )
                })
            })
            .collect();
        let outcomes: Vec<_> = writers.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|o| matches!(
            o,
            Err(Fault::Boundary(PluginError::ResourceLimitExceeded { .. }))
        )));
        assert_eq!(f.broker.storage_used_bytes(), 60);
    }

    #[test]
    fn denied_write_leaves_namespace_untouched() {
        let f = fixture(1024);
        f.grants.revoke("acme.broker", Permission::StorageWrite);
        let err = f
            .broker
            .call(
                STORAGE_SET,
                CapabilityRequest::StorageSet {
                    key: "k".into(),
                    value: json!(1),
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Fault::Boundary(PluginError::PermissionDenied { .. })
        ));
        assert_eq!(f.broker.storage_used_bytes(), 0);
    }
}
