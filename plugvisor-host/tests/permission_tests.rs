//! Boundary enforcement during real executions.

mod common;

use common::*;
use plugvisor_host::*;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

const PLUGIN: &str = "acme.notes";

fn set(key: &str, value: Value) -> CapabilityRequest {
    CapabilityRequest::StorageSet {
        key: key.into(),
        value,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn revocation_applies_to_running_task() {
    let runtime = Arc::new(NativeRuntime::new());
    let store = Arc::new(MemoryStore::new());
    let manager = manager(config(), Arc::clone(&runtime), store.clone());
    install(&manager, &bundle(PLUGIN, "1.0.0", &["storage-write"])).await;

    let gates = Gates::new();
    let handler_gates = Arc::clone(&gates);
    runtime.register(PLUGIN, "save", move |inv| {
        inv.call(STORAGE_SET, set("first", json!(1)))?;
        if !handler_gates.pass(1, inv) {
            return Err(Fault::Plugin("gate closed".into()));
        }
        inv.call(STORAGE_SET, set("second", json!(2)))?;
        Ok(json!("saved both"))
    });

    let handle = manager
        .submit(PLUGIN, "save", Value::Null, ExecutionScope::user("u-1"))
        .await
        .unwrap();
    assert!(eventually(|| gates.started() == vec![1]).await);

    manager
        .revoke_permission(PLUGIN, Permission::StorageWrite)
        .await
        .unwrap();
    gates.open(1);

    match handle.wait().await {
        Err(PluginError::PermissionDenied { plugin_id, action }) => {
            assert_eq!(plugin_id, PLUGIN);
            assert!(action.contains("second"));
        }
        other => panic!("expected permission denial, got {other:?}"),
    }
    assert_eq!(store.storage_get(PLUGIN, "first").unwrap(), Some(json!(1)));
    assert_eq!(store.storage_get(PLUGIN, "second").unwrap(), None);

    // Reads stay available: they are always granted.
    runtime.register(PLUGIN, "read", |inv| {
        inv.call(STORAGE_GET, CapabilityRequest::StorageGet { key: "first".into() })
    });
    let read = manager
        .execute_plugin(PLUGIN, "read", Value::Null, ExecutionScope::user("u-1"))
        .await
        .unwrap();
    assert_eq!(read.result, Some(json!(1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denial_outranks_the_plugins_own_error() {
    let runtime = Arc::new(NativeRuntime::new());
    let manager = manager(config(), Arc::clone(&runtime), Arc::new(MemoryStore::new()));
    // Declares nothing dangerous, then tries to reach the host anyway.
    install(&manager, &bundle(PLUGIN, "1.0.0", &[])).await;
    runtime.register(PLUGIN, "sneak", |inv| {
        let request = CapabilityRequest::HostInvoke {
            operation: "read-clipboard".into(),
            payload: Value::Null,
        };
        match inv.call(HOST_INVOKE, request) {
            Ok(_) => Ok(json!("got in")),
            Err(_) => Err(Fault::Plugin("something went wrong".into())),
        }
    });

    let err = manager
        .execute_plugin(PLUGIN, "sneak", Value::Null, ExecutionScope::user("u-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(err.to_string().contains("read-clipboard"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn egress_outside_allowlist_is_denied_before_any_request() {
    let runtime = Arc::new(NativeRuntime::new());
    let manager = manager(config(), Arc::clone(&runtime), Arc::new(MemoryStore::new()));
    let mut m = manifest(PLUGIN, "1.0.0", &["network"]);
    m.limits.network_allowlist = vec!["api.example.com".into()];
    install(&manager, &pack(m, None)).await;
    runtime.register(PLUGIN, "fetch", |inv| {
        inv.call(
            NETWORK_FETCH,
            CapabilityRequest::Fetch {
                url: "https://evil.example.net/exfiltrate".into(),
            },
        )
    });

    let handle = manager
        .submit(PLUGIN, "fetch", Value::Null, ExecutionScope::user("u-1"))
        .await
        .unwrap();
    let id = handle.id();
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(err.to_string().contains("evil.example.net"));

    let record = manager.telemetry().execution(id).unwrap();
    assert_eq!(record.result.metrics.network_requests, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn storage_quota_is_enforced_per_write() {
    let runtime = Arc::new(NativeRuntime::new());
    let store = Arc::new(MemoryStore::new());
    let manager = manager(config(), Arc::clone(&runtime), store.clone());
    let mut m = manifest(PLUGIN, "1.0.0", &["storage-write"]);
    m.limits.storage_quota_bytes = Some(64);
    install(&manager, &pack(m, None)).await;
    runtime.register(PLUGIN, "fill", |inv| {
        inv.call(STORAGE_SET, set("small", json!("fits")))?;
        inv.call(STORAGE_SET, set("large", json!("x".repeat(128))))?;
        Ok(Value::Null)
    });

    let err = manager
        .execute_plugin(PLUGIN, "fill", Value::Null, ExecutionScope::user("u-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceLimitExceeded);
    assert!(store.storage_get(PLUGIN, "small").unwrap().is_some());
    assert!(store.storage_get(PLUGIN, "large").unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn regranting_restores_access() {
    let runtime = Arc::new(NativeRuntime::new());
    let manager = manager(config(), Arc::clone(&runtime), Arc::new(MemoryStore::new()));
    install(&manager, &bundle(PLUGIN, "1.0.0", &["storage-write"])).await;
    runtime.register(PLUGIN, "save", |inv| inv.call(STORAGE_SET, set("k", json!(true))));

    manager
        .revoke_permission(PLUGIN, Permission::StorageWrite)
        .await
        .unwrap();
    assert!(
        manager
            .execute_plugin(PLUGIN, "save", Value::Null, ExecutionScope::user("u-1"))
            .await
            .is_err()
    );

    let plugin = manager
        .grant_permission(PLUGIN, Permission::StorageWrite)
        .await
        .unwrap();
    assert!(plugin.granted.is_granted(Permission::StorageWrite));
    manager
        .execute_plugin(PLUGIN, "save", Value::Null, ExecutionScope::user("u-1"))
        .await
        .unwrap();
}

/// Host bridge that records which plugins reached it.
#[derive(Default)]
struct ProjectHost {
    writes: Mutex<Vec<String>>,
}

impl HostBridge for ProjectHost {
    fn invoke(&self, plugin_id: &str, operation: &str, _payload: Value) -> PluginResult<Value> {
        self.writes.lock().unwrap().push(format!("{plugin_id}:{operation}"));
        Ok(json!("written"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn project_write_gates_an_embedder_capability() {
    const WRITE_NODE: &str = "project.write-node";
    let mut registry = CapabilityRegistry::with_builtins();
    registry
        .register_with_permission(WRITE_NODE, CapabilityKind::HostInvoke, Permission::ProjectWrite)
        .unwrap();
    let host = Arc::new(ProjectHost::default());
    let runtime = Arc::new(NativeRuntime::new());
    let manager = PluginManager::builder()
        .config(config())
        .runtime(runtime.clone())
        .store(Arc::new(MemoryStore::new()))
        .registry(registry)
        .host(host.clone())
        .build()
        .unwrap();

    // Host access alone does not open a capability gated by project-write.
    install(&manager, &bundle(PLUGIN, "1.0.0", &["host-access"])).await;
    install(&manager, &bundle("acme.editor", "1.0.0", &["project-write"])).await;
    for plugin in [PLUGIN, "acme.editor"] {
        runtime.register(plugin, "edit", |inv| {
            inv.call(
                WRITE_NODE,
                CapabilityRequest::HostInvoke {
                    operation: "write-node".into(),
                    payload: json!({"node": 7}),
                },
            )
        });
    }

    let err = manager
        .execute_plugin(PLUGIN, "edit", Value::Null, ExecutionScope::user("u-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let ok = manager
        .execute_plugin("acme.editor", "edit", Value::Null, ExecutionScope::user("u-1"))
        .await
        .unwrap();
    assert_eq!(ok.result, Some(json!("written")));
    assert_eq!(*host.writes.lock().unwrap(), vec!["acme.editor:write-node"]);

    manager
        .revoke_permission("acme.editor", Permission::ProjectWrite)
        .await
        .unwrap();
    let err = manager
        .execute_plugin("acme.editor", "edit", Value::Null, ExecutionScope::user("u-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(host.writes.lock().unwrap().len(), 1);
}
