//! Shared fixtures for plugin manager integration tests.

#![allow(dead_code)]

use plugvisor_host::plugvisor_bundle::{BundleBuilder, KeyPair, PluginBundle, PluginManifest};
use plugvisor_host::*;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Upper bound for any blocking wait inside a native handler.
pub const HANDLER_LIMIT: Duration = Duration::from_secs(10);

pub fn config() -> PluginManagerConfig {
    PluginManagerConfig {
        engine_version: "1.2.0".into(),
        allow_unsigned_plugins: true,
        ..Default::default()
    }
}

pub fn manifest(id: &str, version: &str, permissions: &[&str]) -> PluginManifest {
    let mut manifest = PluginManifest::new(id, "Test Plugin", version);
    manifest.permissions = permissions.iter().map(|p| p.to_string()).collect();
    manifest
}

pub fn pack(manifest: PluginManifest, key: Option<&KeyPair>) -> PluginBundle {
    let mut builder = BundleBuilder::new(manifest).code(b"native plugin".to_vec());
    if let Some(key) = key {
        builder = builder.sign(&key.signing_key);
    }
    PluginBundle::from_bytes(&builder.build().unwrap()).unwrap()
}

/// Packs `manifest` around a WAT module; wasmtime compiles the text format.
pub fn pack_wasm(manifest: PluginManifest, wat: &str) -> PluginBundle {
    let bytes = BundleBuilder::new(manifest)
        .code(wat.as_bytes().to_vec())
        .build()
        .unwrap();
    PluginBundle::from_bytes(&bytes).unwrap()
}

pub fn bundle(id: &str, version: &str, permissions: &[&str]) -> PluginBundle {
    pack(manifest(id, version, permissions), None)
}

pub fn manager(
    config: PluginManagerConfig,
    runtime: Arc<NativeRuntime>,
    store: Arc<dyn PluginStore>,
) -> PluginManager {
    PluginManager::builder()
        .config(config)
        .runtime(runtime)
        .store(store)
        .build()
        .unwrap()
}

pub fn wasm_manager(config: PluginManagerConfig, store: Arc<dyn PluginStore>) -> PluginManager {
    PluginManager::builder()
        .config(config)
        .runtime(Arc::new(WasmRuntime::new()))
        .store(store)
        .build()
        .unwrap()
}

/// Guest module speaking the host ABI. `store` writes `k = 1`; `fetch`
/// asks for a URL outside any sane allowlist; `store_until_denied` keeps
/// writing until the host answers with an `err` envelope and returns it.
pub const WASM_GUEST: &str = r#"
(module
  (import "host" "call" (func $call (param i32 i32 i32 i32) (result i64)))
  (import "host" "log" (func $log (param i32 i32 i32)))
  (import "host" "cancelled" (func $cancelled (result i32)))
  (memory (export "memory") 1)
  (global $bump (mut i32) (i32.const 1024))
  (data (i32.const 0) "{\"ok\":42}")
  (data (i32.const 64) "storage.set")
  (data (i32.const 80) "{\"op\":\"storage_set\",\"key\":\"k\",\"value\":1}")
  (data (i32.const 128) "network.fetch")
  (data (i32.const 144) "{\"op\":\"fetch\",\"url\":\"https://evil.example/\"}")

  (func (export "alloc") (param $len i32) (result i32)
    (local $p i32)
    (local.set $p (global.get $bump))
    (global.set $bump (i32.add (global.get $bump) (local.get $len)))
    (local.get $p))

  (func (export "answer") (param i32 i32) (result i64)
    (i64.const 9))

  (func (export "spin") (param i32 i32) (result i64)
    (loop $l (br $l))
    (i64.const 0))

  (func (export "store") (param i32 i32) (result i64)
    (call $call (i32.const 64) (i32.const 11) (i32.const 80) (i32.const 40)))

  (func (export "fetch") (param i32 i32) (result i64)
    (call $call (i32.const 128) (i32.const 13) (i32.const 144) (i32.const 44)))

  (func (export "store_until_denied") (param i32 i32) (result i64)
    (local $envelope i64)
    (loop $again
      (global.set $bump (i32.const 1024))
      (local.set $envelope
        (call $call (i32.const 64) (i32.const 11) (i32.const 80) (i32.const 40)))
      ;; {"ok"... has 'o' (111) at byte 2, {"err"... has 'e'.
      (br_if $again
        (i32.eq
          (i32.load8_u offset=2
            (i32.wrap_i64 (i64.shr_u (local.get $envelope) (i64.const 32))))
          (i32.const 111))))
    (local.get $envelope))
)
"#;

pub async fn install(manager: &PluginManager, bundle: &PluginBundle) -> Arc<Plugin> {
    manager
        .install_plugin(bundle, InstallOptions::unsigned())
        .await
        .unwrap()
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Numbered gates that native handlers block on until a test opens them.
#[derive(Default)]
pub struct Gates {
    opened: Mutex<HashSet<u64>>,
    started: Mutex<Vec<u64>>,
    cv: Condvar,
}

impl Gates {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self, n: u64) {
        self.opened.lock().unwrap().insert(n);
        self.cv.notify_all();
    }

    pub fn started(&self) -> Vec<u64> {
        self.started.lock().unwrap().clone()
    }

    /// Records `n` as started, then blocks until gate `n` opens or the
    /// invocation is cancelled. Returns true when the gate opened.
    pub fn pass(&self, n: u64, invocation: &Invocation) -> bool {
        self.started.lock().unwrap().push(n);
        let deadline = Instant::now() + HANDLER_LIMIT;
        let mut opened = self.opened.lock().unwrap();
        loop {
            if opened.contains(&n) {
                return true;
            }
            if invocation.is_cancelled() || Instant::now() >= deadline {
                return false;
            }
            opened = self
                .cv
                .wait_timeout(opened, Duration::from_millis(10))
                .unwrap()
                .0;
        }
    }
}

/// Registers `run` as a gated handler that returns its numeric argument.
pub fn gated(runtime: &NativeRuntime, plugin_id: &str, gates: &Arc<Gates>) {
    let gates = Arc::clone(gates);
    runtime.register(plugin_id, "run", move |inv| {
        let n = inv.args.as_u64().unwrap_or(0);
        if gates.pass(n, inv) {
            Ok(Value::from(n))
        } else {
            Err(Fault::Plugin(format!("gate {n} never opened")))
        }
    });
}

/// A store whose writes can be made to fail on demand.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    /// Number of upcoming `put_plugin` calls that fail.
    failing_puts: AtomicUsize,
    fail_deletes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn take_put_failure(&self) -> bool {
        self.failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl PluginStore for FailingStore {
    fn get_plugin(&self, plugin_id: &str) -> StoreResult<Option<Plugin>> {
        self.inner.get_plugin(plugin_id)
    }

    fn put_plugin(&self, plugin: &Plugin) -> StoreResult<()> {
        if self.take_put_failure() {
            return Err(StoreError::WriteFailed(format!("injected failure for {}", plugin.id)));
        }
        self.inner.put_plugin(plugin)
    }

    fn delete_plugin(&self, plugin_id: &str) -> StoreResult<()> {
        self.inner.delete_plugin(plugin_id)
    }

    fn list_plugins(&self) -> StoreResult<Vec<Plugin>> {
        self.inner.list_plugins()
    }

    fn get_backup(&self, plugin_id: &str) -> StoreResult<Option<PluginBackup>> {
        self.inner.get_backup(plugin_id)
    }

    fn put_backup(&self, backup: &PluginBackup) -> StoreResult<()> {
        self.inner.put_backup(backup)
    }

    fn take_backup(&self, plugin_id: &str) -> StoreResult<Option<PluginBackup>> {
        self.inner.take_backup(plugin_id)
    }

    fn delete_backup(&self, plugin_id: &str) -> StoreResult<()> {
        self.inner.delete_backup(plugin_id)
    }

    fn storage_get(&self, plugin_id: &str, key: &str) -> StoreResult<Option<Value>> {
        self.inner.storage_get(plugin_id, key)
    }

    fn storage_set(&self, plugin_id: &str, key: &str, value: Value) -> StoreResult<()> {
        self.inner.storage_set(plugin_id, key, value)
    }

    fn storage_set_if(
        &self,
        plugin_id: &str,
        key: &str,
        value: Value,
        admit: &mut dyn FnMut(u64) -> bool,
    ) -> StoreResult<bool> {
        self.inner.storage_set_if(plugin_id, key, value, admit)
    }

    fn storage_delete(&self, plugin_id: &str, key: &str) -> StoreResult<bool> {
        self.inner.storage_delete(plugin_id, key)
    }

    fn storage_snapshot(&self, plugin_id: &str) -> StoreResult<StorageSnapshot> {
        self.inner.storage_snapshot(plugin_id)
    }

    fn storage_replace(&self, plugin_id: &str, snapshot: StorageSnapshot) -> StoreResult<()> {
        self.inner.storage_replace(plugin_id, snapshot)
    }

    fn storage_purge(&self, plugin_id: &str) -> StoreResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed(format!("injected purge failure for {plugin_id}")));
        }
        self.inner.storage_purge(plugin_id)
    }
}
