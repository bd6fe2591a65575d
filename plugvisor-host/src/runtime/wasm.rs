//! Wasmtime runtime for core Wasm modules.
//!
//! All isolates share one `Engine`, created on first use, and compiled
//! modules are cached per plugin until its content hash changes. Every
//! invocation gets a fresh `Store` with:
//! - Memory isolation (ceiling from the sandbox, tracked by `TrackingLimiter`)
//! - A CPU fuel budget (prevents infinite loops)
//! - An epoch deadline one tick ahead (forced termination)
//!
//! `terminate` raises the isolate's flag and bumps the shared epoch. Stores
//! whose flag is still clear just renew their deadline and keep running.
//!
//! Guest ABI: the module exports `memory`, `alloc(len) -> ptr` and one
//! `(ptr, len) -> i64` function per plugin export. Arguments are passed as
//! JSON; the packed `(ptr << 32) | len` result points at a JSON envelope
//! `{"ok": value}` or `{"err": "message"}`. Imports live in module `host`:
//! `call`, `log` and `cancelled`.

use super::{Fault, Invocation, Isolate, SandboxRuntime};
use crate::capabilities::CapabilityRequest;
use crate::error::{PluginError, PluginResult};
use crate::plugin::Plugin;
use crate::sandbox::PluginSandbox;
use crate::telemetry::LogLevel;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;
use tracing::{debug, info};
use wasmtime::{
    Caller, Config, Engine, Extern, Linker, Module, ResourceLimiter, Store, Trap, UpdateDeadline,
};

/// A resource limiter that tracks actual memory usage.
/// Wraps memory limit enforcement with allocation tracking.
pub struct TrackingLimiter {
    /// Maximum memory allowed in bytes.
    max_memory: usize,
    /// Current memory allocated (tracked via grow callbacks).
    current_memory: usize,
    peak_memory: usize,
    /// Set once a growth request was refused.
    denied: bool,
    max_tables: usize,
    max_table_elements: usize,
    max_instances: usize,
    max_memories: usize,
}

impl TrackingLimiter {
    pub fn new(max_memory: usize) -> Self {
        Self {
            max_memory,
            current_memory: 0,
            peak_memory: 0,
            denied: false,
            max_tables: 10,
            max_table_elements: 20_000,
            max_instances: 1,
            max_memories: 1,
        }
    }

    /// Get the current memory usage in bytes.
    pub fn current_memory_bytes(&self) -> usize {
        self.current_memory
    }

    pub fn peak_memory_bytes(&self) -> usize {
        self.peak_memory
    }

    pub fn denied(&self) -> bool {
        self.denied
    }
}

impl ResourceLimiter for TrackingLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired <= self.max_memory {
            self.current_memory = desired;
            self.peak_memory = self.peak_memory.max(desired);
            Ok(true)
        } else {
            self.denied = true;
            debug!(
                current = current,
                desired = desired,
                max = self.max_memory,
                "Memory growth denied - would exceed limit"
            );
            Ok(false)
        }
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(desired <= self.max_table_elements)
    }

    fn instances(&self) -> usize {
        self.max_instances
    }

    fn tables(&self) -> usize {
        self.max_tables
    }

    fn memories(&self) -> usize {
        self.max_memories
    }
}

/// Raised inside an import or at an epoch check once the isolate was terminated.
#[derive(Debug, Error)]
#[error("sandbox terminated during host call")]
struct Interrupted;

#[derive(Debug, Error)]
#[error("function '{0}' is not exported by the module")]
struct MissingExport(String);

struct WasmState {
    limiter: TrackingLimiter,
    invocation: Invocation,
}

struct CachedModule {
    content_hash: String,
    module: Module,
}

/// Runs plugins as core Wasm modules on a shared engine.
#[derive(Default)]
pub struct WasmRuntime {
    engine: OnceLock<Engine>,
    modules: Mutex<HashMap<String, CachedModule>>,
}

impl WasmRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn engine(&self) -> wasmtime::Result<&Engine> {
        if let Some(engine) = self.engine.get() {
            return Ok(engine);
        }
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config)?;
        Ok(self.engine.get_or_init(|| engine))
    }

    /// Compiles `plugin` once per content hash. Compilation happens outside
    /// the cache lock; a concurrent compile of the same bytes just loses.
    fn module(&self, engine: &Engine, plugin: &Plugin) -> wasmtime::Result<Module> {
        if let Some(cached) = self.cache().get(&plugin.id) {
            if cached.content_hash == plugin.content_hash {
                return Ok(cached.module.clone());
            }
        }
        let module = Module::new(engine, &plugin.code)?;
        info!(
            plugin_id = %plugin.id,
            version = plugin.version,
            bytes = plugin.code.len(),
            "Compiled Wasm module"
        );
        self.cache().insert(
            plugin.id.clone(),
            CachedModule {
                content_hash: plugin.content_hash.clone(),
                module: module.clone(),
            },
        );
        Ok(module)
    }

    /// Number of plugins with a compiled module in the cache.
    pub fn cached_modules(&self) -> usize {
        self.cache().len()
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedModule>> {
        self.modules.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SandboxRuntime for WasmRuntime {
    fn name(&self) -> &'static str {
        "wasm"
    }

    fn spawn(&self, plugin: &Plugin, sandbox: &PluginSandbox) -> PluginResult<Arc<dyn Isolate>> {
        let crashed = |message: String| PluginError::SandboxCrash {
            plugin_id: plugin.id.clone(),
            message,
        };

        let engine = self.engine().map_err(|e| crashed(format!("engine: {e}")))?;
        let module = self
            .module(engine, plugin)
            .map_err(|e| crashed(format!("failed to compile module: {e}")))?;

        let mut linker = Linker::new(engine);
        link_host(&mut linker).map_err(|e| crashed(format!("failed to link host: {e}")))?;

        let limits = sandbox.limits();
        debug!(
            plugin_id = %plugin.id,
            worker_id = %sandbox.worker_id(),
            memory = limits.memory_bytes,
            fuel = limits.fuel_per_call,
            "Spawned Wasm isolate"
        );

        Ok(Arc::new(WasmIsolate {
            engine: engine.clone(),
            module,
            linker,
            memory_limit: usize::try_from(limits.memory_bytes).unwrap_or(usize::MAX),
            fuel_per_call: limits.fuel_per_call,
            peak_memory: AtomicU64::new(0),
            terminated: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn evict(&self, plugin_id: &str) {
        if self.cache().remove(plugin_id).is_some() {
            debug!(plugin_id = %plugin_id, "Evicted compiled Wasm module");
        }
    }
}

struct WasmIsolate {
    engine: Engine,
    module: Module,
    linker: Linker<WasmState>,
    memory_limit: usize,
    fuel_per_call: u64,
    peak_memory: AtomicU64,
    terminated: Arc<AtomicBool>,
}

impl WasmIsolate {
    fn run(&self, store: &mut Store<WasmState>, invocation: &Invocation) -> wasmtime::Result<Vec<u8>> {
        let instance = self.linker.instantiate(&mut *store, &self.module)?;
        if instance.get_func(&mut *store, &invocation.function).is_none() {
            return Err(wasmtime::Error::new(MissingExport(invocation.function.clone())));
        }
        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| wasmtime::Error::msg("module does not export `memory`"))?;
        let alloc = instance.get_typed_func::<i32, i32>(&mut *store, "alloc")?;
        let func = instance.get_typed_func::<(i32, i32), i64>(&mut *store, &invocation.function)?;

        let args = serde_json::to_vec(&invocation.args)?;
        let len = i32::try_from(args.len())?;
        let ptr = alloc.call(&mut *store, len)?;
        memory.write(&mut *store, usize::try_from(ptr)?, &args)?;

        let packed = func.call(&mut *store, (ptr, len))?;
        let (out_ptr, out_len) = unpack(packed);
        memory
            .data(&*store)
            .get(out_ptr..out_ptr.saturating_add(out_len))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| wasmtime::Error::msg("result pointer out of bounds"))
    }

    fn classify(&self, error: wasmtime::Error, memory_denied: bool) -> Fault {
        if self.terminated.load(Ordering::SeqCst) || error.downcast_ref::<Interrupted>().is_some() {
            return Fault::Terminated;
        }
        if let Some(missing) = error.downcast_ref::<MissingExport>() {
            return Fault::Plugin(missing.to_string());
        }
        match error.downcast_ref::<Trap>() {
            Some(Trap::OutOfFuel) => Fault::ResourceExhausted(format!(
                "fuel budget of {} exhausted",
                self.fuel_per_call
            )),
            Some(Trap::Interrupt) => Fault::Terminated,
            _ if memory_denied => Fault::ResourceExhausted(format!(
                "memory limit of {} bytes reached",
                self.memory_limit
            )),
            _ => Fault::Crashed(error.to_string()),
        }
    }
}

impl Isolate for WasmIsolate {
    fn invoke(&self, invocation: &Invocation) -> Result<Value, Fault> {
        let state = WasmState {
            limiter: TrackingLimiter::new(self.memory_limit),
            invocation: invocation.clone(),
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limiter);
        store
            .set_fuel(self.fuel_per_call)
            .map_err(|e| Fault::Crashed(e.to_string()))?;
        store.set_epoch_deadline(1);
        let terminated = Arc::clone(&self.terminated);
        store.epoch_deadline_callback(move |_| {
            if terminated.load(Ordering::SeqCst) {
                Err(wasmtime::Error::new(Interrupted))
            } else {
                Ok(UpdateDeadline::Continue(1))
            }
        });
        // Checked after the deadline is armed, so a concurrent terminate
        // either lands here or interrupts the running guest.
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Fault::Terminated);
        }

        let outcome = self.run(&mut store, invocation);
        let limiter = &store.data().limiter;
        self.peak_memory
            .fetch_max(limiter.peak_memory_bytes() as u64, Ordering::Relaxed);
        match outcome {
            Ok(bytes) => decode_envelope(&bytes),
            Err(e) => Err(self.classify(e, limiter.denied())),
        }
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.engine.increment_epoch();
    }

    fn peak_memory_bytes(&self) -> u64 {
        self.peak_memory.load(Ordering::Relaxed)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum Envelope {
    Ok(Value),
    Err(String),
}

fn decode_envelope(bytes: &[u8]) -> Result<Value, Fault> {
    match serde_json::from_slice::<Envelope>(bytes) {
        Ok(Envelope::Ok(value)) => Ok(value),
        Ok(Envelope::Err(message)) => Err(Fault::Plugin(message)),
        Err(e) => Err(Fault::Crashed(format!("malformed result envelope: {e}"))),
    }
}

fn pack(ptr: i32, len: i32) -> i64 {
    (((ptr as u32) as i64) << 32) | ((len as u32) as i64)
}

fn unpack(packed: i64) -> (usize, usize) {
    let ptr = ((packed as u64) >> 32) as usize;
    let len = ((packed as u64) & 0xFFFF_FFFF) as usize;
    (ptr, len)
}

fn guest_memory(caller: &mut Caller<'_, WasmState>) -> wasmtime::Result<wasmtime::Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("module does not export `memory`"))
}

fn read_guest(caller: &mut Caller<'_, WasmState>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let start = usize::try_from(ptr)?;
    let end = start.saturating_add(usize::try_from(len)?);
    memory
        .data(&*caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| wasmtime::Error::msg("guest pointer out of bounds"))
}

fn write_guest(caller: &mut Caller<'_, WasmState>, bytes: &[u8]) -> wasmtime::Result<i64> {
    let alloc = caller
        .get_export("alloc")
        .and_then(Extern::into_func)
        .ok_or_else(|| wasmtime::Error::msg("module does not export `alloc`"))?
        .typed::<i32, i32>(&*caller)?;
    let len = i32::try_from(bytes.len())?;
    let ptr = alloc.call(&mut *caller, len)?;
    let memory = guest_memory(caller)?;
    memory.write(&mut *caller, usize::try_from(ptr)?, bytes)?;
    Ok(pack(ptr, len))
}

fn link_host(linker: &mut Linker<WasmState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        "host",
        "call",
        |mut caller: Caller<'_, WasmState>,
         name_ptr: i32,
         name_len: i32,
         req_ptr: i32,
         req_len: i32|
         -> wasmtime::Result<i64> {
            let name = read_guest(&mut caller, name_ptr, name_len)?;
            let name = String::from_utf8(name)
                .map_err(|_| wasmtime::Error::msg("capability name is not UTF-8"))?;
            let request = read_guest(&mut caller, req_ptr, req_len)?;
            let envelope = match serde_json::from_slice::<CapabilityRequest>(&request) {
                Ok(request) => match caller.data().invocation.call(&name, request) {
                    Ok(value) => json!({ "ok": value }),
                    Err(Fault::Terminated) => return Err(wasmtime::Error::new(Interrupted)),
                    Err(fault) => json!({ "err": fault.to_string() }),
                },
                Err(e) => json!({ "err": format!("malformed request: {e}") }),
            };
            write_guest(&mut caller, &serde_json::to_vec(&envelope)?)
        },
    )?;

    linker.func_wrap(
        "host",
        "log",
        |mut caller: Caller<'_, WasmState>, level: i32, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let message = String::from_utf8_lossy(&bytes).into_owned();
            caller
                .data()
                .invocation
                .log(LogLevel::from_abi(level), message);
            Ok(())
        },
    )?;

    linker.func_wrap("host", "cancelled", |caller: Caller<'_, WasmState>| -> i32 {
        i32::from(caller.data().invocation.is_cancelled())
    })?;

    Ok(())
}
