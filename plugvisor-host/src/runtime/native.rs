//! Native runtime: plugin functions implemented as Rust closures.
//!
//! Handlers are registered per plugin and function name. A native handler
//! cannot be preempted; `terminate` only flips a flag that the broker and
//! `Invocation::is_cancelled` report, and the scheduler stops waiting.

use super::{Fault, Invocation, Isolate, SandboxRuntime};
use crate::error::PluginResult;
use crate::plugin::Plugin;
use crate::sandbox::PluginSandbox;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

pub type NativeHandler = Arc<dyn Fn(&Invocation) -> Result<Value, Fault> + Send + Sync>;

#[derive(Default)]
pub struct NativeRuntime {
    handlers: RwLock<HashMap<String, HashMap<String, NativeHandler>>>,
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the handler for `plugin_id::function`.
    pub fn register<F>(&self, plugin_id: &str, function: &str, handler: F)
    where
        F: Fn(&Invocation) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(plugin_id.to_string())
            .or_default()
            .insert(function.to_string(), Arc::new(handler));
    }

    pub fn has_handler(&self, plugin_id: &str, function: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(plugin_id)
            .is_some_and(|fns| fns.contains_key(function))
    }
}

impl SandboxRuntime for NativeRuntime {
    fn name(&self) -> &'static str {
        "native"
    }

    fn spawn(&self, plugin: &Plugin, sandbox: &PluginSandbox) -> PluginResult<Arc<dyn Isolate>> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&plugin.id)
            .cloned()
            .unwrap_or_default();
        debug!(
            plugin_id = %plugin.id,
            worker_id = %sandbox.worker_id(),
            functions = handlers.len(),
            "Spawned native isolate"
        );
        Ok(Arc::new(NativeIsolate {
            handlers,
            terminated: AtomicBool::new(false),
        }))
    }
}

struct NativeIsolate {
    handlers: HashMap<String, NativeHandler>,
    terminated: AtomicBool,
}

impl Isolate for NativeIsolate {
    fn invoke(&self, invocation: &Invocation) -> Result<Value, Fault> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Fault::Terminated);
        }
        let handler = self.handlers.get(&invocation.function).ok_or_else(|| {
            Fault::Plugin(format!(
                "no native handler for '{}::{}'",
                invocation.plugin_id, invocation.function
            ))
        })?;
        handler(invocation)
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}
