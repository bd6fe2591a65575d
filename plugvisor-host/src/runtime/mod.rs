//! Host runtimes that turn a sandbox into a running isolate.
//!
//! The manager never runs plugin code itself. It asks a `SandboxRuntime`
//! for an `Isolate` per sandbox and calls `invoke` on a blocking worker
//! thread; everything the plugin does outside its isolate goes through the
//! `IoBroker` carried by the `Invocation`.

mod native;
mod wasm;

pub use native::{NativeHandler, NativeRuntime};
pub use wasm::{TrackingLimiter, WasmRuntime};

use crate::broker::IoBroker;
use crate::capabilities::CapabilityRequest;
use crate::error::{PluginError, PluginResult};
use crate::ids::TaskId;
use crate::plugin::Plugin;
use crate::sandbox::PluginSandbox;
use crate::telemetry::LogLevel;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Why an invocation did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum Fault {
    /// The plugin reported an error of its own.
    #[error("{0}")]
    Plugin(String),
    /// A boundary call was refused or failed on the host side, or the
    /// isolate could not be spawned.
    #[error(transparent)]
    Boundary(PluginError),
    /// The isolate died unexpectedly (trap, panic, malformed output).
    #[error("sandbox crashed: {0}")]
    Crashed(String),
    /// Fuel or memory budget exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// The sandbox was destroyed while the call was in flight.
    #[error("sandbox terminated")]
    Terminated,
}

impl From<PluginError> for Fault {
    fn from(e: PluginError) -> Self {
        Self::Boundary(e)
    }
}

/// One call of an exported plugin function.
#[derive(Clone)]
pub struct Invocation {
    pub task_id: TaskId,
    pub plugin_id: String,
    pub function: String,
    pub args: Value,
    broker: Arc<IoBroker>,
}

impl Invocation {
    pub fn new(
        task_id: TaskId,
        plugin_id: impl Into<String>,
        function: impl Into<String>,
        args: Value,
        broker: Arc<IoBroker>,
    ) -> Self {
        Self {
            task_id,
            plugin_id: plugin_id.into(),
            function: function.into(),
            args,
            broker,
        }
    }

    /// Performs a boundary call through the broker.
    pub fn call(&self, capability: &str, request: CapabilityRequest) -> Result<Value, Fault> {
        self.broker.call(capability, request)
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.broker.log(level, message.into());
    }

    /// True once cancellation was requested or the sandbox was destroyed.
    /// Long-running plugin code should poll this and return early.
    pub fn is_cancelled(&self) -> bool {
        self.broker.is_cancelled()
    }

    pub fn broker(&self) -> &IoBroker {
        &self.broker
    }
}

/// A running isolation unit for one sandbox.
pub trait Isolate: Send + Sync {
    /// Runs the invocation to completion. Called from a blocking thread.
    fn invoke(&self, invocation: &Invocation) -> Result<Value, Fault>;

    /// Forces any in-flight invocation to stop as soon as possible.
    fn terminate(&self);

    /// Peak memory observed across invocations, in bytes.
    fn peak_memory_bytes(&self) -> u64 {
        0
    }
}

pub trait SandboxRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Spawns an isolate bound to `sandbox`'s limits.
    fn spawn(&self, plugin: &Plugin, sandbox: &PluginSandbox) -> PluginResult<Arc<dyn Isolate>>;

    /// Drops anything kept for a plugin that is no longer installed.
    fn evict(&self, _plugin_id: &str) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::broker::{CancelSignal, NullHost};
    use crate::capabilities::CapabilityRegistry;
    use crate::context::{ExecutionScope, PluginExecutionContext};
    use crate::enforcer::PermissionEnforcer;
    use crate::permissions::GrantTable;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicBool;

    /// An invocation wired to an in-memory broker with the plugin's grants.
    pub(crate) fn invocation(
        plugin: &Plugin,
        sandbox: PluginSandbox,
        function: &str,
        args: Value,
    ) -> (Invocation, CancelSignal) {
        let registry = Arc::new(CapabilityRegistry::with_builtins());
        let grants = Arc::new(GrantTable::new());
        grants.set(&plugin.id, plugin.granted.clone());
        let ctx = PluginExecutionContext::new(
            plugin,
            ExecutionScope::user("tester"),
            &registry,
            sandbox,
            grants,
        );
        let task_id = TaskId::new();
        let cancel = CancelSignal::new();
        let broker = IoBroker::new(
            task_id,
            ctx,
            PermissionEnforcer::new(registry),
            Arc::new(MemoryStore::new()),
            Arc::new(NullHost),
            cancel.clone(),
            Arc::new(AtomicBool::new(false)),
        );
        let invocation = Invocation::new(task_id, &plugin.id, function, args, Arc::new(broker));
        (invocation, cancel)
    }
}
