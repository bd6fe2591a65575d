//! Plugin execution manager.
//!
//! Installs signed plugin bundles, runs their exported functions in isolated
//! sandboxes under a bounded scheduler, checks every boundary-crossing call
//! against the plugin's granted permissions, and keeps a single-slot backup
//! per plugin so updates can be rolled back.
//!
//! Plugin code runs inside an isolate supplied by a [`SandboxRuntime`]:
//! Wasmtime with fuel and memory limits, or registered native handlers.

mod broker;
mod capabilities;
mod config;
mod context;
mod enforcer;
mod error;
mod ids;
mod installer;
mod manager;
mod permissions;
mod plugin;
pub mod runtime;
mod sandbox;
mod scheduler;
mod store;
mod telemetry;

pub use broker::{BrokerReport, CancelSignal, HostBridge, IoBroker, NullHost};
pub use capabilities::{
    CapabilityEntry, CapabilityKind, CapabilityRegistry, CapabilityRequest, HOST_INVOKE,
    LOG_WRITE, NETWORK_FETCH, STORAGE_DELETE, STORAGE_GET, STORAGE_LIST, STORAGE_SET,
};
pub use config::{PluginManagerConfig, TelemetryConfig};
pub use context::{ExecutionScope, PluginExecutionContext};
pub use enforcer::{BoundaryAction, BoundaryEffect, PermissionEnforcer};
pub use error::{
    ErrorKind, InstallCheck, InstallationError, PluginError, PluginResult, RollbackError,
    StoreError,
};
pub use ids::{TaskId, WorkerId};
pub use installer::{Ed25519Verifier, InstallOptions, Installer, PluginBackup, SignatureVerifier};
pub use manager::{PluginManager, PluginManagerBuilder};
pub use permissions::{GrantTable, Permission, PermissionSet, PermissionTier};
pub use plugin::{InstallSource, Plugin, PluginStatus};
pub use runtime::{Fault, Invocation, Isolate, NativeRuntime, SandboxRuntime, WasmRuntime};
pub use sandbox::{LiveSandbox, PluginSandbox, SandboxAllocator, SandboxLimits};
pub use scheduler::{
    ExecutionHandle, PluginActivity, SchedulerDeps, SchedulerHandle, SchedulerStats, Settlement,
    TaskRequest, TaskState,
};
pub use store::{FileStore, MemoryStore, PluginStore, StorageSnapshot, StoreResult};
pub use telemetry::{
    ExecutionRecord, JournalEntry, LifecycleEvent, LifecycleRecord, LogLevel, PluginExecutionResult,
    PluginLogEntry, PluginMetrics, TelemetrySink, TelemetrySummary, load_journal,
};

// Re-exported so embedders can build bundles without a direct dependency.
pub use plugvisor_bundle;
