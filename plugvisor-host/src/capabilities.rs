//! Capability registry: capability name → required permission → handler kind.
//!
//! Handlers are a closed set of variants dispatched by the I/O broker; the
//! registry itself only stores what each name means.

use crate::error::{PluginError, PluginResult};
use crate::permissions::Permission;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const STORAGE_GET: &str = "storage.get";
pub const STORAGE_LIST: &str = "storage.list";
pub const STORAGE_SET: &str = "storage.set";
pub const STORAGE_DELETE: &str = "storage.delete";
pub const NETWORK_FETCH: &str = "network.fetch";
pub const HOST_INVOKE: &str = "host.invoke";
pub const LOG_WRITE: &str = "log.write";

/// Which handler serves a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityKind {
    StorageRead,
    StorageWrite,
    NetworkFetch,
    HostInvoke,
    Log,
}

impl CapabilityKind {
    /// Permission a plugin must hold to call a capability of this kind.
    pub fn required_permission(&self) -> Permission {
        match self {
            Self::StorageRead => Permission::StorageRead,
            Self::StorageWrite => Permission::StorageWrite,
            Self::NetworkFetch => Permission::Network,
            Self::HostInvoke => Permission::HostAccess,
            Self::Log => Permission::Logger,
        }
    }

    /// Whether a handler of this kind can serve `request`.
    pub fn accepts(&self, request: &CapabilityRequest) -> bool {
        matches!(
            (self, request),
            (
                Self::StorageRead,
                CapabilityRequest::StorageGet { .. } | CapabilityRequest::StorageList
            ) | (
                Self::StorageWrite,
                CapabilityRequest::StorageSet { .. } | CapabilityRequest::StorageDelete { .. }
            ) | (Self::NetworkFetch, CapabilityRequest::Fetch { .. })
                | (Self::HostInvoke, CapabilityRequest::HostInvoke { .. })
                | (Self::Log, CapabilityRequest::Log { .. })
        )
    }
}

/// Typed payload of a boundary call, as decoded from the plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CapabilityRequest {
    StorageGet { key: String },
    StorageList,
    StorageSet { key: String, value: Value },
    StorageDelete { key: String },
    Fetch { url: String },
    HostInvoke {
        operation: String,
        #[serde(default)]
        payload: Value,
    },
    Log {
        level: crate::telemetry::LogLevel,
        message: String,
    },
}

impl CapabilityRequest {
    /// Short name used in diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::StorageGet { .. } => "storage_get",
            Self::StorageList => "storage_list",
            Self::StorageSet { .. } => "storage_set",
            Self::StorageDelete { .. } => "storage_delete",
            Self::Fetch { .. } => "fetch",
            Self::HostInvoke { .. } => "host_invoke",
            Self::Log { .. } => "log",
        }
    }
}

/// A registered capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityEntry {
    pub name: String,
    pub kind: CapabilityKind,
    pub required_permission: Permission,
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    entries: BTreeMap<String, CapabilityEntry>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in capabilities.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (name, kind) in [
            (STORAGE_GET, CapabilityKind::StorageRead),
            (STORAGE_LIST, CapabilityKind::StorageRead),
            (STORAGE_SET, CapabilityKind::StorageWrite),
            (STORAGE_DELETE, CapabilityKind::StorageWrite),
            (NETWORK_FETCH, CapabilityKind::NetworkFetch),
            (HOST_INVOKE, CapabilityKind::HostInvoke),
            (LOG_WRITE, CapabilityKind::Log),
        ] {
            registry.entries.insert(
                name.to_string(),
                CapabilityEntry {
                    name: name.to_string(),
                    kind,
                    required_permission: kind.required_permission(),
                },
            );
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, kind: CapabilityKind) -> PluginResult<()> {
        self.register_with_permission(name, kind, kind.required_permission())
    }

    /// Registers a capability whose permission differs from its kind's default,
    /// e.g. a host operation gated by `project-write`.
    pub fn register_with_permission(
        &mut self,
        name: impl Into<String>,
        kind: CapabilityKind,
        required_permission: Permission,
    ) -> PluginResult<()> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(PluginError::CapabilityExists(name));
        }
        self.entries.insert(
            name.clone(),
            CapabilityEntry {
                name,
                kind,
                required_permission,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&CapabilityEntry> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CapabilityEntry> {
        self.entries.values()
    }

    /// The capabilities a plugin holding `permissions` is entitled to call.
    pub fn closure_for<'a>(
        &self,
        permissions: impl IntoIterator<Item = &'a Permission>,
    ) -> BTreeMap<String, CapabilityEntry> {
        let held: Vec<Permission> = permissions.into_iter().copied().collect();
        self.entries
            .values()
            .filter(|entry| held.contains(&entry.required_permission))
            .map(|entry| (entry.name.clone(), entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
