//! Permissions a plugin declares, and the grants the host hands out.
//!
//! Three tiers:
//! - Tier 1: Always granted (logger, own storage reads)
//! - Tier 2: Granted at install when requested (project reads/writes)
//! - Tier 3: Dangerous, boundary-checked on every call (storage writes, network, host access)
//!
//! No built-in capability requires a tier 2 permission. They exist for
//! capabilities an embedder registers with
//! `CapabilityRegistry::register_with_permission`, typically host
//! operations over the embedder's own project data.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

/// A named right to cross one kind of boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    // Tier 1: always granted
    Logger,
    StorageRead,

    // Tier 2: install-time, for embedder-registered capabilities
    ProjectRead,
    ProjectWrite,

    // Tier 3: dangerous
    StorageWrite,
    Network,
    HostAccess,
}

impl Permission {
    pub const ALL: [Permission; 7] = [
        Self::Logger,
        Self::StorageRead,
        Self::ProjectRead,
        Self::ProjectWrite,
        Self::StorageWrite,
        Self::Network,
        Self::HostAccess,
    ];

    /// Tier 1 permissions cannot be withheld at install time.
    pub fn tier(&self) -> PermissionTier {
        match self {
            Self::Logger | Self::StorageRead => PermissionTier::AlwaysGranted,
            Self::ProjectRead | Self::ProjectWrite => PermissionTier::InstallTime,
            Self::StorageWrite | Self::Network | Self::HostAccess => PermissionTier::Dangerous,
        }
    }

    /// Name used in manifests and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Logger => "logger",
            Self::StorageRead => "storage-read",
            Self::ProjectRead => "project-read",
            Self::ProjectWrite => "project-write",
            Self::StorageWrite => "storage-write",
            Self::Network => "network",
            Self::HostAccess => "host-access",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| format!("unknown permission '{s}'"))
    }
}

/// How a permission is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionTier {
    AlwaysGranted,
    InstallTime,
    Dangerous,
}

/// Granted and explicitly revoked permissions of one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    granted: BTreeSet<Permission>,
    /// Permissions revoked by the host; stay revoked until explicitly granted.
    denied: BTreeSet<Permission>,
}

impl PermissionSet {
    /// Creates a set with only Tier 1 permissions.
    pub fn baseline() -> Self {
        Self::from_granted(
            Permission::ALL
                .into_iter()
                .filter(|p| p.tier() == PermissionTier::AlwaysGranted),
        )
    }

    pub fn from_granted(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            granted: permissions.into_iter().collect(),
            denied: BTreeSet::new(),
        }
    }

    /// Every known permission granted.
    pub fn all_granted() -> Self {
        Self::from_granted(Permission::ALL)
    }

    pub fn is_granted(&self, permission: Permission) -> bool {
        self.granted.contains(&permission)
    }

    pub fn is_denied(&self, permission: Permission) -> bool {
        self.denied.contains(&permission)
    }

    pub fn grant(&mut self, permission: Permission) {
        self.denied.remove(&permission);
        self.granted.insert(permission);
    }

    pub fn deny(&mut self, permission: Permission) {
        self.granted.remove(&permission);
        self.denied.insert(permission);
    }

    /// Currently granted permissions.
    pub fn granted_permissions(&self) -> &BTreeSet<Permission> {
        &self.granted
    }
}

/// Live grants for every installed plugin.
///
/// Execution contexts hold a shared reference and consult it on every
/// boundary call, so a revocation is visible to tasks already running.
#[derive(Debug, Default)]
pub struct GrantTable {
    plugins: RwLock<HashMap<String, PermissionSet>>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, plugin_id: &str, permissions: PermissionSet) {
        self.write().insert(plugin_id.to_string(), permissions);
    }

    pub fn remove(&self, plugin_id: &str) {
        self.write().remove(plugin_id);
    }

    pub fn is_granted(&self, plugin_id: &str, permission: Permission) -> bool {
        self.read()
            .get(plugin_id)
            .is_some_and(|set| set.is_granted(permission))
    }

    pub fn get(&self, plugin_id: &str) -> Option<PermissionSet> {
        self.read().get(plugin_id).cloned()
    }

    /// Grants a permission; returns false when the plugin has no entry.
    pub fn grant(&self, plugin_id: &str, permission: Permission) -> bool {
        match self.write().get_mut(plugin_id) {
            Some(set) => {
                set.grant(permission);
                true
            }
            None => false,
        }
    }

    /// Revokes a permission; returns false when the plugin has no entry.
    pub fn revoke(&self, plugin_id: &str, permission: Permission) -> bool {
        match self.write().get_mut(plugin_id) {
            Some(set) => {
                set.deny(permission);
                true
            }
            None => false,
        }
    }

    // A poisoned lock only means a writer panicked between two plain
    // inserts; the map itself is still consistent.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, PermissionSet>> {
        self.plugins.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, PermissionSet>> {
        self.plugins.write().unwrap_or_else(|e| e.into_inner())
    }
}
