//! Plugin installer and rollback manager.
//!
//! Validates bundles, commits plugin records, and keeps a single-slot
//! `PluginBackup` per plugin so a failed or unwanted update can be undone.
//! All operations on one plugin are serialized through a per-plugin async
//! lock; different plugins proceed concurrently.

use crate::config::PluginManagerConfig;
use crate::error::{InstallationError, PluginError, PluginResult, RollbackError};
use crate::permissions::{GrantTable, Permission, PermissionSet};
use crate::plugin::{InstallSource, Plugin};
use crate::sandbox::{SandboxAllocator, SandboxLimits};
use crate::scheduler::SchedulerHandle;
use crate::store::{PluginStore, StorageSnapshot};
use crate::telemetry::{LifecycleEvent, TelemetrySink};
use chrono::{DateTime, Utc};
use plugvisor_bundle::{PluginBundle, Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

/// Snapshot taken before a destructive operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginBackup {
    pub timestamp: DateTime<Utc>,
    pub plugin: Plugin,
    pub storage: StorageSnapshot,
    /// SHA-256 over the serialized record and storage.
    pub digest: String,
}

impl PluginBackup {
    pub fn new(plugin: Plugin, storage: StorageSnapshot) -> Self {
        let digest = Self::compute_digest(&plugin, &storage);
        Self {
            timestamp: Utc::now(),
            plugin,
            storage,
            digest,
        }
    }

    pub fn compute_digest(plugin: &Plugin, storage: &StorageSnapshot) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(plugin).unwrap_or_default());
        hasher.update(serde_json::to_vec(storage).unwrap_or_default());
        hex::encode(hasher.finalize())
    }

    /// Checks the digest still matches the snapshot.
    pub fn verify(&self) -> Result<(), String> {
        let computed = Self::compute_digest(&self.plugin, &self.storage);
        if computed == self.digest {
            Ok(())
        } else {
            Err(format!(
                "digest mismatch: recorded {}, computed {computed}",
                self.digest
            ))
        }
    }
}

/// Checks a detached signature. Returns false for any malformed input.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub source: InstallSource,
    /// Require a valid signature from a trusted key. Turning this off only
    /// works when the manager allows unsigned plugins.
    pub verify: bool,
    /// Permissions to grant. `None` grants everything the manifest declares.
    pub permissions: Option<Vec<Permission>>,
    /// Checksum the caller expects, e.g. from a registry listing.
    pub expected_checksum: Option<String>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            source: InstallSource::Inline,
            verify: true,
            permissions: None,
            expected_checksum: None,
        }
    }
}

impl InstallOptions {
    pub fn unsigned() -> Self {
        Self {
            verify: false,
            ..Default::default()
        }
    }
}

pub struct Installer {
    config: Arc<PluginManagerConfig>,
    store: Arc<dyn PluginStore>,
    grants: Arc<GrantTable>,
    telemetry: Arc<TelemetrySink>,
    verifier: Arc<dyn SignatureVerifier>,
    trusted_keys: Vec<[u8; 32]>,
    plugins: RwLock<HashMap<String, Arc<Plugin>>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    scheduler: Option<SchedulerHandle>,
    allocator: Option<Arc<SandboxAllocator>>,
}

impl Installer {
    /// Loads installed records from the store and seeds the grant table.
    pub fn load(
        config: Arc<PluginManagerConfig>,
        store: Arc<dyn PluginStore>,
        grants: Arc<GrantTable>,
        telemetry: Arc<TelemetrySink>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> PluginResult<Self> {
        let trusted_keys = config
            .trusted_verifying_keys()?
            .iter()
            .map(VerifyingKey::to_bytes)
            .collect();

        let mut plugins = HashMap::new();
        for plugin in store.list_plugins()? {
            grants.set(&plugin.id, plugin.granted.clone());
            plugins.insert(plugin.id.clone(), Arc::new(plugin));
        }
        if !plugins.is_empty() {
            info!(count = plugins.len(), "Loaded installed plugins");
        }

        Ok(Self {
            config,
            store,
            grants,
            telemetry,
            verifier,
            trusted_keys,
            plugins: RwLock::new(plugins),
            locks: Mutex::new(HashMap::new()),
            scheduler: None,
            allocator: None,
        })
    }

    /// Lets uninstall cancel running tasks and tear down live sandboxes.
    pub fn attach(mut self, scheduler: SchedulerHandle, allocator: Arc<SandboxAllocator>) -> Self {
        self.scheduler = Some(scheduler);
        self.allocator = Some(allocator);
        self
    }

    pub fn plugin(&self, plugin_id: &str) -> Option<Arc<Plugin>> {
        self.read_cache().get(plugin_id).cloned()
    }

    pub fn plugins(&self) -> Vec<Arc<Plugin>> {
        let mut plugins: Vec<_> = self.read_cache().values().cloned().collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        plugins
    }

    pub fn has_backup(&self, plugin_id: &str) -> PluginResult<bool> {
        Ok(self.store.get_backup(plugin_id)?.is_some())
    }

    // ================================================================
    // Install / Update
    // ================================================================

    pub async fn install(
        &self,
        bundle: &PluginBundle,
        options: InstallOptions,
    ) -> PluginResult<Arc<Plugin>> {
        let plugin_id = bundle.manifest.id.clone();
        let lock = self.lock_for(&plugin_id);
        let _guard = lock.lock().await;

        if self.store.get_plugin(&plugin_id)?.is_some() {
            return Err(InstallationError::AlreadyInstalled(plugin_id).into());
        }
        let plugin = self.validate(bundle, &options, 1).inspect_err(|e| {
            warn!(plugin_id = %plugin_id, check = ?e.check(), error = %e, "Install rejected");
        })?;

        self.store.put_plugin(&plugin)?;
        let plugin = self.commit(plugin);
        info!(
            plugin_id = %plugin.id,
            version = plugin.version,
            trusted = plugin.trusted,
            "Plugin installed"
        );
        self.telemetry.record_lifecycle(
            &plugin.id,
            LifecycleEvent::Installed,
            Some(plugin.version),
            Some(plugin.manifest.version.clone()),
        );
        Ok(plugin)
    }

    pub async fn update(
        &self,
        plugin_id: &str,
        bundle: &PluginBundle,
        options: InstallOptions,
    ) -> PluginResult<Arc<Plugin>> {
        let lock = self.lock_for(plugin_id);
        let _guard = lock.lock().await;

        let current = self
            .store
            .get_plugin(plugin_id)?
            .ok_or_else(|| PluginError::PluginNotFound(plugin_id.to_string()))?;
        if bundle.manifest.id != plugin_id {
            return Err(InstallationError::Manifest(format!(
                "bundle id '{}' does not match plugin '{plugin_id}'",
                bundle.manifest.id
            ))
            .into());
        }
        let plugin = self
            .validate(bundle, &options, current.next_version())
            .inspect_err(|e| {
                warn!(plugin_id = %plugin_id, check = ?e.check(), error = %e, "Update rejected");
            })?;

        let backup = PluginBackup::new(current, self.store.storage_snapshot(plugin_id)?);
        self.store.put_backup(&backup)?;

        if let Err(e) = self.store.put_plugin(&plugin) {
            warn!(plugin_id = %plugin_id, error = %e, "Update write failed, restoring backup");
            return Err(self.restore_after_failure(plugin_id, e.into()));
        }

        let plugin = self.commit(plugin);
        info!(
            plugin_id = %plugin.id,
            version = plugin.version,
            manifest_version = %plugin.manifest.version,
            "Plugin updated"
        );
        self.telemetry.record_lifecycle(
            &plugin.id,
            LifecycleEvent::Updated,
            Some(plugin.version),
            Some(plugin.manifest.version.clone()),
        );
        Ok(plugin)
    }

    /// Runs every installation check without touching the store.
    fn validate(
        &self,
        bundle: &PluginBundle,
        options: &InstallOptions,
        version: u64,
    ) -> Result<Plugin, InstallationError> {
        let manifest = &bundle.manifest;
        manifest.validate()?;
        semver::Version::parse(&manifest.version).map_err(|e| {
            InstallationError::Manifest(format!("version '{}' is not semver: {e}", manifest.version))
        })?;
        if bundle.code.is_empty() {
            return Err(InstallationError::Manifest("bundle has no code".into()));
        }
        let mut declared: BTreeSet<Permission> = manifest
            .permissions
            .iter()
            .map(|name| name.parse::<Permission>())
            .collect::<Result<_, _>>()
            .map_err(InstallationError::Manifest)?;
        declared.extend(PermissionSet::baseline().granted_permissions());

        let content_hash = bundle.verify_integrity()?;
        if let Some(expected) = &options.expected_checksum {
            if !expected.eq_ignore_ascii_case(&content_hash) {
                return Err(InstallationError::Integrity(format!(
                    "expected checksum {expected}, bundle hashes to {content_hash}"
                )));
            }
        }

        let trusted = self.check_signature(bundle, options)?;

        if let Some(required) = &manifest.engines {
            let requirement = semver::VersionReq::parse(required).map_err(|e| {
                InstallationError::Version {
                    required: required.clone(),
                    engine: format!("(unparseable requirement: {e})"),
                }
            })?;
            let engine = self.config.engine().map_err(|e| InstallationError::Version {
                required: required.clone(),
                engine: e.to_string(),
            })?;
            if !requirement.matches(&engine) {
                return Err(InstallationError::Version {
                    required: required.clone(),
                    engine: engine.to_string(),
                });
            }
        }

        let requested = options
            .permissions
            .clone()
            .unwrap_or_else(|| declared.iter().copied().collect());
        if let Some(missing) = requested.iter().find(|p| !declared.contains(p)) {
            return Err(InstallationError::PermissionNotDeclared {
                plugin_id: manifest.id.clone(),
                permission: missing.to_string(),
            });
        }
        let mut granted = PermissionSet::baseline();
        for permission in requested {
            granted.grant(permission);
        }

        SandboxLimits::resolve(&manifest.id, &manifest.limits, &self.config)
            .map_err(|e| InstallationError::Limits(e.to_string()))?;

        Ok(Plugin {
            id: manifest.id.clone(),
            version,
            highest_version: version,
            manifest: manifest.clone(),
            permissions: declared,
            granted,
            content_hash,
            signature: bundle.signature.as_ref().map(hex::encode),
            trusted,
            source: options.source.clone(),
            installed_at: Utc::now(),
            code: bundle.code.clone(),
        })
    }

    /// Returns whether the plugin is trusted.
    fn check_signature(
        &self,
        bundle: &PluginBundle,
        options: &InstallOptions,
    ) -> Result<bool, InstallationError> {
        if !options.verify {
            if self.config.allow_unsigned_plugins {
                return Ok(false);
            }
            return Err(InstallationError::Signature(
                "unsigned installs are disabled (allow_unsigned_plugins = false)".into(),
            ));
        }
        let Some(signature) = &bundle.signature else {
            return Err(InstallationError::Signature("bundle is not signed".into()));
        };
        if self.trusted_keys.is_empty() {
            return Err(InstallationError::Signature(
                "no trusted keys are configured".into(),
            ));
        }
        let message = bundle.signed_message();
        if self
            .trusted_keys
            .iter()
            .any(|key| self.verifier.verify(&message, signature, key))
        {
            Ok(true)
        } else {
            Err(InstallationError::Signature(
                "signature does not match any trusted key".into(),
            ))
        }
    }

    // ================================================================
    // Rollback
    // ================================================================

    /// Restores the most recent backup, consuming it.
    pub async fn rollback(&self, plugin_id: &str) -> PluginResult<Arc<Plugin>> {
        let lock = self.lock_for(plugin_id);
        let _guard = lock.lock().await;

        let plugin = self.restore_from_backup(plugin_id)?;
        info!(plugin_id = %plugin_id, version = plugin.version, "Plugin rolled back");
        self.telemetry.record_lifecycle(
            plugin_id,
            LifecycleEvent::RolledBack,
            Some(plugin.version),
            Some(plugin.manifest.version.clone()),
        );
        Ok(plugin)
    }

    fn restore_after_failure(&self, plugin_id: &str, original: PluginError) -> PluginError {
        match self.restore_from_backup(plugin_id) {
            Ok(restored) => {
                self.telemetry.record_lifecycle(
                    plugin_id,
                    LifecycleEvent::UpdateRestored,
                    Some(restored.version),
                    Some(original.to_string()),
                );
                original
            }
            Err(e) => {
                warn!(plugin_id = %plugin_id, error = %e, "Restore after failed update failed");
                RollbackError::RestoreFailed {
                    plugin_id: plugin_id.to_string(),
                    reason: format!("{e} (while recovering from: {original})"),
                }
                .into()
            }
        }
    }

    fn restore_from_backup(&self, plugin_id: &str) -> PluginResult<Arc<Plugin>> {
        let backup = self
            .store
            .take_backup(plugin_id)
            .map_err(|e| RollbackError::Corrupt {
                plugin_id: plugin_id.to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| RollbackError::NoBackup(plugin_id.to_string()))?;
        backup.verify().map_err(|reason| RollbackError::Corrupt {
            plugin_id: plugin_id.to_string(),
            reason,
        })?;

        let restore_failed = |e: crate::error::StoreError| RollbackError::RestoreFailed {
            plugin_id: plugin_id.to_string(),
            reason: e.to_string(),
        };
        let mut plugin = backup.plugin;
        let high_water = self
            .store
            .get_plugin(plugin_id)
            .map_err(restore_failed)?
            .map_or(0, |current| current.version.max(current.highest_version));
        plugin.highest_version = plugin.highest_version.max(high_water);

        self.store.put_plugin(&plugin).map_err(restore_failed)?;
        self.store
            .storage_replace(plugin_id, backup.storage)
            .map_err(restore_failed)?;
        Ok(self.commit(plugin))
    }

    // ================================================================
    // Uninstall
    // ================================================================

    pub async fn uninstall(&self, plugin_id: &str) -> PluginResult<()> {
        let lock = self.lock_for(plugin_id);
        let _guard = lock.lock().await;

        let current = self
            .store
            .get_plugin(plugin_id)?
            .ok_or_else(|| PluginError::PluginNotFound(plugin_id.to_string()))?;

        // Unpublished before cancelling: later submits fail with
        // PluginNotFound, and a task admitted meanwhile holds no grants.
        self.write_cache().remove(plugin_id);
        self.grants.remove(plugin_id);

        if let Some(scheduler) = &self.scheduler {
            match scheduler.cancel_plugin(plugin_id).await {
                Ok(cancelled) if cancelled > 0 => {
                    info!(plugin_id = %plugin_id, cancelled, "Cancelled tasks before uninstall");
                }
                Ok(_) => {}
                Err(e) => warn!(plugin_id = %plugin_id, error = %e, "Could not cancel tasks"),
            }
        }
        if let Some(allocator) = &self.allocator {
            allocator.destroy_for_plugin(plugin_id);
        }

        let storage = match self.store.storage_snapshot(plugin_id) {
            Ok(storage) => storage,
            Err(e) => {
                self.commit(current);
                return Err(e.into());
            }
        };
        let backup = PluginBackup::new(current, storage);
        let removal = self
            .store
            .delete_plugin(plugin_id)
            .and_then(|()| self.store.delete_backup(plugin_id))
            .and_then(|()| self.store.storage_purge(plugin_id));
        if let Err(e) = removal {
            warn!(plugin_id = %plugin_id, error = %e, "Uninstall failed, restoring");
            let restored = self
                .store
                .put_plugin(&backup.plugin)
                .and_then(|()| self.store.storage_replace(plugin_id, backup.storage));
            return Err(match restored {
                Ok(()) => {
                    self.commit(backup.plugin);
                    e.into()
                }
                Err(restore) => RollbackError::RestoreFailed {
                    plugin_id: plugin_id.to_string(),
                    reason: format!("{restore} (while recovering from: {e})"),
                }
                .into(),
            });
        }

        if let Some(allocator) = &self.allocator {
            allocator.evict(plugin_id);
        }
        info!(plugin_id = %plugin_id, "Plugin uninstalled");
        self.telemetry
            .record_lifecycle(plugin_id, LifecycleEvent::Uninstalled, None, None);
        Ok(())
    }

    // ================================================================
    // Grants
    // ================================================================

    pub async fn grant_permission(
        &self,
        plugin_id: &str,
        permission: Permission,
    ) -> PluginResult<Arc<Plugin>> {
        let lock = self.lock_for(plugin_id);
        let _guard = lock.lock().await;

        let mut plugin = self
            .store
            .get_plugin(plugin_id)?
            .ok_or_else(|| PluginError::PluginNotFound(plugin_id.to_string()))?;
        if !plugin.permissions.contains(&permission) {
            return Err(InstallationError::PermissionNotDeclared {
                plugin_id: plugin_id.to_string(),
                permission: permission.to_string(),
            }
            .into());
        }
        plugin.granted.grant(permission);
        self.store.put_plugin(&plugin)?;
        let plugin = self.commit(plugin);
        info!(plugin_id = %plugin_id, permission = %permission, "Permission granted");
        self.telemetry.record_lifecycle(
            plugin_id,
            LifecycleEvent::PermissionGranted,
            Some(plugin.version),
            Some(permission.to_string()),
        );
        Ok(plugin)
    }

    /// Revokes a permission. Running tasks see it at their next boundary call.
    pub async fn revoke_permission(
        &self,
        plugin_id: &str,
        permission: Permission,
    ) -> PluginResult<Arc<Plugin>> {
        let lock = self.lock_for(plugin_id);
        let _guard = lock.lock().await;

        let mut plugin = self
            .store
            .get_plugin(plugin_id)?
            .ok_or_else(|| PluginError::PluginNotFound(plugin_id.to_string()))?;
        plugin.granted.deny(permission);
        self.store.put_plugin(&plugin)?;
        let plugin = self.commit(plugin);
        info!(plugin_id = %plugin_id, permission = %permission, "Permission revoked");
        self.telemetry.record_lifecycle(
            plugin_id,
            LifecycleEvent::PermissionRevoked,
            Some(plugin.version),
            Some(permission.to_string()),
        );
        Ok(plugin)
    }

    // ================================================================
    // Internals
    // ================================================================

    /// Publishes a persisted record to the cache and the live grant table.
    fn commit(&self, plugin: Plugin) -> Arc<Plugin> {
        self.grants.set(&plugin.id, plugin.granted.clone());
        let plugin = Arc::new(plugin);
        self.write_cache()
            .insert(plugin.id.clone(), Arc::clone(&plugin));
        plugin
    }

    fn lock_for(&self, plugin_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(plugin_id.to_string()).or_default())
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Plugin>>> {
        self.plugins.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Plugin>>> {
        self.plugins.write().unwrap_or_else(|e| e.into_inner())
    }
}
