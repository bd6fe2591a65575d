//! Persistence for plugin records, single-slot backups, and plugin-owned
//! key/value storage.
//!
//! `MemoryStore` keeps everything in process; `FileStore` lays it out as
//! JSON files under a root directory:
//!
//! ```text
//! <root>/plugins/<plugin-id>.json   installed record
//! <root>/backups/<plugin-id>.json   most recent backup (one slot)
//! <root>/storage/<plugin-id>.json   storage namespace as one JSON object
//! ```
//!
//! Files are written to `.tmp` first and then renamed into place.

use crate::error::StoreError;
use crate::installer::PluginBackup;
use crate::plugin::Plugin;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub type StoreResult<T> = Result<T, StoreError>;

/// A plugin's key/value namespace.
pub type StorageSnapshot = BTreeMap<String, Value>;

pub trait PluginStore: Send + Sync {
    fn get_plugin(&self, plugin_id: &str) -> StoreResult<Option<Plugin>>;
    fn put_plugin(&self, plugin: &Plugin) -> StoreResult<()>;
    fn delete_plugin(&self, plugin_id: &str) -> StoreResult<()>;
    fn list_plugins(&self) -> StoreResult<Vec<Plugin>>;

    fn get_backup(&self, plugin_id: &str) -> StoreResult<Option<PluginBackup>>;
    /// Overwrites the plugin's backup slot.
    fn put_backup(&self, backup: &PluginBackup) -> StoreResult<()>;
    /// Removes and returns the backup, so it can be consumed only once.
    fn take_backup(&self, plugin_id: &str) -> StoreResult<Option<PluginBackup>>;
    fn delete_backup(&self, plugin_id: &str) -> StoreResult<()>;

    fn storage_get(&self, plugin_id: &str, key: &str) -> StoreResult<Option<Value>>;
    fn storage_set(&self, plugin_id: &str, key: &str, value: Value) -> StoreResult<()>;
    /// Writes `key` only if `admit` accepts the namespace size the write
    /// would produce. `admit` runs under the namespace's write lock; returns
    /// whether the value was written.
    fn storage_set_if(
        &self,
        plugin_id: &str,
        key: &str,
        value: Value,
        admit: &mut dyn FnMut(u64) -> bool,
    ) -> StoreResult<bool>;
    /// Returns whether the key existed.
    fn storage_delete(&self, plugin_id: &str, key: &str) -> StoreResult<bool>;
    fn storage_snapshot(&self, plugin_id: &str) -> StoreResult<StorageSnapshot>;
    fn storage_replace(&self, plugin_id: &str, snapshot: StorageSnapshot) -> StoreResult<()>;
    fn storage_purge(&self, plugin_id: &str) -> StoreResult<()>;

    /// Bytes used by the namespace, as counted against the storage quota.
    fn storage_usage(&self, plugin_id: &str) -> StoreResult<u64> {
        Ok(namespace_size(&self.storage_snapshot(plugin_id)?))
    }
}

/// Quota cost of one entry: key bytes plus serialized value bytes.
pub fn entry_size(key: &str, value: &Value) -> u64 {
    let value_len = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0);
    (key.len() + value_len) as u64
}

pub fn namespace_size(snapshot: &StorageSnapshot) -> u64 {
    snapshot.iter().map(|(k, v)| entry_size(k, v)).sum()
}

/// Namespace size after `key` is set to `value`; a replaced entry counts once.
pub fn projected_size(snapshot: &StorageSnapshot, key: &str, value: &Value) -> u64 {
    let replaced = snapshot.get(key).map(|old| entry_size(key, old)).unwrap_or(0);
    namespace_size(snapshot).saturating_sub(replaced) + entry_size(key, value)
}

// ================================================================
// In-memory store
// ================================================================

#[derive(Default)]
struct MemoryState {
    plugins: HashMap<String, Plugin>,
    backups: HashMap<String, PluginBackup>,
    storage: HashMap<String, StorageSnapshot>,
}

/// Process-local store, used by tests and embedders without persistence.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl PluginStore for MemoryStore {
    fn get_plugin(&self, plugin_id: &str) -> StoreResult<Option<Plugin>> {
        Ok(self.read().plugins.get(plugin_id).cloned())
    }

    fn put_plugin(&self, plugin: &Plugin) -> StoreResult<()> {
        self.write()
            .plugins
            .insert(plugin.id.clone(), plugin.clone());
        Ok(())
    }

    fn delete_plugin(&self, plugin_id: &str) -> StoreResult<()> {
        self.write().plugins.remove(plugin_id);
        Ok(())
    }

    fn list_plugins(&self) -> StoreResult<Vec<Plugin>> {
        let mut plugins: Vec<Plugin> = self.read().plugins.values().cloned().collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(plugins)
    }

    fn get_backup(&self, plugin_id: &str) -> StoreResult<Option<PluginBackup>> {
        Ok(self.read().backups.get(plugin_id).cloned())
    }

    fn put_backup(&self, backup: &PluginBackup) -> StoreResult<()> {
        self.write()
            .backups
            .insert(backup.plugin.id.clone(), backup.clone());
        Ok(())
    }

    fn take_backup(&self, plugin_id: &str) -> StoreResult<Option<PluginBackup>> {
        Ok(self.write().backups.remove(plugin_id))
    }

    fn delete_backup(&self, plugin_id: &str) -> StoreResult<()> {
        self.write().backups.remove(plugin_id);
        Ok(())
    }

    fn storage_get(&self, plugin_id: &str, key: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .read()
            .storage
            .get(plugin_id)
            .and_then(|ns| ns.get(key).cloned()))
    }

    fn storage_set(&self, plugin_id: &str, key: &str, value: Value) -> StoreResult<()> {
        self.write()
            .storage
            .entry(plugin_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn storage_set_if(
        &self,
        plugin_id: &str,
        key: &str,
        value: Value,
        admit: &mut dyn FnMut(u64) -> bool,
    ) -> StoreResult<bool> {
        let mut state = self.write();
        let projected = match state.storage.get(plugin_id) {
            Some(ns) => projected_size(ns, key, &value),
            None => entry_size(key, &value),
        };
        if !admit(projected) {
            return Ok(false);
        }
        state
            .storage
            .entry(plugin_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(true)
    }

    fn storage_delete(&self, plugin_id: &str, key: &str) -> StoreResult<bool> {
        Ok(self
            .write()
            .storage
            .get_mut(plugin_id)
            .is_some_and(|ns| ns.remove(key).is_some()))
    }

    fn storage_snapshot(&self, plugin_id: &str) -> StoreResult<StorageSnapshot> {
        Ok(self
            .read()
            .storage
            .get(plugin_id)
            .cloned()
            .unwrap_or_default())
    }

    fn storage_replace(&self, plugin_id: &str, snapshot: StorageSnapshot) -> StoreResult<()> {
        let mut state = self.write();
        if snapshot.is_empty() {
            state.storage.remove(plugin_id);
        } else {
            state.storage.insert(plugin_id.to_string(), snapshot);
        }
        Ok(())
    }

    fn storage_purge(&self, plugin_id: &str) -> StoreResult<()> {
        self.write().storage.remove(plugin_id);
        Ok(())
    }
}

// ================================================================
// Filesystem store
// ================================================================

/// JSON-file store rooted at a directory.
pub struct FileStore {
    root: PathBuf,
    /// Serializes read-modify-write of storage namespaces.
    storage_lock: RwLock<()>,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for dir in ["plugins", "backups", "storage"] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(Self {
            root,
            storage_lock: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, area: &str, plugin_id: &str) -> PathBuf {
        self.root.join(area).join(format!("{plugin_id}.json"))
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> StoreResult<Option<T>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                what: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupt {
            what: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, bytes).map_err(|e| StoreError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, path).map_err(|e| StoreError::io(path, e))
    }

    fn remove(&self, path: &Path) -> StoreResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn namespace(&self, plugin_id: &str) -> StoreResult<StorageSnapshot> {
        Ok(self
            .read_json(&self.path("storage", plugin_id))?
            .unwrap_or_default())
    }

    fn modify_namespace<R>(
        &self,
        plugin_id: &str,
        f: impl FnOnce(&mut StorageSnapshot) -> R,
    ) -> StoreResult<R> {
        let _guard = self.storage_lock.write().unwrap_or_else(|e| e.into_inner());
        let mut ns = self.namespace(plugin_id)?;
        let out = f(&mut ns);
        self.write_json(&self.path("storage", plugin_id), &ns)?;
        Ok(out)
    }
}

impl PluginStore for FileStore {
    fn get_plugin(&self, plugin_id: &str) -> StoreResult<Option<Plugin>> {
        self.read_json(&self.path("plugins", plugin_id))
    }

    fn put_plugin(&self, plugin: &Plugin) -> StoreResult<()> {
        self.write_json(&self.path("plugins", &plugin.id), plugin)
    }

    fn delete_plugin(&self, plugin_id: &str) -> StoreResult<()> {
        self.remove(&self.path("plugins", plugin_id))
    }

    fn list_plugins(&self) -> StoreResult<Vec<Plugin>> {
        let dir = self.root.join("plugins");
        let entries = std::fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let mut plugins = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&dir, e))?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(plugin) = self.read_json::<Plugin>(&path)? {
                    plugins.push(plugin);
                }
            }
        }
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(plugins)
    }

    fn get_backup(&self, plugin_id: &str) -> StoreResult<Option<PluginBackup>> {
        self.read_json(&self.path("backups", plugin_id))
    }

    fn put_backup(&self, backup: &PluginBackup) -> StoreResult<()> {
        self.write_json(&self.path("backups", &backup.plugin.id), backup)
    }

    fn take_backup(&self, plugin_id: &str) -> StoreResult<Option<PluginBackup>> {
        let path = self.path("backups", plugin_id);
        let backup = self.read_json(&path)?;
        if backup.is_some() {
            self.remove(&path)?;
        }
        Ok(backup)
    }

    fn delete_backup(&self, plugin_id: &str) -> StoreResult<()> {
        self.remove(&self.path("backups", plugin_id))
    }

    fn storage_get(&self, plugin_id: &str, key: &str) -> StoreResult<Option<Value>> {
        let _guard = self.storage_lock.read().unwrap_or_else(|e| e.into_inner());
        Ok(self.namespace(plugin_id)?.remove(key))
    }

    fn storage_set(&self, plugin_id: &str, key: &str, value: Value) -> StoreResult<()> {
        self.modify_namespace(plugin_id, |ns| {
            ns.insert(key.to_string(), value);
        })
    }

    fn storage_set_if(
        &self,
        plugin_id: &str,
        key: &str,
        value: Value,
        admit: &mut dyn FnMut(u64) -> bool,
    ) -> StoreResult<bool> {
        let _guard = self.storage_lock.write().unwrap_or_else(|e| e.into_inner());
        let mut ns = self.namespace(plugin_id)?;
        if !admit(projected_size(&ns, key, &value)) {
            return Ok(false);
        }
        ns.insert(key.to_string(), value);
        self.write_json(&self.path("storage", plugin_id), &ns)?;
        Ok(true)
    }

    fn storage_delete(&self, plugin_id: &str, key: &str) -> StoreResult<bool> {
        self.modify_namespace(plugin_id, |ns| ns.remove(key).is_some())
    }

    fn storage_snapshot(&self, plugin_id: &str) -> StoreResult<StorageSnapshot> {
        let _guard = self.storage_lock.read().unwrap_or_else(|e| e.into_inner());
        self.namespace(plugin_id)
    }

    fn storage_replace(&self, plugin_id: &str, snapshot: StorageSnapshot) -> StoreResult<()> {
        let _guard = self.storage_lock.write().unwrap_or_else(|e| e.into_inner());
        let path = self.path("storage", plugin_id);
        if snapshot.is_empty() {
            self.remove(&path)
        } else {
            self.write_json(&path, &snapshot)
        }
    }

    fn storage_purge(&self, plugin_id: &str) -> StoreResult<()> {
        let _guard = self.storage_lock.write().unwrap_or_else(|e| e.into_inner());
        self.remove(&self.path("storage", plugin_id))
    }
}
