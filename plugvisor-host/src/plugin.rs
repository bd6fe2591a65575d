//! Installed plugin records.

use crate::permissions::{Permission, PermissionSet};
use chrono::{DateTime, Utc};
use plugvisor_bundle::PluginManifest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Where a bundle came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstallSource {
    File { path: PathBuf },
    Registry { url: String },
    #[default]
    Inline,
}

/// The persisted record of an installed plugin.
///
/// Shared as `Arc<Plugin>` with the scheduler; only the installer writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plugin {
    /// Stable identity, taken from the manifest.
    pub id: String,
    /// Incremented by every successful update; a rollback restores the old value.
    pub version: u64,
    /// Highest `version` ever assigned. Survives rollback, so an update
    /// after a rollback never reuses a revision number.
    #[serde(default)]
    pub highest_version: u64,
    pub manifest: PluginManifest,
    /// Maximal permission set the plugin declared.
    pub permissions: BTreeSet<Permission>,
    /// Permissions actually granted; always a subset of `permissions`.
    pub granted: PermissionSet,
    /// SHA-256 of the bundle contents.
    pub content_hash: String,
    /// Hex signature over the content hash, if the bundle was signed.
    #[serde(default)]
    pub signature: Option<String>,
    /// Set only after signature verification succeeded.
    pub trusted: bool,
    pub source: InstallSource,
    pub installed_at: DateTime<Utc>,
    #[serde(with = "code_base64")]
    pub code: Vec<u8>,
}

impl Plugin {
    pub fn exports_function(&self, function: &str) -> bool {
        self.manifest.exports_function(function)
    }

    /// Revision the next successful update receives.
    pub fn next_version(&self) -> u64 {
        self.version.max(self.highest_version) + 1
    }
}

/// Snapshot of a plugin as reported by `get_plugin_status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PluginStatus {
    pub plugin_id: String,
    pub installed: bool,
    /// True while any task of the plugin is queued or running.
    pub active: bool,
    pub version: Option<u64>,
    pub manifest_version: Option<String>,
    pub trusted: bool,
    pub running_tasks: usize,
    pub queued_tasks: usize,
    /// Set when the latest execution since the last install crashed its sandbox.
    pub degraded: bool,
    pub error: Option<String>,
}

mod code_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
