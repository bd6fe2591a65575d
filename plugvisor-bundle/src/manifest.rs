//! Plugin manifest (manifest.toml) within a bundle.

use serde::{Deserialize, Serialize};

use crate::BundleError;

/// Top-level plugin manifest embedded in every bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier in reverse-domain form (e.g., "acme.fillet-tools").
    pub id: String,
    /// Human-readable plugin name.
    pub name: String,
    /// Short description.
    #[serde(default)]
    pub description: String,
    /// Semver version string of the plugin itself.
    pub version: String,
    /// Author or organization.
    #[serde(default)]
    pub author: String,
    /// Semver requirement on the host engine (e.g., ">=1.2, <2").
    /// Absent means "any engine".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engines: Option<String>,
    /// Permissions the plugin may ever request (kebab-case names).
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Functions callable by the host. Empty means "not declared".
    #[serde(default)]
    pub exports: Vec<String>,
    /// Per-plugin sandbox limit overrides.
    #[serde(default)]
    pub limits: ManifestLimits,
}

/// Sandbox limit overrides requested by a plugin.
///
/// The host clamps nothing: a request above its ceiling is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_quota_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel_per_call: Option<u64>,
    /// Hosts the plugin may reach over the network.
    #[serde(default)]
    pub network_allowlist: Vec<String>,
}

impl PluginManifest {
    /// Creates a manifest with the required fields and everything else empty.
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: version.into(),
            author: String::new(),
            engines: None,
            permissions: Vec::new(),
            exports: Vec::new(),
            limits: ManifestLimits::default(),
        }
    }

    /// Validates the manifest for required fields and constraints.
    pub fn validate(&self) -> Result<(), BundleError> {
        if self.id.is_empty() {
            return Err(BundleError::ManifestInvalid("id is required".into()));
        }
        if self.name.trim().is_empty() {
            return Err(BundleError::ManifestInvalid("name is required".into()));
        }
        if self.version.is_empty() {
            return Err(BundleError::ManifestInvalid("version is required".into()));
        }
        // Plugin IDs double as storage namespaces and file names.
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'))
        {
            return Err(BundleError::ManifestInvalid(format!(
                "id '{}' may only contain [a-z0-9._-]",
                self.id
            )));
        }
        if !self.id.contains('.') || self.id.starts_with('.') || self.id.ends_with('.') {
            return Err(BundleError::ManifestInvalid(
                "id must use reverse-domain format (e.g., 'acme.fillet-tools')".into(),
            ));
        }
        if let Some(name) = self.exports.iter().find(|e| e.is_empty()) {
            return Err(BundleError::ManifestInvalid(format!(
                "export name '{name}' is empty"
            )));
        }
        Ok(())
    }

    /// Returns true when `function` may be invoked by the host.
    pub fn exports_function(&self, function: &str) -> bool {
        self.exports.is_empty() || self.exports.iter().any(|e| e == function)
    }
}
