//! Manager configuration, read once from `plugvisor.toml` at startup.
//!
//! Every field has a default so a partial file is valid. The parsed config is
//! shared as `Arc<PluginManagerConfig>` and never mutated afterwards.

use crate::error::{PluginError, PluginResult};
use plugvisor_bundle::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Telemetry settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Append-only JSON-lines journal. In-memory only when unset.
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginManagerConfig {
    /// Host engine version checked against each manifest's `engines` requirement.
    pub engine_version: String,
    pub default_timeout_ms: u64,
    pub max_concurrent_executions: usize,
    /// Tasks waiting beyond this many are rejected with `SchedulerBusy`.
    pub max_queued_executions: usize,
    /// Ceiling for per-sandbox memory; manifests may only lower it.
    pub sandbox_memory_limit: u64,
    pub default_storage_quota: u64,
    pub default_fuel_per_call: u64,
    /// How long a running task may ignore a cancel request before it is killed.
    pub cancel_grace_ms: u64,
    pub allow_unsigned_plugins: bool,
    /// Hex-encoded Ed25519 public keys accepted for bundle signatures.
    pub trusted_keys: Vec<String>,
    pub telemetry: TelemetryConfig,
}

impl Default for PluginManagerConfig {
    fn default() -> Self {
        Self {
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            default_timeout_ms: 5_000,
            max_concurrent_executions: 4,
            max_queued_executions: 64,
            sandbox_memory_limit: 64 * 1024 * 1024, // 64MB
            default_storage_quota: 1024 * 1024,     // 1MB
            default_fuel_per_call: 500_000_000,
            cancel_grace_ms: 250,
            allow_unsigned_plugins: false,
            trusted_keys: Vec::new(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl PluginManagerConfig {
    /// Loads config from an explicit path.
    ///
    /// A missing file yields the defaults; an unreadable or invalid one is an error.
    pub fn load_from(path: impl AsRef<Path>) -> PluginResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config file found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| PluginError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml(&contents)?;
        info!("Loaded manager config from {:?}", path);
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(contents: &str) -> PluginResult<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| PluginError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PluginResult<()> {
        self.engine()?;
        if self.max_concurrent_executions == 0 {
            return Err(PluginError::Config(
                "max_concurrent_executions must be at least 1".into(),
            ));
        }
        if self.default_timeout_ms == 0 {
            return Err(PluginError::Config("default_timeout_ms must be positive".into()));
        }
        if self.sandbox_memory_limit == 0 {
            return Err(PluginError::Config("sandbox_memory_limit must be positive".into()));
        }
        self.trusted_verifying_keys()?;
        Ok(())
    }

    /// The engine version as semver.
    pub fn engine(&self) -> PluginResult<semver::Version> {
        semver::Version::parse(&self.engine_version).map_err(|e| {
            PluginError::Config(format!("engine_version '{}': {e}", self.engine_version))
        })
    }

    pub fn trusted_verifying_keys(&self) -> PluginResult<Vec<VerifyingKey>> {
        self.trusted_keys
            .iter()
            .map(|hex| {
                VerifyingKey::from_hex(hex)
                    .map_err(|e| PluginError::Config(format!("trusted key '{hex}': {e}")))
            })
            .collect()
    }
}
