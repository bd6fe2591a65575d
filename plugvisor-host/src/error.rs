//! Error types for the plugin execution manager.

use plugvisor_bundle::BundleError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::TaskId;

/// Result type for manager operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Stable classification of every error the manager reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Installation,
    PermissionDenied,
    ResourceLimitExceeded,
    Timeout,
    Cancelled,
    SandboxCrash,
    Execution,
    Rollback,
    SchedulerBusy,
    NotFound,
    Capability,
    Network,
    Host,
    Store,
    Config,
    Internal,
}

#[derive(Debug, Clone, Error)]
pub enum PluginError {
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("installation failed: {0}")]
    Installation(#[from] InstallationError),

    #[error("permission denied: plugin '{plugin_id}' may not perform {action}")]
    PermissionDenied { plugin_id: String, action: String },

    #[error("resource limit exceeded: {plugin_id}: {detail}")]
    ResourceLimitExceeded { plugin_id: String, detail: String },

    #[error("timeout: plugin '{plugin_id}' exceeded {timeout_ms}ms deadline (task {task_id})")]
    Timeout {
        plugin_id: String,
        task_id: TaskId,
        timeout_ms: u64,
    },

    #[error("cancelled: task {task_id} of plugin '{plugin_id}'")]
    Cancelled { plugin_id: String, task_id: TaskId },

    #[error("sandbox crashed: {plugin_id}: {message}")]
    SandboxCrash { plugin_id: String, message: String },

    #[error("plugin '{plugin_id}' failed: {message}")]
    Execution { plugin_id: String, message: String },

    #[error("rollback failed: {0}")]
    Rollback(#[from] RollbackError),

    #[error("scheduler busy: {queued} executions already queued")]
    SchedulerBusy { queued: usize },

    #[error("scheduler is not running")]
    SchedulerStopped,

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("function '{function}' is not exported by plugin '{plugin_id}'")]
    FunctionNotExported { plugin_id: String, function: String },

    #[error("capability '{0}' is not registered")]
    CapabilityNotFound(String),

    #[error("capability '{0}' is already registered")]
    CapabilityExists(String),

    #[error("capability '{capability}' cannot serve a {request} request")]
    CapabilityMismatch { capability: String, request: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("host call failed: {0}")]
    Host(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("telemetry already recorded for task {0}")]
    DuplicateRecord(TaskId),
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PluginNotFound(_) | Self::TaskNotFound(_) | Self::FunctionNotExported { .. } => {
                ErrorKind::NotFound
            }
            Self::Installation(_) => ErrorKind::Installation,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::ResourceLimitExceeded { .. } => ErrorKind::ResourceLimitExceeded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::SandboxCrash { .. } => ErrorKind::SandboxCrash,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::Rollback(_) => ErrorKind::Rollback,
            Self::SchedulerBusy { .. } => ErrorKind::SchedulerBusy,
            Self::CapabilityNotFound(_)
            | Self::CapabilityExists(_)
            | Self::CapabilityMismatch { .. } => ErrorKind::Capability,
            Self::Network(_) => ErrorKind::Network,
            Self::Host(_) => ErrorKind::Host,
            Self::Store(_) => ErrorKind::Store,
            Self::Config(_) => ErrorKind::Config,
            Self::SchedulerStopped | Self::Serialization(_) | Self::DuplicateRecord(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Boundary denials are attributed to the action that triggered them and
    /// win over whatever generic error the plugin reports afterwards.
    pub fn is_boundary_violation(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::ResourceLimitExceeded { .. }
        )
    }
}

/// The installation check that rejected a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallCheck {
    Signature,
    Version,
    Integrity,
    Manifest,
    Permissions,
    Limits,
    Conflict,
}

#[derive(Debug, Clone, Error)]
pub enum InstallationError {
    #[error("signature check failed: {0}")]
    Signature(String),

    #[error("version check failed: plugin requires engine '{required}', host engine is {engine}")]
    Version { required: String, engine: String },

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("manifest check failed: {0}")]
    Manifest(String),

    #[error("permission check failed: '{permission}' is not declared by plugin '{plugin_id}'")]
    PermissionNotDeclared { plugin_id: String, permission: String },

    #[error("limit check failed: {0}")]
    Limits(String),

    #[error("plugin '{0}' is already installed")]
    AlreadyInstalled(String),
}

impl InstallationError {
    pub fn check(&self) -> InstallCheck {
        match self {
            Self::Signature(_) => InstallCheck::Signature,
            Self::Version { .. } => InstallCheck::Version,
            Self::Integrity(_) => InstallCheck::Integrity,
            Self::Manifest(_) => InstallCheck::Manifest,
            Self::PermissionNotDeclared { .. } => InstallCheck::Permissions,
            Self::Limits(_) => InstallCheck::Limits,
            Self::AlreadyInstalled(_) => InstallCheck::Conflict,
        }
    }
}

impl From<BundleError> for InstallationError {
    fn from(e: BundleError) -> Self {
        match e {
            BundleError::ChecksumMissing | BundleError::ChecksumMismatch { .. } => {
                Self::Integrity(e.to_string())
            }
            BundleError::SignatureInvalid
            | BundleError::NotSigned
            | BundleError::InvalidPublicKey
            | BundleError::InvalidKeyEncoding(_) => Self::Signature(e.to_string()),
            // A bundle that cannot be parsed fails the integrity check.
            BundleError::Io(_)
            | BundleError::Zip(_)
            | BundleError::MissingEntry(_)
            | BundleError::UnexpectedEntry(_) => Self::Integrity(e.to_string()),
            BundleError::TomlSerialize(_)
            | BundleError::TomlDeserialize(_)
            | BundleError::Json(_)
            | BundleError::ManifestInvalid(_) => Self::Manifest(e.to_string()),
        }
    }
}

impl From<BundleError> for PluginError {
    fn from(e: BundleError) -> Self {
        Self::Installation(e.into())
    }
}

#[derive(Debug, Clone, Error)]
pub enum RollbackError {
    #[error("no backup available for plugin '{0}'")]
    NoBackup(String),

    #[error("backup for plugin '{plugin_id}' is corrupt: {reason}")]
    Corrupt { plugin_id: String, reason: String },

    #[error("restoring plugin '{plugin_id}' failed: {reason}")]
    RestoreFailed { plugin_id: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("corrupt {what}: {reason}")]
    Corrupt { what: String, reason: String },

    #[error("write rejected: {0}")]
    WriteFailed(String),
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, e: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    }
}
