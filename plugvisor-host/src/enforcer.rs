//! Permission enforcement at the sandbox boundary.
//!
//! Every boundary-crossing call from a plugin is described as a
//! `BoundaryAction` and checked here before the broker performs it.
//! Decisions are never cached: grants are read live on every call.

use crate::capabilities::CapabilityRegistry;
use crate::context::PluginExecutionContext;
use crate::error::{PluginError, PluginResult};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// What a boundary call would do if allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryEffect {
    NetworkEgress { url: String },
    StorageWrite { key: String, projected_bytes: u64 },
    HostAccess { operation: String },
    StorageRead { key: Option<String> },
    StorageDelete { key: String },
    Log,
}

impl BoundaryEffect {
    /// Effects that need an explicit grant. Deletes count as writes.
    pub fn is_dangerous(&self) -> bool {
        matches!(
            self,
            Self::NetworkEgress { .. }
                | Self::StorageWrite { .. }
                | Self::StorageDelete { .. }
                | Self::HostAccess { .. }
        )
    }
}

impl fmt::Display for BoundaryEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkEgress { url } => write!(f, "network egress to {url}"),
            Self::StorageWrite { key, .. } => write!(f, "storage write of '{key}'"),
            Self::HostAccess { operation } => write!(f, "host access '{operation}'"),
            Self::StorageRead { key: Some(key) } => write!(f, "storage read of '{key}'"),
            Self::StorageRead { key: None } => f.write_str("storage listing"),
            Self::StorageDelete { key } => write!(f, "storage delete of '{key}'"),
            Self::Log => f.write_str("log write"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryAction {
    pub capability: String,
    pub effect: BoundaryEffect,
}

#[derive(Clone)]
pub struct PermissionEnforcer {
    registry: Arc<CapabilityRegistry>,
}

impl PermissionEnforcer {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Registered, entitled, and currently granted.
    pub fn check_permission(&self, ctx: &PluginExecutionContext, capability: &str) -> bool {
        let Some(entry) = self.registry.lookup(capability) else {
            return false;
        };
        ctx.capabilities.contains_key(capability) && ctx.is_granted(entry.required_permission)
    }

    pub fn enforce_boundary(
        &self,
        ctx: &PluginExecutionContext,
        action: &BoundaryAction,
    ) -> PluginResult<()> {
        if !action.effect.is_dangerous() {
            return Ok(());
        }

        if !self.check_permission(ctx, &action.capability) {
            return Err(self.deny(ctx, action.effect.to_string()));
        }

        let limits = ctx.sandbox.limits();
        match &action.effect {
            BoundaryEffect::NetworkEgress { url } => {
                let host = reqwest::Url::parse(url)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string));
                match host {
                    Some(host) if limits.allows_host(&host) => Ok(()),
                    Some(host) => Err(self.deny(
                        ctx,
                        format!("network egress to {host} (not in allowlist)"),
                    )),
                    None => Err(self.deny(ctx, format!("network egress to invalid url '{url}'"))),
                }
            }
            BoundaryEffect::StorageWrite {
                key,
                projected_bytes,
            } if *projected_bytes > limits.storage_quota_bytes => {
                warn!(
                    plugin_id = %ctx.plugin_id,
                    key = %key,
                    projected = projected_bytes,
                    quota = limits.storage_quota_bytes,
                    "Storage quota exceeded"
                );
                Err(PluginError::ResourceLimitExceeded {
                    plugin_id: ctx.plugin_id.clone(),
                    detail: format!(
                        "storage write of '{key}' would use {projected_bytes} bytes, quota is {}",
                        limits.storage_quota_bytes
                    ),
                })
            }
            _ => Ok(()),
        }
    }

    fn deny(&self, ctx: &PluginExecutionContext, action: String) -> PluginError {
        warn!(plugin_id = %ctx.plugin_id, action = %action, "Boundary call denied");
        PluginError::PermissionDenied {
            plugin_id: ctx.plugin_id.clone(),
            action,
        }
    }
}
