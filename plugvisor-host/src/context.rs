//! Per-execution context handed to the enforcer and I/O broker.

use crate::capabilities::{CapabilityEntry, CapabilityRegistry};
use crate::permissions::{GrantTable, Permission};
use crate::plugin::Plugin;
use crate::sandbox::PluginSandbox;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Who an execution runs on behalf of. Supplied by the caller at submit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionScope {
    pub user_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ExecutionScope {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Built when a task is dispatched; dropped when it settles.
#[derive(Debug, Clone)]
pub struct PluginExecutionContext {
    pub plugin_id: String,
    pub user_id: String,
    pub project_id: Option<String>,
    pub node_id: Option<String>,
    pub session_id: Option<String>,
    /// Registry entries the plugin's declared permissions entitle it to.
    pub capabilities: BTreeMap<String, CapabilityEntry>,
    pub sandbox: PluginSandbox,
    grants: Arc<GrantTable>,
}

impl PluginExecutionContext {
    pub fn new(
        plugin: &Plugin,
        scope: ExecutionScope,
        registry: &CapabilityRegistry,
        sandbox: PluginSandbox,
        grants: Arc<GrantTable>,
    ) -> Self {
        Self {
            plugin_id: plugin.id.clone(),
            user_id: scope.user_id,
            project_id: scope.project_id,
            node_id: scope.node_id,
            session_id: scope.session_id,
            capabilities: registry.closure_for(plugin.permissions.iter()),
            sandbox,
            grants,
        }
    }

    /// Reads the live grant table, so revocations apply mid-execution.
    pub fn is_granted(&self, permission: Permission) -> bool {
        self.grants.is_granted(&self.plugin_id, permission)
    }
}
