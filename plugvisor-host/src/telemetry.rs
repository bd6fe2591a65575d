//! Telemetry sink: an append-only journal of execution outcomes and plugin
//! lifecycle events, with derived views for auditing.

use crate::error::{ErrorKind, PluginError, PluginResult};
use crate::ids::TaskId;
use crate::scheduler::TaskState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Maps the numeric level used across the Wasm ABI (0 = trace … 4 = error).
    pub fn from_abi(level: i32) -> Self {
        match level {
            i32::MIN..=0 => Self::Trace,
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warn,
            _ => Self::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginLogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl PluginLogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetrics {
    pub execution_time_ms: u64,
    /// Peak linear memory reported by the isolate.
    pub memory_used_bytes: u64,
    pub network_requests: u64,
    /// Size of the plugin's storage namespace when the execution ended.
    pub storage_used_bytes: u64,
    pub errors: u64,
}

/// Immutable outcome of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<PluginLogEntry>,
    pub metrics: PluginMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    pub plugin_id: String,
    pub function: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub result: PluginExecutionResult,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Installed,
    Updated,
    UpdateRestored,
    RolledBack,
    Uninstalled,
    PermissionGranted,
    PermissionRevoked,
}

impl LifecycleEvent {
    /// Events after which the plugin runs fresh code.
    fn resets_health(&self) -> bool {
        matches!(
            self,
            Self::Installed | Self::Updated | Self::UpdateRestored | Self::RolledBack
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub plugin_id: String,
    pub event: LifecycleEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum JournalEntry {
    Execution(ExecutionRecord),
    Lifecycle(LifecycleRecord),
}

impl JournalEntry {
    pub fn plugin_id(&self) -> &str {
        match self {
            Self::Execution(r) => &r.plugin_id,
            Self::Lifecycle(r) => &r.plugin_id,
        }
    }
}

/// Per-state counts over a slice of the journal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySummary {
    pub executions: usize,
    pub failures: usize,
    pub by_state: BTreeMap<TaskState, usize>,
    pub network_requests: u64,
}

#[derive(Default)]
struct Journal {
    entries: Vec<JournalEntry>,
    recorded: HashSet<TaskId>,
}

pub struct TelemetrySink {
    journal: Mutex<Journal>,
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
}

impl TelemetrySink {
    /// In-memory sink.
    pub fn new() -> Self {
        Self {
            journal: Mutex::new(Journal::default()),
            file: None,
            path: None,
        }
    }

    /// Sink backed by a JSON-lines file; existing entries are replayed.
    pub fn open(path: impl AsRef<Path>) -> PluginResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            load_journal(&path)?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PluginError::Store(crate::error::StoreError::io(parent, e))
                })?;
            }
            Vec::new()
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PluginError::Store(crate::error::StoreError::io(&path, e)))?;

        let recorded = entries
            .iter()
            .filter_map(|e| match e {
                JournalEntry::Execution(r) => Some(r.task_id),
                JournalEntry::Lifecycle(_) => None,
            })
            .collect();
        debug!(path = %path.display(), entries = entries.len(), "Opened telemetry journal");
        Ok(Self {
            journal: Mutex::new(Journal { entries, recorded }),
            file: Some(Mutex::new(file)),
            path: Some(path),
        })
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records the outcome of a task. A second record for the same task is rejected.
    pub fn record(&self, record: ExecutionRecord) -> PluginResult<()> {
        let mut journal = self.lock();
        if !journal.recorded.insert(record.task_id) {
            return Err(PluginError::DuplicateRecord(record.task_id));
        }
        let entry = JournalEntry::Execution(record);
        self.append_to_file(&entry);
        journal.entries.push(entry);
        Ok(())
    }

    pub fn record_lifecycle(
        &self,
        plugin_id: &str,
        event: LifecycleEvent,
        version: Option<u64>,
        detail: Option<String>,
    ) {
        let entry = JournalEntry::Lifecycle(LifecycleRecord {
            plugin_id: plugin_id.to_string(),
            event,
            version,
            detail,
            timestamp: Utc::now(),
        });
        let mut journal = self.lock();
        self.append_to_file(&entry);
        journal.entries.push(entry);
    }

    pub fn execution(&self, task_id: TaskId) -> Option<ExecutionRecord> {
        self.lock().entries.iter().find_map(|e| match e {
            JournalEntry::Execution(r) if r.task_id == task_id => Some(r.clone()),
            _ => None,
        })
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.lock().entries.clone()
    }

    /// Chronological audit trail for one plugin: lifecycle events, plugin
    /// logs, and one outcome line per execution.
    pub fn audit_log(&self, plugin_id: &str) -> Vec<PluginLogEntry> {
        let journal = self.lock();
        let mut out = Vec::new();
        for entry in journal.entries.iter().filter(|e| e.plugin_id() == plugin_id) {
            match entry {
                JournalEntry::Lifecycle(r) => {
                    let mut message = format!("{:?}", r.event).to_lowercase();
                    if let Some(detail) = &r.detail {
                        message = format!("{message}: {detail}");
                    }
                    out.push(PluginLogEntry {
                        level: LogLevel::Info,
                        message,
                        timestamp: r.timestamp,
                        metadata: Some(serde_json::json!({
                            "event": r.event,
                            "version": r.version,
                        })),
                    });
                }
                JournalEntry::Execution(r) => {
                    out.extend(r.result.logs.iter().cloned());
                    let level = if r.result.success {
                        LogLevel::Info
                    } else {
                        LogLevel::Error
                    };
                    let mut message = format!("{} {:?}", r.function, r.state).to_lowercase();
                    if let Some(error) = &r.result.error {
                        message = format!("{message}: {error}");
                    }
                    out.push(PluginLogEntry {
                        level,
                        message,
                        timestamp: r.recorded_at,
                        metadata: Some(serde_json::json!({
                            "task_id": r.task_id,
                            "state": r.state,
                            "error_kind": r.error_kind,
                            "metrics": r.result.metrics,
                        })),
                    });
                }
            }
        }
        out
    }

    /// Failed executions of a plugin recorded at or after `since`.
    pub fn error_count(&self, plugin_id: &str, since: DateTime<Utc>) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|e| match e {
                JournalEntry::Execution(r) => {
                    r.plugin_id == plugin_id && !r.result.success && r.recorded_at >= since
                }
                JournalEntry::Lifecycle(_) => false,
            })
            .count()
    }

    /// Counts per terminal state, for one plugin or for all.
    pub fn summary(&self, plugin_id: Option<&str>) -> TelemetrySummary {
        let journal = self.lock();
        let mut summary = TelemetrySummary::default();
        for entry in &journal.entries {
            let JournalEntry::Execution(r) = entry else {
                continue;
            };
            if plugin_id.is_some_and(|id| id != r.plugin_id) {
                continue;
            }
            summary.executions += 1;
            if !r.result.success {
                summary.failures += 1;
            }
            *summary.by_state.entry(r.state).or_default() += 1;
            summary.network_requests += r.result.metrics.network_requests;
        }
        summary
    }

    /// The crash message when the plugin's latest execution since its last
    /// install, update or rollback crashed its sandbox.
    pub fn degraded(&self, plugin_id: &str) -> Option<String> {
        let journal = self.lock();
        for entry in journal.entries.iter().rev() {
            match entry {
                JournalEntry::Lifecycle(r) if r.plugin_id == plugin_id => {
                    if r.event.resets_health() {
                        return None;
                    }
                }
                JournalEntry::Execution(r) if r.plugin_id == plugin_id => {
                    return match r.error_kind {
                        Some(ErrorKind::SandboxCrash) => r.result.error.clone(),
                        _ => None,
                    };
                }
                _ => {}
            }
        }
        None
    }

    fn append_to_file(&self, entry: &JournalEntry) {
        let Some(file) = &self.file else {
            return;
        };
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize telemetry entry");
                return;
            }
        };
        let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{line}") {
            warn!(error = %e, "Failed to append to telemetry journal");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads every entry from a JSON-lines journal. Blank lines are skipped.
pub fn load_journal(path: &Path) -> PluginResult<Vec<JournalEntry>> {
    let file =
        File::open(path).map_err(|e| PluginError::Store(crate::error::StoreError::io(path, e)))?;
    let mut entries = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| PluginError::Store(crate::error::StoreError::io(path, e)))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line).map_err(|e| {
            PluginError::Store(crate::error::StoreError::Corrupt {
                what: format!("{} line {}", path.display(), n + 1),
                reason: e.to_string(),
            })
        })?;
        entries.push(entry);
    }
    Ok(entries)
}
