//! Execution scheduler.
//!
//! A single Tokio task owns the queue, the task table and the slot counter.
//! Callers talk to it through a cloneable [`SchedulerHandle`]; workers and
//! timers report back on the same channel. Plugin code runs on blocking
//! threads inside the isolate and never touches scheduler state.
//!
//! ```text
//! Queued -> Running -> { Succeeded | Failed | TimedOut | Cancelled }
//! ```
//!
//! Every admitted task settles exactly once: the entry is removed from the
//! task table on its first terminal transition, and any later worker result,
//! deadline or grace timer for that id is ignored.

use crate::broker::{BrokerReport, CancelSignal, HostBridge, IoBroker};
use crate::capabilities::CapabilityRegistry;
use crate::config::PluginManagerConfig;
use crate::context::{ExecutionScope, PluginExecutionContext};
use crate::enforcer::PermissionEnforcer;
use crate::error::{PluginError, PluginResult};
use crate::ids::TaskId;
use crate::permissions::GrantTable;
use crate::plugin::Plugin;
use crate::runtime::{Fault, Invocation};
use crate::sandbox::{LiveSandbox, SandboxAllocator};
use crate::store::PluginStore;
use crate::telemetry::{ExecutionRecord, PluginExecutionResult, PluginMetrics, TelemetrySink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Terminal states kept for `task_state` lookups after a task settles.
const RETAINED_STATES: usize = 4_096;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

pub type Settlement = Result<PluginExecutionResult, PluginError>;

/// What to run and on whose behalf.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub plugin: Arc<Plugin>,
    pub function: String,
    pub args: Value,
    pub scope: ExecutionScope,
}

/// Returned by `submit`; resolves once the task reaches a terminal state.
#[derive(Debug)]
pub struct ExecutionHandle {
    id: TaskId,
    plugin_id: String,
    admitted_as: TaskState,
    rx: oneshot::Receiver<Settlement>,
}

impl ExecutionHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// State the task entered at admission.
    pub fn admitted_as(&self) -> TaskState {
        self.admitted_as
    }

    pub async fn wait(self) -> Settlement {
        self.rx.await.unwrap_or(Err(PluginError::SchedulerStopped))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub running: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub max_queued: usize,
    /// Terminal transitions since the scheduler started.
    pub settled: BTreeMap<TaskState, usize>,
}

/// Running and queued task counts for one plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginActivity {
    pub running: usize,
    pub queued: usize,
}

impl PluginActivity {
    pub fn is_active(&self) -> bool {
        self.running + self.queued > 0
    }
}

/// Everything the scheduler needs to build an execution.
pub struct SchedulerDeps {
    pub config: Arc<PluginManagerConfig>,
    pub allocator: Arc<SandboxAllocator>,
    pub registry: Arc<CapabilityRegistry>,
    pub grants: Arc<GrantTable>,
    pub store: Arc<dyn PluginStore>,
    pub host: Arc<dyn HostBridge>,
    pub telemetry: Arc<TelemetrySink>,
}

enum Command {
    Submit {
        id: TaskId,
        request: TaskRequest,
        settle: oneshot::Sender<Settlement>,
        reply: oneshot::Sender<PluginResult<TaskState>>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<PluginResult<()>>,
    },
    CancelPlugin {
        plugin_id: String,
        reply: oneshot::Sender<usize>,
    },
    WorkerFinished {
        id: TaskId,
        outcome: Result<Value, Fault>,
    },
    Deadline {
        id: TaskId,
    },
    GraceExpired {
        id: TaskId,
    },
    State {
        id: TaskId,
        reply: oneshot::Sender<Option<TaskState>>,
    },
    Activity {
        plugin_id: String,
        reply: oneshot::Sender<PluginActivity>,
    },
    Stats {
        reply: oneshot::Sender<SchedulerStats>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<usize>>,
    },
}

/// Cloneable front end of the scheduler actor.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    /// Starts the actor on the current Tokio runtime. It runs until
    /// [`shutdown`](Self::shutdown).
    pub fn spawn(deps: SchedulerDeps) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            deps,
            tx: tx.clone(),
            rx,
            queue: VecDeque::new(),
            tasks: HashMap::new(),
            running: 0,
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            settled: BTreeMap::new(),
        };
        tokio::spawn(actor.run());
        Self { tx }
    }

    /// Admits a task. Fails fast when the queue is full; never waits for
    /// the task to complete.
    pub async fn submit(&self, request: TaskRequest) -> PluginResult<ExecutionHandle> {
        if !request.plugin.exports_function(&request.function) {
            return Err(PluginError::FunctionNotExported {
                plugin_id: request.plugin.id.clone(),
                function: request.function,
            });
        }
        let id = TaskId::new();
        let plugin_id = request.plugin.id.clone();
        let (settle, rx) = oneshot::channel();
        let admitted_as = self
            .ask(|reply| Command::Submit {
                id,
                request,
                settle,
                reply,
            })
            .await??;
        Ok(ExecutionHandle {
            id,
            plugin_id,
            admitted_as,
            rx,
        })
    }

    /// Cancels a queued or running task.
    pub async fn cancel(&self, id: TaskId) -> PluginResult<()> {
        self.ask(|reply| Command::Cancel { id, reply }).await?
    }

    /// Force-cancels every queued and running task of a plugin.
    pub async fn cancel_plugin(&self, plugin_id: &str) -> PluginResult<usize> {
        let plugin_id = plugin_id.to_string();
        self.ask(|reply| Command::CancelPlugin { plugin_id, reply })
            .await
    }

    /// Current state of a task; terminal states are remembered for a while.
    pub async fn task_state(&self, id: TaskId) -> PluginResult<Option<TaskState>> {
        self.ask(|reply| Command::State { id, reply }).await
    }

    pub async fn plugin_activity(&self, plugin_id: &str) -> PluginResult<PluginActivity> {
        let plugin_id = plugin_id.to_string();
        self.ask(|reply| Command::Activity { plugin_id, reply })
            .await
    }

    pub async fn stats(&self) -> PluginResult<SchedulerStats> {
        self.ask(|reply| Command::Stats { reply }).await
    }

    /// Cancels everything outstanding and stops the actor. Returns how many
    /// tasks were cancelled.
    pub async fn shutdown(&self) -> PluginResult<usize> {
        self.ask(|reply| Command::Shutdown { reply: Some(reply) })
            .await
    }

    /// Fire-and-forget shutdown for use from `Drop`.
    pub fn shutdown_now(&self) {
        let _ = self.tx.send(Command::Shutdown { reply: None });
    }

    async fn ask<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> PluginResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| PluginError::SchedulerStopped)?;
        rx.await.map_err(|_| PluginError::SchedulerStopped)
    }
}

struct TaskEntry {
    plugin: Arc<Plugin>,
    function: String,
    created_at: DateTime<Utc>,
    state: TaskState,
    /// Taken at dispatch.
    pending: Option<(Value, ExecutionScope)>,
    settle: Option<oneshot::Sender<Settlement>>,
    run: Option<RunningTask>,
}

struct RunningTask {
    live: Arc<LiveSandbox>,
    broker: Arc<IoBroker>,
    cancel: CancelSignal,
    started: Instant,
    deadline: JoinHandle<()>,
    grace: Option<JoinHandle<()>>,
}

impl RunningTask {
    fn stop_timers(&self) {
        self.deadline.abort();
        if let Some(grace) = &self.grace {
            grace.abort();
        }
    }
}

struct Actor {
    deps: SchedulerDeps,
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
    queue: VecDeque<TaskId>,
    tasks: HashMap<TaskId, TaskEntry>,
    running: usize,
    finished: HashMap<TaskId, TaskState>,
    finished_order: VecDeque<TaskId>,
    settled: BTreeMap<TaskState, usize>,
}

impl Actor {
    async fn run(mut self) {
        debug!(
            max_concurrent = self.deps.config.max_concurrent_executions,
            max_queued = self.deps.config.max_queued_executions,
            "Scheduler started"
        );
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Submit {
                    id,
                    request,
                    settle,
                    reply,
                } => {
                    let admitted = self.admit(id, request, settle);
                    let _ = reply.send(admitted);
                }
                Command::Cancel { id, reply } => {
                    let _ = reply.send(self.cancel(id));
                }
                Command::CancelPlugin { plugin_id, reply } => {
                    let _ = reply.send(self.cancel_plugin(&plugin_id));
                }
                Command::WorkerFinished { id, outcome } => self.worker_finished(id, outcome),
                Command::Deadline { id } => self.deadline(id),
                Command::GraceExpired { id } => self.grace_expired(id),
                Command::State { id, reply } => {
                    let state = self
                        .tasks
                        .get(&id)
                        .map(|t| t.state)
                        .or_else(|| self.finished.get(&id).copied());
                    let _ = reply.send(state);
                }
                Command::Activity { plugin_id, reply } => {
                    let _ = reply.send(self.activity(&plugin_id));
                }
                Command::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                Command::Shutdown { reply } => {
                    let ids: Vec<TaskId> = self.tasks.keys().copied().collect();
                    let cancelled = ids.into_iter().filter(|id| self.force_cancel(*id)).count();
                    info!(cancelled, "Scheduler stopped");
                    if let Some(reply) = reply {
                        let _ = reply.send(cancelled);
                    }
                    return;
                }
            }
        }
    }

    // ================================================================
    // Admission and dispatch
    // ================================================================

    fn admit(
        &mut self,
        id: TaskId,
        request: TaskRequest,
        settle: oneshot::Sender<Settlement>,
    ) -> PluginResult<TaskState> {
        let has_slot =
            self.running < self.deps.config.max_concurrent_executions && self.queue.is_empty();
        if !has_slot && self.queue.len() >= self.deps.config.max_queued_executions {
            debug!(
                plugin_id = %request.plugin.id,
                queued = self.queue.len(),
                "Rejecting task, queue full"
            );
            return Err(PluginError::SchedulerBusy {
                queued: self.queue.len(),
            });
        }

        self.tasks.insert(
            id,
            TaskEntry {
                plugin: request.plugin,
                function: request.function,
                created_at: Utc::now(),
                state: TaskState::Queued,
                pending: Some((request.args, request.scope)),
                settle: Some(settle),
                run: None,
            },
        );
        if has_slot {
            self.start(id);
        } else {
            self.queue.push_back(id);
            debug!(task_id = %id, queued = self.queue.len(), "Task queued");
        }
        Ok(self
            .tasks
            .get(&id)
            .map(|t| t.state)
            .or_else(|| self.finished.get(&id).copied())
            .unwrap_or(TaskState::Queued))
    }

    /// Starts queued tasks while slots are free, oldest first.
    fn pump(&mut self) {
        while self.running < self.deps.config.max_concurrent_executions {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            self.start(id);
        }
    }

    fn start(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let Some((args, scope)) = task.pending.take() else {
            return;
        };
        let plugin = Arc::clone(&task.plugin);
        let function = task.function.clone();

        // Only limits and bookkeeping here; the isolate is spawned (and its
        // code compiled) on the worker thread.
        let live = match self.deps.allocator.reserve(&plugin) {
            Ok(live) => live,
            Err(e) => {
                warn!(plugin_id = %plugin.id, task_id = %id, error = %e, "Sandbox allocation failed");
                self.settle(id, TaskState::Failed, Err(e), None);
                return;
            }
        };

        let ctx = PluginExecutionContext::new(
            &plugin,
            scope,
            &self.deps.registry,
            live.sandbox().clone(),
            Arc::clone(&self.deps.grants),
        );
        let cancel = CancelSignal::new();
        let broker = Arc::new(IoBroker::new(
            id,
            ctx,
            PermissionEnforcer::new(Arc::clone(&self.deps.registry)),
            Arc::clone(&self.deps.store),
            Arc::clone(&self.deps.host),
            cancel.clone(),
            live.terminated_flag(),
        ));
        let invocation = Invocation::new(id, &plugin.id, &function, args, Arc::clone(&broker));

        let allocator = Arc::clone(&self.deps.allocator);
        let worker = Arc::clone(&live);
        let worker_plugin = Arc::clone(&plugin);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || {
                let isolate = allocator.launch(&worker_plugin, &worker)?;
                if worker.is_terminated() {
                    return Err(Fault::Terminated);
                }
                isolate.invoke(&invocation)
            })
            .await
            .unwrap_or_else(|e| Err(Fault::Crashed(join_error_message(e))));
            let _ = tx.send(Command::WorkerFinished { id, outcome });
        });

        let timeout_ms = live.sandbox().timeout_ms();
        let deadline = self.after(timeout_ms, Command::Deadline { id });

        info!(
            plugin_id = %plugin.id,
            task_id = %id,
            function = %function,
            worker_id = %live.sandbox().worker_id(),
            timeout_ms,
            "Task started"
        );
        self.running += 1;
        if let Some(task) = self.tasks.get_mut(&id) {
            task.state = TaskState::Running;
            task.run = Some(RunningTask {
                live,
                broker,
                cancel,
                started: Instant::now(),
                deadline,
                grace: None,
            });
        }
    }

    fn after(&self, ms: u64, command: Command) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let _ = tx.send(command);
        })
    }

    // ================================================================
    // Completion paths
    // ================================================================

    fn worker_finished(&mut self, id: TaskId, outcome: Result<Value, Fault>) {
        let Some(task) = self.tasks.get(&id) else {
            debug!(task_id = %id, "Ignoring result of settled task");
            return;
        };
        let Some(run) = &task.run else {
            return;
        };
        let plugin_id = task.plugin.id.clone();
        let report = run.broker.report();
        let cancel_requested = run.cancel.is_requested();

        let (state, outcome) = if cancel_requested {
            (
                TaskState::Cancelled,
                Err(PluginError::Cancelled {
                    plugin_id: plugin_id.clone(),
                    task_id: id,
                }),
            )
        } else {
            classify(&plugin_id, id, outcome, &report)
        };
        if state == TaskState::Failed {
            if let Err(e) = &outcome {
                warn!(plugin_id = %plugin_id, task_id = %id, error = %e, "Task failed");
            }
        }
        self.settle(id, state, outcome, Some(report));
        self.pump();
    }

    fn deadline(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        let Some(run) = &task.run else {
            return;
        };
        let timeout_ms = run.live.sandbox().timeout_ms();
        let plugin_id = task.plugin.id.clone();
        warn!(plugin_id = %plugin_id, task_id = %id, timeout_ms, "Task timed out");
        self.deps
            .allocator
            .destroy_sandbox(run.live.sandbox().worker_id());
        let report = run.broker.report();
        self.settle(
            id,
            TaskState::TimedOut,
            Err(PluginError::Timeout {
                plugin_id,
                task_id: id,
                timeout_ms,
            }),
            Some(report),
        );
        self.pump();
    }

    fn grace_expired(&mut self, id: TaskId) {
        if self.tasks.get(&id).is_some_and(|t| t.run.is_some()) {
            warn!(task_id = %id, "Task ignored cancellation, terminating");
            self.force_cancel(id);
            self.pump();
        }
    }

    // ================================================================
    // Cancellation
    // ================================================================

    fn cancel(&mut self, id: TaskId) -> PluginResult<()> {
        let Some(task) = self.tasks.get(&id) else {
            return Err(PluginError::TaskNotFound(id));
        };
        let plugin_id = task.plugin.id.clone();
        let Some(run) = &task.run else {
            self.queue.retain(|queued| *queued != id);
            info!(plugin_id = %plugin_id, task_id = %id, "Queued task cancelled");
            self.settle(
                id,
                TaskState::Cancelled,
                Err(PluginError::Cancelled {
                    plugin_id,
                    task_id: id,
                }),
                None,
            );
            return Ok(());
        };
        if run.grace.is_some() {
            return Ok(());
        }

        run.cancel.request();
        let grace_ms = self.deps.config.cancel_grace_ms;
        info!(plugin_id = %plugin_id, task_id = %id, grace_ms, "Cancellation requested");
        let grace = self.after(grace_ms, Command::GraceExpired { id });
        if let Some(run) = self.tasks.get_mut(&id).and_then(|t| t.run.as_mut()) {
            run.grace = Some(grace);
        }
        Ok(())
    }

    fn cancel_plugin(&mut self, plugin_id: &str) -> usize {
        let ids: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.plugin.id == plugin_id)
            .map(|(id, _)| *id)
            .collect();
        let cancelled = ids.into_iter().filter(|id| self.force_cancel(*id)).count();
        self.pump();
        cancelled
    }

    /// Settles a task as cancelled right away, destroying its sandbox if it
    /// is running.
    fn force_cancel(&mut self, id: TaskId) -> bool {
        let Some(task) = self.tasks.get(&id) else {
            return false;
        };
        let plugin_id = task.plugin.id.clone();
        let report = task.run.as_ref().map(|run| {
            run.cancel.request();
            self.deps
                .allocator
                .destroy_sandbox(run.live.sandbox().worker_id());
            run.broker.report()
        });
        self.queue.retain(|queued| *queued != id);
        self.settle(
            id,
            TaskState::Cancelled,
            Err(PluginError::Cancelled {
                plugin_id,
                task_id: id,
            }),
            report,
        );
        true
    }

    // ================================================================
    // Settlement
    // ================================================================

    /// The terminal transition: runs once per task.
    ///
    /// State, slot and sandbox bookkeeping happen here. Reading storage
    /// usage and appending to the journal touch the filesystem, so they run
    /// on a blocking thread that resolves the caller's handle last.
    fn settle(
        &mut self,
        id: TaskId,
        state: TaskState,
        outcome: Result<Value, PluginError>,
        report: Option<BrokerReport>,
    ) {
        let Some(mut task) = self.tasks.remove(&id) else {
            return;
        };
        debug_assert!(state.is_terminal());

        let mut metrics = PluginMetrics::default();
        let mut broker = None;
        if let Some(run) = task.run.take() {
            run.stop_timers();
            self.deps
                .allocator
                .destroy_sandbox(run.live.sandbox().worker_id());
            self.running = self.running.saturating_sub(1);
            metrics.execution_time_ms = run.started.elapsed().as_millis() as u64;
            metrics.memory_used_bytes = run.live.peak_memory_bytes();
            broker = Some(run.broker);
        }
        let report = report.unwrap_or_default();
        metrics.network_requests = report.network_requests;
        metrics.errors = report.errors + u64::from(outcome.is_err());

        info!(
            plugin_id = %task.plugin.id,
            task_id = %id,
            state = ?state,
            queued_for_ms = (Utc::now() - task.created_at).num_milliseconds(),
            "Task settled"
        );
        *self.settled.entry(state).or_default() += 1;
        self.finished.insert(id, state);
        self.finished_order.push_back(id);
        while self.finished_order.len() > RETAINED_STATES {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }

        let telemetry = Arc::clone(&self.deps.telemetry);
        let settle = task.settle.take();
        let plugin_id = task.plugin.id.clone();
        let function = task.function;
        let logs = report.logs;
        tokio::task::spawn_blocking(move || {
            if let Some(broker) = broker {
                metrics.storage_used_bytes = broker.storage_used_bytes();
            }
            let result = PluginExecutionResult {
                success: outcome.is_ok(),
                result: outcome.as_ref().ok().cloned(),
                error: outcome.as_ref().err().map(ToString::to_string),
                logs,
                metrics,
            };
            let record = ExecutionRecord {
                task_id: id,
                plugin_id,
                function,
                state,
                error_kind: outcome.as_ref().err().map(PluginError::kind),
                result: result.clone(),
                recorded_at: Utc::now(),
            };
            if let Err(e) = telemetry.record(record) {
                warn!(task_id = %id, error = %e, "Failed to record telemetry");
            }
            if let Some(settle) = settle {
                let _ = settle.send(outcome.map(|_| result));
            }
        });
    }

    fn activity(&self, plugin_id: &str) -> PluginActivity {
        let mut activity = PluginActivity::default();
        for task in self.tasks.values().filter(|t| t.plugin.id == plugin_id) {
            match task.state {
                TaskState::Running => activity.running += 1,
                TaskState::Queued => activity.queued += 1,
                _ => {}
            }
        }
        activity
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.running,
            queued: self.queue.len(),
            max_concurrent: self.deps.config.max_concurrent_executions,
            max_queued: self.deps.config.max_queued_executions,
            settled: self.settled.clone(),
        }
    }
}

/// Maps an invocation outcome to its terminal state and reported error.
fn classify(
    plugin_id: &str,
    task_id: TaskId,
    outcome: Result<Value, Fault>,
    report: &BrokerReport,
) -> (TaskState, Result<Value, PluginError>) {
    let fault = match outcome {
        Ok(value) => return (TaskState::Succeeded, Ok(value)),
        Err(fault) => fault,
    };
    let error = match fault {
        Fault::Boundary(e @ PluginError::Cancelled { .. }) => {
            return (TaskState::Cancelled, Err(e));
        }
        Fault::Terminated => {
            return (
                TaskState::Cancelled,
                Err(PluginError::Cancelled {
                    plugin_id: plugin_id.to_string(),
                    task_id,
                }),
            );
        }
        Fault::Boundary(e) => e,
        Fault::Plugin(message) => report
            .last_denial
            .clone()
            .unwrap_or_else(|| PluginError::Execution {
                plugin_id: plugin_id.to_string(),
                message,
            }),
        Fault::Crashed(message) => PluginError::SandboxCrash {
            plugin_id: plugin_id.to_string(),
            message,
        },
        Fault::ResourceExhausted(detail) => PluginError::ResourceLimitExceeded {
            plugin_id: plugin_id.to_string(),
            detail,
        },
    };
    (TaskState::Failed, Err(error))
}

fn join_error_message(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::NullHost;
    use crate::plugin::tests::sample_plugin;
    use crate::runtime::{NativeRuntime, SandboxRuntime};
    use crate::sandbox::PluginSandbox;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Fixture {
        scheduler: SchedulerHandle,
        runtime: Arc<NativeRuntime>,
        telemetry: Arc<TelemetrySink>,
        allocator: Arc<SandboxAllocator>,
        plugin: Arc<Plugin>,
    }

    fn fixture(config: PluginManagerConfig) -> Fixture {
        let runtime = Arc::new(NativeRuntime::new());
        let plugin = sample_plugin("acme.sched");
        let (scheduler, allocator, telemetry) = spawn_for(config, runtime.clone(), &plugin);
        Fixture {
            scheduler,
            runtime,
            telemetry,
            allocator,
            plugin: Arc::new(plugin),
        }
    }

    fn spawn_for(
        config: PluginManagerConfig,
        runtime: Arc<dyn SandboxRuntime>,
        plugin: &Plugin,
    ) -> (SchedulerHandle, Arc<SandboxAllocator>, Arc<TelemetrySink>) {
        let config = Arc::new(config);
        let allocator = Arc::new(SandboxAllocator::new(runtime, Arc::clone(&config)));
        let telemetry = Arc::new(TelemetrySink::new());
        let grants = Arc::new(GrantTable::new());
        grants.set(&plugin.id, plugin.granted.clone());
        let scheduler = SchedulerHandle::spawn(SchedulerDeps {
            config,
            allocator: Arc::clone(&allocator),
            registry: Arc::new(CapabilityRegistry::with_builtins()),
            grants,
            store: Arc::new(MemoryStore::new()),
            host: Arc::new(NullHost),
            telemetry: Arc::clone(&telemetry),
        });
        (scheduler, allocator, telemetry)
    }

    /// Native runtime whose isolates for one plugin take a while to spawn,
    /// standing in for a large module being compiled.
    struct SlowSpawn {
        inner: NativeRuntime,
        slow_plugin: &'static str,
        delay: Duration,
    }

    impl SandboxRuntime for SlowSpawn {
        fn name(&self) -> &'static str {
            "slow-native"
        }

        fn spawn(
            &self,
            plugin: &Plugin,
            sandbox: &PluginSandbox,
        ) -> PluginResult<Arc<dyn crate::runtime::Isolate>> {
            if plugin.id == self.slow_plugin {
                std::thread::sleep(self.delay);
            }
            self.inner.spawn(plugin, sandbox)
        }
    }

    fn request(plugin: &Arc<Plugin>, args: Value) -> TaskRequest {
        TaskRequest {
            plugin: Arc::clone(plugin),
            function: "run".into(),
            args,
            scope: ExecutionScope::user("tester"),
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::TimedOut.is_terminal());
        assert!(!TaskState::Cancelled.is_active());
    }

    #[test]
    fn plugin_error_wins_unless_a_boundary_call_was_denied() {
        let id = TaskId::new();
        let (state, outcome) = classify(
            "acme.a",
            id,
            Err(Fault::Plugin("boom".into())),
            &BrokerReport::default(),
        );
        assert_eq!(state, TaskState::Failed);
        assert!(matches!(outcome, Err(PluginError::Execution { .. })));

        let report = BrokerReport {
            last_denial: Some(PluginError::PermissionDenied {
                plugin_id: "acme.a".into(),
                action: "network egress".into(),
            }),
            ..Default::default()
        };
        let (_, outcome) = classify("acme.a", id, Err(Fault::Plugin("boom".into())), &report);
        assert!(matches!(outcome, Err(PluginError::PermissionDenied { .. })));

        let (state, outcome) = classify("acme.a", id, Err(Fault::Crashed("trap".into())), &report);
        assert_eq!(state, TaskState::Failed);
        assert!(matches!(outcome, Err(PluginError::SandboxCrash { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn success_records_telemetry_and_frees_sandbox() {
        let f = fixture(PluginManagerConfig::default());
        f.runtime.register("acme.sched", "run", |inv| {
            inv.log(crate::telemetry::LogLevel::Info, "hello");
            Ok(json!({ "echo": inv.args.clone() }))
        });

        let handle = f
            .scheduler
            .submit(request(&f.plugin, json!(7)))
            .await
            .unwrap();
        let id = handle.id();
        let result = handle.wait().await.unwrap();

        assert!(result.success);
        assert_eq!(result.result, Some(json!({ "echo": 7 })));
        assert_eq!(result.logs.len(), 1);
        assert_eq!(f.scheduler.task_state(id).await.unwrap(), Some(TaskState::Succeeded));
        assert_eq!(f.telemetry.execution(id).unwrap().state, TaskState::Succeeded);
        assert_eq!(f.allocator.live_count(), 0);
    }

    #[tokio::test]
    async fn unexported_function_rejected_at_submit() {
        let f = fixture(PluginManagerConfig::default());
        let mut req = request(&f.plugin, Value::Null);
        req.function = "secret".into();
        let err = f.scheduler.submit(req).await.unwrap_err();
        assert!(matches!(err, PluginError::FunctionNotExported { .. }));
        assert_eq!(f.scheduler.stats().await.unwrap().running, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panic_in_handler_is_a_crash() {
        let f = fixture(PluginManagerConfig::default());
        f.runtime
            .register("acme.sched", "run", |_| panic!("handler exploded"));

        let handle = f
            .scheduler
            .submit(request(&f.plugin, Value::Null))
            .await
            .unwrap();
        let id = handle.id();
        match handle.wait().await {
            Err(PluginError::SandboxCrash { message, .. }) => {
                assert!(message.contains("handler exploded"));
            }
            other => panic!("expected crash, got {other:?}"),
        }
        let record = f.telemetry.execution(id).unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(record.error_kind, Some(crate::error::ErrorKind::SandboxCrash));
        assert_eq!(record.result.metrics.errors, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_accepting_work() {
        let f = fixture(PluginManagerConfig::default());
        f.runtime.register("acme.sched", "run", |_| Ok(Value::Null));
        assert_eq!(f.scheduler.shutdown().await.unwrap(), 0);
        let err = f
            .scheduler
            .submit(request(&f.plugin, Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::SchedulerStopped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_isolate_spawn_does_not_delay_other_deadlines() {
        let runtime = Arc::new(SlowSpawn {
            inner: NativeRuntime::new(),
            slow_plugin: "acme.heavy",
            delay: Duration::from_millis(1_500),
        });
        runtime.inner.register("acme.sched", "run", |inv| {
            while !inv.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(Value::Null)
        });
        runtime
            .inner
            .register("acme.heavy", "run", |_| Ok(json!("done")));

        let mut quick = sample_plugin("acme.sched");
        quick.manifest.limits.timeout_ms = Some(100);
        let (scheduler, allocator, _) =
            spawn_for(PluginManagerConfig::default(), runtime, &quick);
        let quick = Arc::new(quick);
        let heavy = Arc::new(sample_plugin("acme.heavy"));

        let started = Instant::now();
        let spinning = scheduler.submit(request(&quick, Value::Null)).await.unwrap();
        let heavy_task = scheduler.submit(request(&heavy, Value::Null)).await.unwrap();
        assert_eq!(heavy_task.admitted_as(), TaskState::Running);
        assert!(started.elapsed() < Duration::from_millis(500));

        let err = spinning.wait().await.unwrap_err();
        assert!(matches!(err, PluginError::Timeout { .. }), "{err:?}");
        let settled_after = started.elapsed();
        assert!(
            settled_after < Duration::from_millis(1_000),
            "timeout handled after {settled_after:?}"
        );

        let result = heavy_task.wait().await.unwrap();
        assert_eq!(result.result, Some(json!("done")));
        assert_eq!(allocator.live_count(), 0);
    }
}
