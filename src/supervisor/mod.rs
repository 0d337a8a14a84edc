//! Supervisor: task assignment, health tracking and recovery.
//!
//! The supervisor sits above the stage agents. It never touches data; it
//! decides *whether* and *when* a task runs:
//!
//! - upstream tasks named in `Task::depends_on` must report first
//! - a stage that is degraded or paused receives no new work
//! - each stage has a concurrency ceiling (an adjustable semaphore)
//!
//! Workers report `Started`/`Heartbeat`/`Finished` signals to a monitoring
//! loop that owns every [`AgentHealth`]. When a stage fails too often the
//! loop marks it degraded and cancels its in-flight tasks; it stays that way
//! until an operator sends [`OperatorCommand::Recover`].
//!
//! # Example
//!
//! ```ignore
//! let supervisor = Supervisor::new(agents, cache, sink, SupervisorConfig::default());
//! let report = supervisor.submit(task).await?;
//! supervisor.pause(StageKind::Modeling).await?;
//! ```

pub mod health;
pub(crate) mod monitor_loop;
pub mod operator;
pub mod plan;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use health::{AgentHealth, HealthSignal, HealthThresholds, StageStatus};
pub use operator::{CommandOutcome, OperatorCommand};
pub use plan::{FeedbackStep, PipelinePlan, PlanReport, PlanStep, StepOutcome};

use crate::agents::{StageAgent, TaskReport};
use crate::cache::ArtifactCache;
use crate::monitor::{EventKind, MonitorEvent, SharedSink};
use crate::task::{Fingerprint, StageKind, Task};
use monitor_loop::{CommandEnvelope, LoopStage, MonitorLoop, StageTokens};

/// Errors returned to callers of the supervisor.
///
/// A task that runs and fails is not an error here: it comes back as a
/// [`TaskReport`] with status `Failed`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SupervisorError {
    /// The stage is degraded or paused; the task was not assigned.
    #[error("Stage {stage} is {status}; task deferred")]
    StageUnavailable { stage: StageKind, status: StageStatus },

    #[error("No agent registered for stage {0}")]
    NoAgent(StageKind),

    /// An upstream task did not succeed.
    #[error("Upstream task {0} did not succeed")]
    DependencyFailed(Uuid),

    #[error("Upstream task {0} was never submitted")]
    UnknownDependency(Uuid),

    #[error("Supervisor is shut down")]
    ShutDown,

    #[error("Invalid plan: {0}")]
    Plan(String),
}

/// Supervisor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Concurrency ceiling for stages without an explicit entry.
    pub default_concurrency: usize,
    /// Per-stage concurrency ceilings.
    pub concurrency: BTreeMap<StageKind, usize>,
    pub thresholds: HealthThresholds,
    /// How often the monitoring loop scans for stale heartbeats.
    #[serde(with = "crate::cache::duration_millis")]
    pub monitor_interval: Duration,
    /// Capacity of the worker-to-loop signal channel.
    pub signal_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 4,
            concurrency: BTreeMap::new(),
            thresholds: HealthThresholds::default(),
            monitor_interval: Duration::from_secs(1),
            signal_buffer: 256,
        }
    }
}

impl SupervisorConfig {
    pub fn with_default_concurrency(mut self, limit: usize) -> Self {
        self.default_concurrency = limit;
        self
    }

    pub fn with_concurrency(mut self, stage: StageKind, limit: usize) -> Self {
        self.concurrency.insert(stage, limit);
        self
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Ceiling that applies to `stage` (never below 1).
    pub fn concurrency_for(&self, stage: StageKind) -> usize {
        self.concurrency
            .get(&stage)
            .copied()
            .unwrap_or(self.default_concurrency)
            .max(1)
    }
}

struct StageSlot {
    agent: Arc<StageAgent>,
    semaphore: Arc<Semaphore>,
}

/// Settled outcomes kept for dependency edges declared after the upstream
/// task finished.
const SETTLED_RETENTION: usize = 4096;

/// Completion registry for dependency edges.
///
/// A pending task has a watch channel (`None`, then whether it succeeded).
/// Once it settles the channel is dropped from the registry and only the
/// verdict is kept, oldest first out beyond [`SETTLED_RETENTION`].
#[derive(Default)]
struct Outcomes(Mutex<OutcomeTable>);

#[derive(Default)]
struct OutcomeTable {
    pending: HashMap<Uuid, watch::Sender<Option<bool>>>,
    settled: HashMap<Uuid, bool>,
    order: VecDeque<Uuid>,
}

/// What a dependent task waits on.
enum Upstream {
    Pending(watch::Receiver<Option<bool>>),
    Settled(bool),
}

impl Outcomes {
    fn register(&self, task_id: Uuid) {
        let mut table = self.0.lock().expect("outcome registry lock poisoned");
        if !table.settled.contains_key(&task_id) {
            table
                .pending
                .entry(task_id)
                .or_insert_with(|| watch::channel(None).0);
        }
    }

    fn subscribe(&self, task_id: Uuid) -> Option<Upstream> {
        let table = self.0.lock().expect("outcome registry lock poisoned");
        if let Some(sender) = table.pending.get(&task_id) {
            return Some(Upstream::Pending(sender.subscribe()));
        }
        table.settled.get(&task_id).map(|ok| Upstream::Settled(*ok))
    }

    /// Record the verdict, wake waiters and release the channel.
    fn settle(&self, task_id: Uuid, success: bool) {
        let mut table = self.0.lock().expect("outcome registry lock poisoned");
        if let Some(sender) = table.pending.remove(&task_id) {
            sender.send_replace(Some(success));
        }
        if table.settled.insert(task_id, success).is_none() {
            table.order.push_back(task_id);
        }
        while table.order.len() > SETTLED_RETENTION {
            if let Some(oldest) = table.order.pop_front() {
                table.settled.remove(&oldest);
            }
        }
    }

    /// Tasks registered but not yet settled.
    fn pending(&self) -> usize {
        self.0.lock().expect("outcome registry lock poisoned").pending.len()
    }

    #[cfg(test)]
    fn settled(&self) -> usize {
        self.0.lock().expect("outcome registry lock poisoned").settled.len()
    }
}

/// Assigns tasks to stage agents and keeps them healthy.
pub struct Supervisor {
    stages: HashMap<StageKind, StageSlot>,
    tokens: StageTokens,
    outcomes: Outcomes,
    signals: mpsc::Sender<HealthSignal>,
    commands: mpsc::Sender<CommandEnvelope>,
    snapshot: watch::Receiver<Vec<AgentHealth>>,
    cache: Arc<ArtifactCache>,
    sink: SharedSink,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Build a supervisor over `agents` and start its monitoring loop.
    ///
    /// Must be called from within a Tokio runtime. If two agents serve the
    /// same stage the later one wins.
    pub fn new(
        agents: Vec<StageAgent>,
        cache: Arc<ArtifactCache>,
        sink: SharedSink,
        config: SupervisorConfig,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(config.signal_buffer.max(1));
        let (command_tx, command_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());
        let tokens = StageTokens::default();

        let mut stages = HashMap::new();
        let mut loop_stages = HashMap::new();
        for agent in agents {
            let stage = agent.stage();
            let ceiling = config.concurrency_for(stage);
            let agent = Arc::new(agent.with_heartbeat(signal_tx.clone()));
            let semaphore = Arc::new(Semaphore::new(ceiling));
            loop_stages.insert(
                stage,
                LoopStage {
                    agent: agent.clone(),
                    semaphore: semaphore.clone(),
                    ceiling,
                },
            );
            if stages.insert(stage, StageSlot { agent, semaphore }).is_some() {
                warn!(stage = %stage, "Duplicate stage agent replaced");
            }
        }

        let shutdown = CancellationToken::new();
        let monitor = MonitorLoop::new(
            loop_stages,
            config.thresholds,
            config.monitor_interval,
            tokens.clone(),
            cache.clone(),
            sink.clone(),
            snapshot_tx,
        );
        let handle = tokio::spawn(monitor.run(signal_rx, command_rx, shutdown.clone()));
        info!(stages = stages.len(), "Supervisor started");

        Self {
            stages,
            tokens,
            outcomes: Outcomes::default(),
            signals: signal_tx,
            commands: command_tx,
            snapshot: snapshot_rx,
            cache,
            sink,
            shutdown,
            monitor: Mutex::new(Some(handle)),
        }
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    /// Submitted tasks whose outcome has not been recorded yet.
    pub fn pending_tasks(&self) -> usize {
        self.outcomes.pending()
    }

    pub fn stages(&self) -> Vec<StageKind> {
        let mut stages: Vec<StageKind> = self.stages.keys().copied().collect();
        stages.sort();
        stages
    }

    /// Run `task` once its dependencies have reported.
    ///
    /// # Errors
    ///
    /// Returns a [`SupervisorError`] when the task is not assigned: its stage
    /// is unavailable, an upstream task failed, or the supervisor stopped.
    pub async fn submit(&self, task: Task) -> Result<TaskReport, SupervisorError> {
        let task_id = task.id;
        self.outcomes.register(task_id);
        let result = self.dispatch(task).await;
        let success = matches!(&result, Ok(report) if report.is_success());
        self.outcomes.settle(task_id, success);
        if let Err(e) = &result {
            debug!(task_id = %task_id, error = %e, "Task not assigned");
        }
        result
    }

    /// Submit several tasks concurrently, honouring their dependency edges.
    ///
    /// Results come back in input order.
    pub async fn run_tasks(&self, tasks: Vec<Task>) -> Vec<Result<TaskReport, SupervisorError>> {
        for task in &tasks {
            self.outcomes.register(task.id);
        }
        join_all(tasks.into_iter().map(|task| self.submit(task))).await
    }

    async fn dispatch(&self, task: Task) -> Result<TaskReport, SupervisorError> {
        if self.shutdown.is_cancelled() {
            return Err(SupervisorError::ShutDown);
        }
        let slot = self
            .stages
            .get(&task.stage)
            .ok_or(SupervisorError::NoAgent(task.stage))?;

        for upstream in &task.depends_on {
            self.await_upstream(*upstream).await?;
        }

        self.ensure_available(&task)?;
        let _permit = slot
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SupervisorError::ShutDown)?;
        // The stage may have been degraded while this task queued.
        self.ensure_available(&task)?;

        let cancel = self.tokens.current(task.stage).child_token();
        self.sink.emit(&MonitorEvent::task(
            task.stage,
            task.id,
            EventKind::TaskAssigned,
            json!({
                "operation": task.operation,
                "fingerprint": task.fingerprint.as_str(),
                "depends_on": task.depends_on,
            }),
        ));

        let (stage, task_id) = (task.stage, task.id);
        self.signal(HealthSignal::Started { stage, task_id }).await;
        let report = slot.agent.run(task, cancel).await;
        self.signal(HealthSignal::Finished {
            stage,
            task_id,
            success: report.is_success(),
            reasons: report.failure_reasons(),
        })
        .await;
        Ok(report)
    }

    async fn await_upstream(&self, upstream: Uuid) -> Result<(), SupervisorError> {
        let waiting = self
            .outcomes
            .subscribe(upstream)
            .ok_or(SupervisorError::UnknownDependency(upstream))?;
        let succeeded = match waiting {
            Upstream::Settled(ok) => ok,
            Upstream::Pending(mut rx) => rx
                .wait_for(Option::is_some)
                .await
                .map(|value| *value == Some(true))
                .map_err(|_| SupervisorError::ShutDown)?,
        };
        if succeeded {
            Ok(())
        } else {
            Err(SupervisorError::DependencyFailed(upstream))
        }
    }

    fn ensure_available(&self, task: &Task) -> Result<(), SupervisorError> {
        let status = self.stage_status(task.stage).unwrap_or(StageStatus::Healthy);
        if status.accepts_work() {
            return Ok(());
        }
        self.sink.emit(&MonitorEvent::task(
            task.stage,
            task.id,
            EventKind::TaskDeferred,
            json!({"status": status.to_string()}),
        ));
        Err(SupervisorError::StageUnavailable {
            stage: task.stage,
            status,
        })
    }

    async fn signal(&self, signal: HealthSignal) {
        if self.signals.send(signal).await.is_err() {
            debug!("Monitoring loop gone; signal dropped");
        }
    }

    // =========================================================================
    // Operator surface
    // =========================================================================

    /// Send a command to the monitoring loop and wait for its answer.
    ///
    /// Health signals sent before the command are applied first.
    pub async fn command(&self, command: OperatorCommand) -> Result<CommandOutcome, SupervisorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send((command, reply_tx))
            .await
            .map_err(|_| SupervisorError::ShutDown)?;
        reply_rx.await.map_err(|_| SupervisorError::ShutDown)
    }

    pub async fn pause(&self, stage: StageKind) -> Result<CommandOutcome, SupervisorError> {
        self.command(OperatorCommand::Pause(stage)).await
    }

    pub async fn resume(&self, stage: StageKind) -> Result<CommandOutcome, SupervisorError> {
        self.command(OperatorCommand::Resume(stage)).await
    }

    pub async fn recover(&self, stage: StageKind) -> Result<CommandOutcome, SupervisorError> {
        self.command(OperatorCommand::Recover(stage)).await
    }

    pub async fn set_concurrency(
        &self,
        stage: StageKind,
        limit: usize,
    ) -> Result<CommandOutcome, SupervisorError> {
        self.command(OperatorCommand::SetConcurrency { stage, limit })
            .await
    }

    /// Change the retry budget of one stage, or all stages with `None`.
    pub async fn set_retry_budget(
        &self,
        stage: Option<StageKind>,
        budget: u32,
    ) -> Result<CommandOutcome, SupervisorError> {
        self.command(OperatorCommand::SetRetryBudget { stage, budget })
            .await
    }

    /// Force the next request for `fingerprint` to produce afresh.
    pub async fn invalidate(&self, fingerprint: Fingerprint) -> Result<bool, SupervisorError> {
        match self.command(OperatorCommand::Invalidate(fingerprint)).await? {
            CommandOutcome::Invalidated(removed) => Ok(removed),
            _ => Ok(false),
        }
    }

    /// Health of every stage, after all pending signals are applied.
    pub async fn status(&self) -> Result<Vec<AgentHealth>, SupervisorError> {
        match self.command(OperatorCommand::Status).await? {
            CommandOutcome::Status(health) => Ok(health),
            _ => Ok(self.snapshot()),
        }
    }

    /// Last published health snapshot, without waiting on the loop.
    pub fn snapshot(&self) -> Vec<AgentHealth> {
        self.snapshot.borrow().clone()
    }

    pub fn stage_status(&self, stage: StageKind) -> Option<StageStatus> {
        self.snapshot
            .borrow()
            .iter()
            .find(|h| h.stage == stage)
            .map(|h| h.status)
    }

    /// Watch health snapshots as the loop publishes them.
    pub fn subscribe(&self) -> watch::Receiver<Vec<AgentHealth>> {
        self.snapshot.clone()
    }

    /// Stop the monitoring loop and cancel every in-flight task.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self
            .monitor
            .lock()
            .expect("monitor handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Monitoring loop ended abnormally");
            }
        }
        info!("Supervisor stopped");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
