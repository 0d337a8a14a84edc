//! The supervisor's monitoring loop.
//!
//! The loop is the sole owner of every [`AgentHealth`]. Workers report
//! through [`HealthSignal`]s and operators through [`OperatorCommand`]s;
//! signals are always drained before commands so a status query reflects
//! every report sent before it. A periodic tick scans for stale heartbeats.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::health::{AgentHealth, HealthSignal, HealthThresholds, StageStatus};
use super::operator::{CommandOutcome, OperatorCommand};
use crate::agents::StageAgent;
use crate::cache::ArtifactCache;
use crate::metrics::MetricsCollector;
use crate::monitor::{EventKind, MonitorEvent, SharedSink};
use crate::task::StageKind;

pub(crate) type CommandEnvelope = (OperatorCommand, oneshot::Sender<CommandOutcome>);

/// Per-stage cancellation tokens.
///
/// Degrading a stage cancels its token; recovering installs a fresh one so
/// tasks started afterwards are unaffected.
#[derive(Debug, Clone, Default)]
pub(crate) struct StageTokens(Arc<Mutex<HashMap<StageKind, CancellationToken>>>);

impl StageTokens {
    /// Token for tasks starting now on `stage`.
    pub fn current(&self, stage: StageKind) -> CancellationToken {
        let mut tokens = self.0.lock().expect("stage tokens lock poisoned");
        tokens.entry(stage).or_default().clone()
    }

    fn cancel(&self, stage: StageKind) {
        let tokens = self.0.lock().expect("stage tokens lock poisoned");
        if let Some(token) = tokens.get(&stage) {
            token.cancel();
        }
    }

    fn reset(&self, stage: StageKind) {
        let mut tokens = self.0.lock().expect("stage tokens lock poisoned");
        tokens.insert(stage, CancellationToken::new());
    }

    fn cancel_all(&self) {
        let tokens = self.0.lock().expect("stage tokens lock poisoned");
        for token in tokens.values() {
            token.cancel();
        }
    }
}

/// What the loop needs to steer one stage.
pub(crate) struct LoopStage {
    pub agent: Arc<StageAgent>,
    pub semaphore: Arc<Semaphore>,
    pub ceiling: usize,
}

pub(crate) struct MonitorLoop {
    health: BTreeMap<StageKind, AgentHealth>,
    stages: HashMap<StageKind, LoopStage>,
    thresholds: HealthThresholds,
    interval: Duration,
    tokens: StageTokens,
    cache: Arc<ArtifactCache>,
    sink: SharedSink,
    metrics: MetricsCollector,
    snapshot: watch::Sender<Vec<AgentHealth>>,
    stale_reported: HashSet<StageKind>,
}

impl MonitorLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stages: HashMap<StageKind, LoopStage>,
        thresholds: HealthThresholds,
        interval: Duration,
        tokens: StageTokens,
        cache: Arc<ArtifactCache>,
        sink: SharedSink,
        snapshot: watch::Sender<Vec<AgentHealth>>,
    ) -> Self {
        let health = stages
            .keys()
            .map(|stage| (*stage, AgentHealth::new(*stage)))
            .collect();
        let this = Self {
            health,
            stages,
            thresholds,
            interval,
            tokens,
            cache,
            sink,
            metrics: MetricsCollector::new(),
            snapshot,
            stale_reported: HashSet::new(),
        };
        this.publish();
        this
    }

    /// Process signals and commands until `shutdown` fires.
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<HealthSignal>,
        mut commands: mpsc::Receiver<CommandEnvelope>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(stages = self.stages.len(), "Monitoring loop started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(signal) = signals.recv() => {
                    self.handle_signal(signal, Utc::now());
                }
                Some((command, reply)) = commands.recv() => {
                    let outcome = self.handle_command(command).await;
                    let _ = reply.send(outcome);
                }
                _ = ticker.tick() => self.scan_stale(Utc::now()),
            }
        }

        self.tokens.cancel_all();
        debug!("Monitoring loop stopped");
    }

    fn publish(&self) {
        self.snapshot
            .send_replace(self.health.values().cloned().collect());
    }

    fn emit(&self, stage: StageKind, kind: EventKind, detail: serde_json::Value) {
        self.sink.emit(&MonitorEvent::stage(stage, kind, detail));
    }

    pub(crate) fn handle_signal(&mut self, signal: HealthSignal, now: DateTime<Utc>) {
        let stage = signal.stage();
        let Some(health) = self.health.get_mut(&stage) else {
            debug!(stage = %stage, "Signal for unsupervised stage ignored");
            return;
        };

        match signal {
            HealthSignal::Started { .. } => {
                health.record_start(now);
                self.metrics.set_running_tasks(stage.as_str(), health.running);
            }
            HealthSignal::Heartbeat { .. } => {
                health.record_heartbeat(now);
                self.stale_reported.remove(&stage);
            }
            HealthSignal::Finished {
                task_id,
                success,
                reasons,
                ..
            } => {
                let degraded = health.record_finish(success, now, &self.thresholds);
                self.metrics.set_running_tasks(stage.as_str(), health.running);
                self.stale_reported.remove(&stage);
                if let Some(reason) = degraded {
                    let detail = json!({
                        "reason": reason,
                        "task_id": task_id,
                        "last_failure_reasons": reasons,
                        "failure_rate": health.failure_rate(),
                        "consecutive_failures": health.consecutive_failures,
                    });
                    warn!(stage = %stage, reason = %reason, "Stage degraded; cancelling in-flight tasks");
                    self.tokens.cancel(stage);
                    self.emit(stage, EventKind::StageDegraded, detail);
                }
            }
        }
        self.publish();
    }

    fn scan_stale(&mut self, now: DateTime<Utc>) {
        let timeout = self.thresholds.heartbeat_timeout;
        let stale: Vec<(StageKind, usize)> = self
            .health
            .values()
            .filter(|h| h.is_stale(now, timeout) && !self.stale_reported.contains(&h.stage))
            .map(|h| (h.stage, h.running))
            .collect();

        for (stage, running) in stale {
            warn!(stage = %stage, running, timeout = ?timeout, "Heartbeat stale");
            self.stale_reported.insert(stage);
            self.emit(
                stage,
                EventKind::HeartbeatStale,
                json!({"running": running, "timeout_secs": timeout.as_secs()}),
            );
        }
    }

    pub(crate) async fn handle_command(&mut self, command: OperatorCommand) -> CommandOutcome {
        debug!(command = command.name(), "Operator command");
        let outcome = match command {
            OperatorCommand::Pause(stage) => self.transition(stage, StageStatus::Stopped),
            OperatorCommand::Resume(stage) => self.transition(stage, StageStatus::Healthy),
            OperatorCommand::Recover(stage) => self.recover(stage),
            OperatorCommand::SetConcurrency { stage, limit } => self.set_concurrency(stage, limit),
            OperatorCommand::SetRetryBudget { stage, budget } => {
                self.set_retry_budget(stage, budget)
            }
            OperatorCommand::Invalidate(fingerprint) => {
                let removed = self.cache.invalidate(&fingerprint).await;
                self.sink.emit(&MonitorEvent::new(
                    EventKind::CacheInvalidated,
                    json!({"fingerprint": fingerprint.as_str(), "removed": removed}),
                ));
                CommandOutcome::Invalidated(removed)
            }
            OperatorCommand::Status => {
                CommandOutcome::Status(self.health.values().cloned().collect())
            }
        };
        self.publish();
        outcome
    }

    /// Pause (`Stopped`) or resume (`Healthy`) a stage.
    fn transition(&mut self, stage: StageKind, target: StageStatus) -> CommandOutcome {
        let Some(health) = self.health.get_mut(&stage) else {
            return unknown(stage);
        };
        match (health.status, target) {
            (current, target) if current == target => CommandOutcome::Ack,
            (StageStatus::Degraded, _) => {
                CommandOutcome::Rejected(format!("stage {} is degraded; recover it first", stage))
            }
            (_, StageStatus::Stopped) => {
                health.status = StageStatus::Stopped;
                info!(stage = %stage, "Stage paused");
                self.emit(stage, EventKind::StagePaused, json!({}));
                CommandOutcome::Ack
            }
            _ => {
                health.status = StageStatus::Healthy;
                info!(stage = %stage, "Stage resumed");
                self.emit(stage, EventKind::StageResumed, json!({}));
                CommandOutcome::Ack
            }
        }
    }

    fn recover(&mut self, stage: StageKind) -> CommandOutcome {
        let Some(health) = self.health.get_mut(&stage) else {
            return unknown(stage);
        };
        match health.status {
            StageStatus::Healthy => CommandOutcome::Ack,
            StageStatus::Stopped => {
                CommandOutcome::Rejected(format!("stage {} is paused; resume it instead", stage))
            }
            StageStatus::Degraded => {
                let reason = health.degraded_reason.clone();
                health.recover();
                self.tokens.reset(stage);
                info!(stage = %stage, "Stage recovered by operator");
                self.emit(stage, EventKind::StageRecovered, json!({"previous_reason": reason}));
                CommandOutcome::Ack
            }
        }
    }

    fn set_concurrency(&mut self, stage: StageKind, limit: usize) -> CommandOutcome {
        if limit == 0 {
            return CommandOutcome::Rejected("concurrency ceiling must be at least 1".to_string());
        }
        let Some(slot) = self.stages.get_mut(&stage) else {
            return unknown(stage);
        };
        let previous = slot.ceiling;
        resize(slot, limit);
        info!(stage = %stage, previous, limit, "Concurrency ceiling changed");
        self.emit(
            stage,
            EventKind::ConcurrencyChanged,
            json!({"previous": previous, "limit": limit}),
        );
        CommandOutcome::Ack
    }

    fn set_retry_budget(&mut self, stage: Option<StageKind>, budget: u32) -> CommandOutcome {
        let targets: Vec<StageKind> = match stage {
            Some(stage) if !self.stages.contains_key(&stage) => return unknown(stage),
            Some(stage) => vec![stage],
            None => self.stages.keys().copied().collect(),
        };
        for stage in targets {
            if let Some(slot) = self.stages.get(&stage) {
                let previous = slot.agent.retry_budget();
                slot.agent.set_retry_budget(budget);
                self.emit(
                    stage,
                    EventKind::RetryBudgetChanged,
                    json!({"previous": previous, "budget": budget}),
                );
            }
        }
        CommandOutcome::Ack
    }
}

fn unknown(stage: StageKind) -> CommandOutcome {
    CommandOutcome::Rejected(format!("stage {} is not supervised", stage))
}

/// Move a stage's semaphore to a new ceiling.
///
/// Permits held by running tasks cannot be revoked, so a shrink that finds
/// too few idle permits retires the rest as they are released.
fn resize(slot: &mut LoopStage, limit: usize) {
    if limit > slot.ceiling {
        slot.semaphore.add_permits(limit - slot.ceiling);
    } else if limit < slot.ceiling {
        let excess = slot.ceiling - limit;
        let outstanding = excess - slot.semaphore.forget_permits(excess);
        if outstanding > 0 {
            let semaphore = slot.semaphore.clone();
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(outstanding as u32).await {
                    permits.forget();
                }
            });
        }
    }
    slot.ceiling = limit;
}
