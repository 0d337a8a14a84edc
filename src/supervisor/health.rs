//! Per-stage health tracking.
//!
//! [`AgentHealth`] is plain data. Only the supervisor's monitoring loop
//! mutates it, in response to [`HealthSignal`]s and operator commands.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::duration_secs;
use crate::task::StageKind;

/// Operator-visible status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Healthy,
    /// Failing too often; no new work until an operator recovers it.
    Degraded,
    /// Paused by an operator.
    Stopped,
}

impl StageStatus {
    /// Gauge value exported to Prometheus.
    pub fn code(&self) -> f64 {
        match self {
            StageStatus::Healthy => 0.0,
            StageStatus::Degraded => 1.0,
            StageStatus::Stopped => 2.0,
        }
    }

    pub fn accepts_work(&self) -> bool {
        *self == StageStatus::Healthy
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Healthy => write!(f, "healthy"),
            StageStatus::Degraded => write!(f, "degraded"),
            StageStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Reports sent from workers to the monitoring loop.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthSignal {
    Started {
        stage: StageKind,
        task_id: Uuid,
    },
    /// Liveness ping from a running task.
    Heartbeat { stage: StageKind },
    Finished {
        stage: StageKind,
        task_id: Uuid,
        success: bool,
        reasons: Vec<String>,
    },
}

impl HealthSignal {
    pub fn stage(&self) -> StageKind {
        match self {
            HealthSignal::Started { stage, .. }
            | HealthSignal::Heartbeat { stage }
            | HealthSignal::Finished { stage, .. } => *stage,
        }
    }
}

/// When a stage counts as degraded or stale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Number of recent outcomes kept for the failure rate.
    pub window: usize,
    pub max_consecutive_failures: u32,
    pub max_failure_rate: f64,
    /// Outcomes required before the failure rate is trusted.
    pub min_samples: usize,
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            window: 20,
            max_consecutive_failures: 3,
            max_failure_rate: 0.5,
            min_samples: 6,
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

/// Health of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub stage: StageKind,
    pub status: StageStatus,
    pub running: usize,
    pub consecutive_failures: u32,
    pub completed: u64,
    pub failed: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Why the stage was degraded, while it is.
    pub degraded_reason: Option<String>,
    #[serde(skip)]
    recent: VecDeque<bool>,
}

impl AgentHealth {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            status: StageStatus::Healthy,
            running: 0,
            consecutive_failures: 0,
            completed: 0,
            failed: 0,
            last_heartbeat: None,
            degraded_reason: None,
            recent: VecDeque::new(),
        }
    }

    /// Failure ratio over the sliding window (0.0 when empty).
    pub fn failure_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failures = self.recent.iter().filter(|ok| !**ok).count();
        failures as f64 / self.recent.len() as f64
    }

    pub fn record_start(&mut self, now: DateTime<Utc>) {
        self.running += 1;
        self.last_heartbeat = Some(now);
    }

    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = Some(now);
    }

    /// Record a finished task.
    ///
    /// Returns the degradation reason when this outcome tips a healthy stage
    /// into `Degraded`.
    pub fn record_finish(
        &mut self,
        success: bool,
        now: DateTime<Utc>,
        thresholds: &HealthThresholds,
    ) -> Option<String> {
        self.running = self.running.saturating_sub(1);
        self.last_heartbeat = Some(now);
        self.recent.push_back(success);
        while self.recent.len() > thresholds.window.max(1) {
            self.recent.pop_front();
        }

        if success {
            self.completed += 1;
            self.consecutive_failures = 0;
            return None;
        }
        self.failed += 1;
        self.consecutive_failures += 1;

        if self.status != StageStatus::Healthy {
            return None;
        }
        let reason = if self.consecutive_failures >= thresholds.max_consecutive_failures {
            Some(format!("{} consecutive failures", self.consecutive_failures))
        } else if self.recent.len() >= thresholds.min_samples
            && self.failure_rate() > thresholds.max_failure_rate
        {
            Some(format!(
                "failure rate {:.0}% over the last {} tasks",
                self.failure_rate() * 100.0,
                self.recent.len()
            ))
        } else {
            None
        };
        if let Some(reason) = &reason {
            self.status = StageStatus::Degraded;
            self.degraded_reason = Some(reason.clone());
        }
        reason
    }

    /// Whether running tasks have been silent for longer than `timeout`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.running == 0 {
            return false;
        }
        match self.last_heartbeat {
            Some(at) => crate::cache::clock::elapsed_between(at, now) > timeout,
            None => true,
        }
    }

    /// Clear failure history and return to `Healthy`.
    pub fn recover(&mut self) {
        self.status = StageStatus::Healthy;
        self.consecutive_failures = 0;
        self.degraded_reason = None;
        self.recent.clear();
    }
}
