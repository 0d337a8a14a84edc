//! Monitoring sink: structured, best-effort event delivery.
//!
//! Every state transition in the engine becomes a [`MonitorEvent`]. Sinks
//! must never block the pipeline; a sink that cannot accept an event drops
//! it.
//!
//! Available sinks:
//! - [`TracingSink`]: logs each event through `tracing`
//! - [`ChannelSink`]: forwards to a bounded `mpsc` channel, dropping when full
//! - [`MetricsSink`]: updates the Prometheus metrics
//! - [`RecordingSink`]: keeps events in memory (tests, CLI summaries)
//! - [`FanoutSink`]: broadcasts to several sinks

pub mod sinks;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::task::StageKind;

pub use sinks::{ChannelSink, FanoutSink, MetricsSink, RecordingSink, TracingSink};

/// Kind of an engine event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskAssigned,
    TaskDeferred,
    CacheHit,
    CacheMiss,
    CacheJoined,
    CacheStale,
    BackendSelected,
    BackendFailed,
    ArtifactProduced,
    ValidationPassed,
    ValidationFailed,
    ExecutionStarted,
    ExecutionSucceeded,
    ExecutionFailed,
    Fallback,
    TaskCompleted,
    TaskFailed,
    StageDegraded,
    StageRecovered,
    StagePaused,
    StageResumed,
    HeartbeatStale,
    CacheInvalidated,
    ConcurrencyChanged,
    RetryBudgetChanged,
    FeedbackTriggered,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskAssigned => "task_assigned",
            EventKind::TaskDeferred => "task_deferred",
            EventKind::CacheHit => "cache_hit",
            EventKind::CacheMiss => "cache_miss",
            EventKind::CacheJoined => "cache_joined",
            EventKind::CacheStale => "cache_stale",
            EventKind::BackendSelected => "backend_selected",
            EventKind::BackendFailed => "backend_failed",
            EventKind::ArtifactProduced => "artifact_produced",
            EventKind::ValidationPassed => "validation_passed",
            EventKind::ValidationFailed => "validation_failed",
            EventKind::ExecutionStarted => "execution_started",
            EventKind::ExecutionSucceeded => "execution_succeeded",
            EventKind::ExecutionFailed => "execution_failed",
            EventKind::Fallback => "fallback",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::StageDegraded => "stage_degraded",
            EventKind::StageRecovered => "stage_recovered",
            EventKind::StagePaused => "stage_paused",
            EventKind::StageResumed => "stage_resumed",
            EventKind::HeartbeatStale => "heartbeat_stale",
            EventKind::CacheInvalidated => "cache_invalidated",
            EventKind::ConcurrencyChanged => "concurrency_changed",
            EventKind::RetryBudgetChanged => "retry_budget_changed",
            EventKind::FeedbackTriggered => "feedback_triggered",
        }
    }

    /// Whether the event signals something an operator should look at.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            EventKind::BackendFailed
                | EventKind::ValidationFailed
                | EventKind::ExecutionFailed
                | EventKind::TaskFailed
                | EventKind::StageDegraded
                | EventKind::HeartbeatStale
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One structured monitoring event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub timestamp: DateTime<Utc>,
    pub stage: Option<StageKind>,
    pub task_id: Option<Uuid>,
    pub kind: EventKind,
    pub detail: Value,
}

impl MonitorEvent {
    pub fn new(kind: EventKind, detail: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            stage: None,
            task_id: None,
            kind,
            detail,
        }
    }

    /// Event about a single task.
    pub fn task(stage: StageKind, task_id: Uuid, kind: EventKind, detail: Value) -> Self {
        Self {
            stage: Some(stage),
            task_id: Some(task_id),
            ..Self::new(kind, detail)
        }
    }

    /// Event about a whole stage.
    pub fn stage(stage: StageKind, kind: EventKind, detail: Value) -> Self {
        Self {
            stage: Some(stage),
            ..Self::new(kind, detail)
        }
    }

    /// String field from `detail`, if present.
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.detail.get(key).and_then(Value::as_str)
    }
}

/// Receiver of monitoring events.
///
/// `emit` must return promptly and must not fail: delivery is best effort.
pub trait MonitorSink: Send + Sync {
    fn emit(&self, event: &MonitorEvent);
}

pub type SharedSink = Arc<dyn MonitorSink>;

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MonitorSink for NullSink {
    fn emit(&self, _event: &MonitorEvent) {}
}
