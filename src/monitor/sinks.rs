//! Concrete monitoring sinks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::{EventKind, MonitorEvent, MonitorSink, SharedSink};
use crate::metrics::MetricsCollector;

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MonitorSink for TracingSink {
    fn emit(&self, event: &MonitorEvent) {
        let stage = event.stage.map(|s| s.as_str()).unwrap_or("-");
        let task = event
            .task_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        if event.kind.is_warning() {
            warn!(stage, task_id = %task, kind = %event.kind, detail = %event.detail, "Engine event");
        } else if event.task_id.is_none() {
            info!(stage, kind = %event.kind, detail = %event.detail, "Engine event");
        } else {
            debug!(stage, task_id = %task, kind = %event.kind, detail = %event.detail, "Engine event");
        }
    }
}

/// Forwards events to a bounded channel. Events are dropped when the channel
/// is full or closed.
pub struct ChannelSink {
    sender: mpsc::Sender<MonitorEvent>,
    dropped: AtomicU64,
    metrics: MetricsCollector,
}

impl ChannelSink {
    /// Create a sink and the receiving half of its channel.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }

    pub fn new(sender: mpsc::Sender<MonitorEvent>) -> Self {
        Self {
            sender,
            dropped: AtomicU64::new(0),
            metrics: MetricsCollector::new(),
        }
    }

    /// Number of events that could not be delivered.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MonitorSink for ChannelSink {
    fn emit(&self, event: &MonitorEvent) {
        match self.sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_dropped_event();
            }
        }
    }
}

/// Translates events into Prometheus metrics.
#[derive(Debug, Default, Clone)]
pub struct MetricsSink {
    collector: MetricsCollector,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }
}

fn seconds(event: &MonitorEvent) -> Option<f64> {
    event
        .detail
        .get("duration_ms")
        .and_then(|v| v.as_f64())
        .map(|ms| ms / 1000.0)
}

impl MonitorSink for MetricsSink {
    fn emit(&self, event: &MonitorEvent) {
        let stage = event.stage.map(|s| s.as_str()).unwrap_or("unknown");
        match event.kind {
            EventKind::CacheHit => self.collector.record_cache_lookup("hit"),
            EventKind::CacheMiss => self.collector.record_cache_lookup("miss"),
            EventKind::CacheJoined => self.collector.record_cache_lookup("join"),
            EventKind::ArtifactProduced => self
                .collector
                .record_backend(event.detail_str("backend").unwrap_or("unknown"), true),
            EventKind::BackendFailed => self
                .collector
                .record_backend(event.detail_str("backend").unwrap_or("unknown"), false),
            EventKind::ValidationPassed => self
                .collector
                .record_validation(event.detail_str("phase").unwrap_or("unknown"), true),
            EventKind::ValidationFailed => self
                .collector
                .record_validation(event.detail_str("phase").unwrap_or("unknown"), false),
            EventKind::ExecutionSucceeded => {
                let quality = event.detail.get("quality").and_then(|v| v.as_f64());
                self.collector
                    .record_execution(seconds(event).unwrap_or(0.0), quality);
            }
            EventKind::TaskCompleted => self.collector.record_task(
                stage,
                event.detail_str("status").unwrap_or("executed"),
                seconds(event).unwrap_or(0.0),
            ),
            EventKind::TaskFailed => {
                self.collector
                    .record_task(stage, "failed", seconds(event).unwrap_or(0.0))
            }
            EventKind::StageDegraded => self.collector.set_stage_status(stage, 1.0),
            EventKind::StagePaused => self.collector.set_stage_status(stage, 2.0),
            EventKind::StageRecovered | EventKind::StageResumed => {
                self.collector.set_stage_status(stage, 0.0)
            }
            _ => {}
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MonitorEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().expect("recording lock poisoned").clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events
            .lock()
            .expect("recording lock poisoned")
            .iter()
            .map(|e| e.kind)
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .expect("recording lock poisoned")
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("recording lock poisoned").clear();
    }
}

impl MonitorSink for RecordingSink {
    fn emit(&self, event: &MonitorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Broadcasts every event to each inner sink.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MonitorSink for FanoutSink {
    fn emit(&self, event: &MonitorEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
