//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by sciforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all sciforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks reaching a terminal state, labeled by stage and outcome.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// End-to-end task duration in seconds, labeled by stage.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Artifact cache lookups, labeled by result (hit/miss/join).
pub static CACHE_LOOKUPS: OnceLock<CounterVec> = OnceLock::new();

/// Backend invocations, labeled by backend and outcome.
pub static BACKEND_INVOCATIONS: OnceLock<CounterVec> = OnceLock::new();

/// Validation verdicts, labeled by phase and verdict.
pub static VALIDATION_VERDICTS: OnceLock<CounterVec> = OnceLock::new();

/// Artifact execution duration in seconds.
pub static EXECUTION_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Overall quality score of executed outputs.
pub static QUALITY_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Total LLM API requests, labeled by model and status.
pub static LLM_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// LLM API request latency in seconds, labeled by model.
pub static LLM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Total tokens used, labeled by model and type (input/output).
pub static LLM_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage status: 0 healthy, 1 degraded, 2 stopped.
pub static STAGE_STATUS: OnceLock<GaugeVec> = OnceLock::new();

/// Tasks currently running, labeled by stage.
pub static RUNNING_TASKS: OnceLock<GaugeVec> = OnceLock::new();

/// Monitoring events dropped because a sink was full.
pub static EVENTS_DROPPED: OnceLock<Counter> = OnceLock::new();

/// Serializes `init_metrics` so the statics always come from one registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup; later calls are harmless no-ops for the statics.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _init = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("sciforge_tasks_total", "Tasks reaching a terminal state"),
        &["stage", "outcome"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "sciforge_task_duration_seconds",
            "End-to-end task duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["stage"],
    )?;

    let cache_lookups = CounterVec::new(
        Opts::new("sciforge_cache_lookups_total", "Artifact cache lookups"),
        &["result"],
    )?;

    let backend_invocations = CounterVec::new(
        Opts::new("sciforge_backend_invocations_total", "Capability backend invocations"),
        &["backend", "outcome"],
    )?;

    let validation_verdicts = CounterVec::new(
        Opts::new("sciforge_validation_verdicts_total", "Validation verdicts"),
        &["phase", "verdict"],
    )?;

    let execution_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "sciforge_execution_duration_seconds",
            "Artifact execution duration in seconds",
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )?;

    let quality_score = Histogram::with_opts(
        prometheus::HistogramOpts::new("sciforge_quality_score", "Distribution of output quality scores")
            .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
    )?;

    let llm_requests_total = CounterVec::new(
        Opts::new("sciforge_llm_requests_total", "Total LLM API requests"),
        &["model", "status"],
    )?;

    let llm_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "sciforge_llm_latency_seconds",
            "LLM API request latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["model"],
    )?;

    let llm_tokens_total = CounterVec::new(
        Opts::new("sciforge_llm_tokens_total", "Total tokens used"),
        &["model", "type"],
    )?;

    let stage_status = GaugeVec::new(
        Opts::new("sciforge_stage_status", "Stage status (0 healthy, 1 degraded, 2 stopped)"),
        &["stage"],
    )?;

    let running_tasks = GaugeVec::new(
        Opts::new("sciforge_running_tasks", "Tasks currently running"),
        &["stage"],
    )?;

    let events_dropped = Counter::new(
        "sciforge_monitor_events_dropped_total",
        "Monitoring events dropped because a sink was full",
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(cache_lookups.clone()))?;
    registry.register(Box::new(backend_invocations.clone()))?;
    registry.register(Box::new(validation_verdicts.clone()))?;
    registry.register(Box::new(execution_duration.clone()))?;
    registry.register(Box::new(quality_score.clone()))?;
    registry.register(Box::new(llm_requests_total.clone()))?;
    registry.register(Box::new(llm_latency.clone()))?;
    registry.register(Box::new(llm_tokens_total.clone()))?;
    registry.register(Box::new(stage_status.clone()))?;
    registry.register(Box::new(running_tasks.clone()))?;
    registry.register(Box::new(events_dropped.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = CACHE_LOOKUPS.set(cache_lookups);
    let _ = BACKEND_INVOCATIONS.set(backend_invocations);
    let _ = VALIDATION_VERDICTS.set(validation_verdicts);
    let _ = EXECUTION_DURATION.set(execution_duration);
    let _ = QUALITY_SCORE.set(quality_score);
    let _ = LLM_REQUESTS_TOTAL.set(llm_requests_total);
    let _ = LLM_LATENCY.set(llm_latency);
    let _ = LLM_TOKENS_TOTAL.set(llm_tokens_total);
    let _ = STAGE_STATUS.set(stage_status);
    let _ = RUNNING_TASKS.set(running_tasks);
    let _ = EVENTS_DROPPED.set(events_dropped);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem instead.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(tasks) = TASKS_TOTAL.get() {
            tasks.with_label_values(&["cleaning", "executed"]).inc();
        }
        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("sciforge_tasks_total"));
    }
}
