//! Custom metric collectors for sciforge operations.
//!
//! The `MetricsCollector` struct wraps the raw Prometheus metrics and provides
//! convenient methods with consistent labels. Every method is a no-op until
//! `init_metrics()` has run.

use super::prometheus::{
    BACKEND_INVOCATIONS, CACHE_LOOKUPS, EVENTS_DROPPED, EXECUTION_DURATION, LLM_LATENCY,
    LLM_REQUESTS_TOTAL, LLM_TOKENS_TOTAL, QUALITY_SCORE, RUNNING_TASKS, STAGE_STATUS, TASKS_TOTAL,
    TASK_DURATION, VALIDATION_VERDICTS,
};

/// Token usage information for LLM requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    /// Number of input/prompt tokens.
    pub input_tokens: u64,
    /// Number of output/completion tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Get the total number of tokens (input + output).
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Metrics collector for recording sciforge operational metrics.
///
/// # Example
///
/// ```ignore
/// use sciforge::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_task("cleaning", "executed", 0.42);
/// collector.record_cache_lookup("hit");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a task reaching a terminal state.
    ///
    /// # Arguments
    ///
    /// * `stage` - Stage name (e.g., "cleaning")
    /// * `outcome` - Terminal status (e.g., "executed", "cached_hit", "failed")
    /// * `duration_secs` - Wall time from assignment to terminal state
    pub fn record_task(&self, stage: &str, outcome: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[stage, outcome]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[stage])
                .observe(duration_secs);
        }

        tracing::trace!(
            stage = stage,
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Record a cache lookup result ("hit", "miss" or "join").
    pub fn record_cache_lookup(&self, result: &str) {
        if let Some(lookups) = CACHE_LOOKUPS.get() {
            lookups.with_label_values(&[result]).inc();
        }
    }

    /// Record a backend invocation.
    pub fn record_backend(&self, backend: &str, success: bool) {
        let outcome = if success { "produced" } else { "failed" };
        if let Some(invocations) = BACKEND_INVOCATIONS.get() {
            invocations.with_label_values(&[backend, outcome]).inc();
        }
    }

    /// Record a validation verdict.
    ///
    /// # Arguments
    ///
    /// * `phase` - "static", "dynamic" or "output"
    /// * `passed` - Whether the check passed
    pub fn record_validation(&self, phase: &str, passed: bool) {
        let verdict = if passed { "valid" } else { "invalid" };
        if let Some(verdicts) = VALIDATION_VERDICTS.get() {
            verdicts.with_label_values(&[phase, verdict]).inc();
        }
    }

    /// Record a finished execution and the quality of its output.
    pub fn record_execution(&self, duration_secs: f64, quality: Option<f64>) {
        if let Some(hist) = EXECUTION_DURATION.get() {
            hist.observe(duration_secs);
        }
        if let (Some(hist), Some(score)) = (QUALITY_SCORE.get(), quality) {
            hist.observe(score);
        }
    }

    /// Record an LLM API request.
    pub fn record_llm_request(&self, model: &str, success: bool, latency_secs: f64, tokens: TokenUsage) {
        let status = if success { "success" } else { "failure" };

        if let Some(llm_requests) = LLM_REQUESTS_TOTAL.get() {
            llm_requests.with_label_values(&[model, status]).inc();
        }

        if let Some(llm_latency) = LLM_LATENCY.get() {
            llm_latency
                .with_label_values(&[model])
                .observe(latency_secs);
        }

        if let Some(llm_tokens) = LLM_TOKENS_TOTAL.get() {
            llm_tokens
                .with_label_values(&[model, "input"])
                .inc_by(tokens.input_tokens as f64);
            llm_tokens
                .with_label_values(&[model, "output"])
                .inc_by(tokens.output_tokens as f64);
        }

        tracing::trace!(
            model = model,
            success = success,
            latency_secs = latency_secs,
            total_tokens = tokens.total(),
            "Recorded LLM request metric"
        );
    }

    /// Set the status gauge for a stage (0 healthy, 1 degraded, 2 stopped).
    pub fn set_stage_status(&self, stage: &str, code: f64) {
        if let Some(gauge) = STAGE_STATUS.get() {
            gauge.with_label_values(&[stage]).set(code);
        }
    }

    pub fn set_running_tasks(&self, stage: &str, running: usize) {
        if let Some(gauge) = RUNNING_TASKS.get() {
            gauge.with_label_values(&[stage]).set(running as f64);
        }
    }

    pub fn record_dropped_event(&self) {
        if let Some(counter) = EVENTS_DROPPED.get() {
            counter.inc();
        }
    }
}
