//! The hybrid execution state machine run by every stage.
//!
//! For one task an agent:
//! 1. checks the cache (re-validating a hit against the current input),
//! 2. takes the per-fingerprint production guard and checks again, adopting
//!    the failure of an identical task it waited behind,
//! 3. asks the selected backends for an artifact in fallback order,
//! 4. validates it statically and with a dry run,
//! 5. executes it and checks the output,
//! 6. caches the artifact and reports.
//!
//! Any failure in 3-5 moves on to the next backend until the retry budget
//! is spent. A deterministic backend is tried at most once per task and a
//! backend that reports itself unavailable is skipped for the rest of it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::AgentError;
use crate::artifact::{Artifact, BackendKind, Sources, ValidationState};
use crate::backend::{BackendRequest, BackendSelector, SharedBackend};
use crate::cache::{ArtifactCache, CacheEntry};
use crate::data::{load_dataset, Dataset, Schema};
use crate::error::{BackendError, ExecutionError};
use crate::executor::Executor;
use crate::monitor::{EventKind, MonitorEvent, SharedSink};
use crate::supervisor::HealthSignal;
use crate::task::{ExecutionResult, StageKind, Task, TaskStatus};
use crate::validation::{TaskContext, ValidationPhase, Validator};

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRY_BUDGET: u32 = 2;

/// Agent behavior knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Dry-run cached artifacts against the current input before reuse.
    pub revalidate_cached: bool,
    /// Deadline for a single backend call.
    #[serde(with = "crate::cache::duration_secs")]
    pub backend_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            revalidate_cached: true,
            backend_timeout: Duration::from_secs(90),
        }
    }
}

/// Where in the state machine an attempt stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStage {
    Produce,
    Validate,
    Execute,
    Output,
    Succeeded,
}

/// One backend attempt within a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub backend: BackendKind,
    pub reached: AttemptStage,
    /// Failure reason; `None` for the successful attempt.
    pub reason: Option<String>,
}

/// Terminal outcome of a task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// The task with its final status and retry count.
    pub task: Task,
    pub result: Option<ExecutionResult>,
    pub artifact: Option<Arc<Artifact>>,
    pub attempts: Vec<AttemptRecord>,
    pub error: Option<AgentError>,
    pub duration_ms: u64,
}

impl TaskReport {
    pub fn is_success(&self) -> bool {
        self.task.status.is_success()
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    /// Every failure reason recorded for the task, attempts first.
    pub fn failure_reasons(&self) -> Vec<String> {
        match &self.error {
            Some(err) => err.reasons(),
            None => Vec::new(),
        }
    }
}

/// Runs tasks for one stage.
pub struct StageAgent {
    stage: StageKind,
    cache: Arc<ArtifactCache>,
    selector: BackendSelector,
    validator: Arc<Validator>,
    executor: Arc<Executor>,
    sink: SharedSink,
    config: AgentConfig,
    retry_budget: AtomicU32,
    heartbeat: Option<mpsc::Sender<HealthSignal>>,
}

impl StageAgent {
    pub fn new(
        stage: StageKind,
        cache: Arc<ArtifactCache>,
        selector: BackendSelector,
        validator: Arc<Validator>,
        executor: Arc<Executor>,
        sink: SharedSink,
    ) -> Self {
        Self {
            stage,
            cache,
            selector,
            validator,
            executor,
            sink,
            config: AgentConfig::default(),
            retry_budget: AtomicU32::new(DEFAULT_RETRY_BUDGET),
            heartbeat: None,
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_budget(self, budget: u32) -> Self {
        self.retry_budget.store(budget, Ordering::SeqCst);
        self
    }

    /// Send liveness pings to a supervisor while tasks run.
    pub fn with_heartbeat(mut self, sender: mpsc::Sender<HealthSignal>) -> Self {
        self.heartbeat = Some(sender);
        self
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget.load(Ordering::SeqCst)
    }

    /// Change the budget for tasks that start after this call.
    pub fn set_retry_budget(&self, budget: u32) {
        self.retry_budget.store(budget, Ordering::SeqCst);
    }

    fn emit(&self, task: &Task, kind: EventKind, detail: serde_json::Value) {
        self.sink
            .emit(&MonitorEvent::task(self.stage, task.id, kind, detail));
    }

    fn beat(&self) {
        if let Some(sender) = &self.heartbeat {
            let _ = sender.try_send(HealthSignal::Heartbeat { stage: self.stage });
        }
    }

    /// Drive `task` to a terminal state.
    ///
    /// Never fails: every outcome, including cancellation, is a report.
    pub async fn run(&self, mut task: Task, cancel: CancellationToken) -> TaskReport {
        let started = Instant::now();
        task.status = TaskStatus::Running;
        info!(
            stage = %self.stage,
            task_id = %task.id,
            operation = %task.operation,
            fingerprint = %task.fingerprint.short(),
            "Task started"
        );

        let input = match load_dataset(self.executor.store().as_ref(), &task.input).await {
            Ok(data) => data,
            Err(e) => {
                return self.fail(task, AgentError::InputUnavailable(e.to_string()), Vec::new(), started)
            }
        };
        let schema = input.schema();
        self.beat();

        if let Some(entry) = self.check_cache(&task, &input, &schema, EventKind::CacheHit).await {
            return self.report_hit(task, entry, started);
        }

        let mut guard = self.cache.acquire_production(&task.fingerprint).await;
        if let Some(entry) = self.check_cache(&task, &input, &schema, EventKind::CacheJoined).await {
            return self.report_hit(task, entry, started);
        }
        if let Some(reasons) = guard.published_failure() {
            debug!(task_id = %task.id, "Adopting failure of concurrent producer");
            let err = AgentError::ProducerFailed {
                reasons: reasons.to_vec(),
            };
            return self.fail(task, err, Vec::new(), started);
        }
        self.emit(&task, EventKind::CacheMiss, json!({"fingerprint": task.fingerprint.as_str()}));

        let report = self
            .produce_and_execute(task, &input, &schema, cancel, started)
            .await;
        // A cancelled producer says nothing about the task itself.
        match &report.error {
            Some(AgentError::Cancelled) | None => {}
            Some(err) => guard.publish_failure(err.reasons()),
        }
        report
    }

    /// Cache lookup plus optional re-validation. A stale hit is invalidated
    /// and reported as a miss.
    async fn check_cache(
        &self,
        task: &Task,
        input: &Dataset,
        schema: &Schema,
        hit_kind: EventKind,
    ) -> Option<CacheEntry> {
        let entry = if hit_kind == EventKind::CacheJoined {
            self.cache.recheck(&task.fingerprint).await?
        } else {
            self.cache.lookup(&task.fingerprint).await?
        };
        if self.config.revalidate_cached {
            let sources = self.dry_run_sources(&entry.artifact, task).await;
            let ctx = TaskContext::for_task(task, schema)
                .with_sample(input)
                .with_sources(&sources);
            let verdict = self.validator.validate_artifact(&entry.artifact, &ctx);
            if !verdict.passed {
                self.cache.invalidate(&task.fingerprint).await;
                self.emit(task, EventKind::CacheStale, json!({"reason": verdict.reason()}));
                return None;
            }
        }
        self.emit(
            task,
            hit_kind,
            json!({"fingerprint": task.fingerprint.as_str(), "hit_count": entry.hit_count}),
        );
        Some(entry)
    }

    /// Merge sources for the dry run. A source that fails to load is left
    /// out here and reported by the execution itself.
    async fn dry_run_sources(&self, artifact: &Artifact, task: &Task) -> Sources {
        if artifact.program.merge_sources().is_empty() {
            return Sources::new();
        }
        match self.executor.load_sources(&artifact.program, &task.scope).await {
            Ok(sources) => sources,
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "Merge source unavailable for dry run");
                Sources::new()
            }
        }
    }

    fn report_hit(&self, mut task: Task, entry: CacheEntry, started: Instant) -> TaskReport {
        task.status = TaskStatus::CachedHit;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.emit(
            &task,
            EventKind::TaskCompleted,
            json!({"status": task.status.to_string(), "duration_ms": duration_ms, "backend": entry.artifact.source.to_string()}),
        );
        debug!(task_id = %task.id, "Served from cache");
        TaskReport {
            task,
            result: Some(entry.result),
            artifact: Some(entry.artifact),
            attempts: Vec::new(),
            error: None,
            duration_ms,
        }
    }

    /// Next usable candidate, starting at `from` and wrapping around.
    fn next_candidate(
        candidates: &[SharedBackend],
        excluded: &HashSet<usize>,
        from: usize,
    ) -> Option<usize> {
        let n = candidates.len();
        (0..n)
            .map(|offset| (from + offset) % n)
            .find(|idx| !excluded.contains(idx))
    }

    async fn produce_and_execute(
        &self,
        mut task: Task,
        input: &Dataset,
        schema: &Schema,
        cancel: CancellationToken,
        started: Instant,
    ) -> TaskReport {
        let candidates = self.selector.candidates(task.stage, &task.operation);
        if candidates.is_empty() {
            let err = AgentError::NoBackend {
                stage: task.stage,
                operation: task.operation.clone(),
            };
            return self.fail(task, err, Vec::new(), started);
        }

        let budget = self.retry_budget();
        let mut excluded: HashSet<usize> = HashSet::new();
        let mut reasons: Vec<String> = Vec::new();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut cursor = 0usize;

        while (attempts.len() as u32) <= budget {
            if cancel.is_cancelled() {
                return self.fail(task, AgentError::Cancelled, attempts, started);
            }
            let Some(idx) = Self::next_candidate(&candidates, &excluded, cursor) else {
                break;
            };
            let backend = &candidates[idx];
            if !attempts.is_empty() {
                task.retry_count += 1;
                self.emit(
                    &task,
                    EventKind::Fallback,
                    json!({"backend": backend.kind().to_string(), "retry_count": task.retry_count}),
                );
            }
            self.emit(&task, EventKind::BackendSelected, json!({"backend": backend.kind().to_string()}));
            self.beat();

            let outcome = self
                .attempt(&mut task, backend, input, schema, &reasons, &cancel)
                .await;
            match outcome {
                Attempt::Succeeded { artifact, result } => {
                    attempts.push(AttemptRecord {
                        backend: backend.kind(),
                        reached: AttemptStage::Succeeded,
                        reason: None,
                    });
                    return self.succeed(task, artifact, result, attempts, started).await;
                }
                Attempt::Cancelled => {
                    return self.fail(task, AgentError::Cancelled, attempts, started);
                }
                Attempt::Failed {
                    reached,
                    reason,
                    disable,
                } => {
                    let reason = format!("{}: {}", backend.kind(), reason);
                    warn!(
                        stage = %self.stage,
                        task_id = %task.id,
                        backend = %backend.kind(),
                        reached = ?reached,
                        reason = %reason,
                        "Attempt failed"
                    );
                    if disable || backend.is_deterministic() {
                        excluded.insert(idx);
                    }
                    attempts.push(AttemptRecord {
                        backend: backend.kind(),
                        reached,
                        reason: Some(reason.clone()),
                    });
                    reasons.push(reason);
                    cursor = idx + 1;
                }
            }
        }

        let err = AgentError::RetryBudgetExhausted {
            attempts: attempts.len() as u32,
            reasons,
        };
        self.fail(task, err, attempts, started)
    }

    /// One backend attempt: produce, validate, execute, check output.
    async fn attempt(
        &self,
        task: &mut Task,
        backend: &SharedBackend,
        input: &Dataset,
        schema: &Schema,
        prior_failures: &[String],
        cancel: &CancellationToken,
    ) -> Attempt {
        let kind = backend.kind().to_string();

        let request = BackendRequest::new(task, schema).with_prior_failures(prior_failures);
        let produced =
            tokio::time::timeout(self.config.backend_timeout, backend.produce(request, cancel.child_token()))
                .await
                .unwrap_or(Err(BackendError::Timeout(self.config.backend_timeout)));
        let mut artifact = match produced {
            Ok(artifact) => artifact,
            Err(BackendError::Cancelled) => return Attempt::Cancelled,
            Err(e) => {
                self.emit(task, EventKind::BackendFailed, json!({"backend": kind, "reason": e.to_string()}));
                return Attempt::Failed {
                    reached: AttemptStage::Produce,
                    reason: e.to_string(),
                    disable: e.disables_backend(),
                };
            }
        };
        self.emit(
            task,
            EventKind::ArtifactProduced,
            json!({"backend": kind, "artifact_id": artifact.id.to_string(), "steps": artifact.program.len()}),
        );

        let sources = self.dry_run_sources(&artifact, task).await;
        let ctx = TaskContext::for_task(task, schema)
            .with_sample(input)
            .with_sources(&sources);
        let verdict = self.validator.validate_artifact(&artifact, &ctx);
        let phase = verdict
            .failed_phase()
            .unwrap_or(ValidationPhase::Dynamic)
            .to_string();
        if !verdict.passed {
            artifact.mark(ValidationState::Invalid(verdict.reason()));
            self.emit(
                task,
                EventKind::ValidationFailed,
                json!({"backend": kind, "phase": phase, "reason": verdict.reason()}),
            );
            return Attempt::Failed {
                reached: AttemptStage::Validate,
                reason: format!("validation failed: {}", verdict.reason()),
                disable: false,
            };
        }
        artifact.mark(ValidationState::Valid);
        task.status = TaskStatus::Validated;
        self.emit(task, EventKind::ValidationPassed, json!({"backend": kind, "phase": "artifact"}));

        self.emit(task, EventKind::ExecutionStarted, json!({"backend": kind}));
        self.beat();
        let executed = match self
            .executor
            .execute(&artifact, &task.input, &task.scope, cancel)
            .await
        {
            Ok(out) => out,
            Err(ExecutionError::Cancelled) => return Attempt::Cancelled,
            Err(e) => {
                self.emit(task, EventKind::ExecutionFailed, json!({"backend": kind, "reason": e.to_string()}));
                return Attempt::Failed {
                    reached: AttemptStage::Execute,
                    reason: format!("execution failed: {}", e),
                    disable: false,
                };
            }
        };

        let verdict = if task.stage.is_report() {
            self.validator
                .validate_report(&executed.result, &executed.output, task.expected_schema.as_ref())
        } else {
            self.validator
                .validate_output(&executed.result, &executed.output, task.expected_schema.as_ref())
        };
        if !verdict.passed {
            self.emit(
                task,
                EventKind::ValidationFailed,
                json!({"backend": kind, "phase": "output", "reason": verdict.reason()}),
            );
            return Attempt::Failed {
                reached: AttemptStage::Output,
                reason: format!("output rejected: {}", verdict.reason()),
                disable: false,
            };
        }
        self.emit(task, EventKind::ValidationPassed, json!({"backend": kind, "phase": "output"}));
        self.emit(
            task,
            EventKind::ExecutionSucceeded,
            json!({
                "backend": kind,
                "duration_ms": executed.result.duration_ms,
                "quality": executed.result.quality.overall,
                "rows": executed.result.rows,
            }),
        );

        Attempt::Succeeded {
            artifact,
            result: executed.result,
        }
    }

    async fn succeed(
        &self,
        mut task: Task,
        artifact: Artifact,
        result: ExecutionResult,
        attempts: Vec<AttemptRecord>,
        started: Instant,
    ) -> TaskReport {
        let entry = self
            .cache
            .insert(task.fingerprint.clone(), artifact, result.clone())
            .await;
        task.status = TaskStatus::Executed;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.emit(
            &task,
            EventKind::TaskCompleted,
            json!({
                "status": task.status.to_string(),
                "duration_ms": duration_ms,
                "backend": entry.artifact.source.to_string(),
                "retry_count": task.retry_count,
                "output": result.output_ref.as_str(),
            }),
        );
        info!(
            stage = %self.stage,
            task_id = %task.id,
            backend = %entry.artifact.source,
            retries = task.retry_count,
            duration_ms,
            "Task executed"
        );
        TaskReport {
            task,
            result: Some(result),
            artifact: Some(entry.artifact),
            attempts,
            error: None,
            duration_ms,
        }
    }

    fn fail(
        &self,
        mut task: Task,
        error: AgentError,
        attempts: Vec<AttemptRecord>,
        started: Instant,
    ) -> TaskReport {
        task.status = TaskStatus::Failed;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.emit(
            &task,
            EventKind::TaskFailed,
            json!({
                "error": error.to_string(),
                "reasons": error.reasons(),
                "retry_count": task.retry_count,
                "duration_ms": duration_ms,
            }),
        );
        warn!(stage = %self.stage, task_id = %task.id, error = %error, "Task failed");
        TaskReport {
            task,
            result: None,
            artifact: None,
            attempts,
            error: Some(error),
            duration_ms,
        }
    }
}

/// Outcome of one backend attempt.
enum Attempt {
    Succeeded {
        artifact: Artifact,
        result: ExecutionResult,
    },
    Failed {
        reached: AttemptStage,
        reason: String,
        /// Skip this backend for the rest of the task.
        disable: bool,
    },
    Cancelled,
}
