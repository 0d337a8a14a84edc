//! Isolated artifact execution.
//!
//! The executor loads the input from the blob store, runs the program on a
//! blocking worker thread over its own copy of the data, and writes the
//! output back under a fresh reference. A deadline, a memory ceiling and a
//! row ceiling bound every run; timeouts and cancellation raise a flag the
//! interpreter checks between steps, and panics are reported as failures.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::artifact::{run_program, Artifact, RunControl, Sources, TransformProgram};
use crate::data::{load_dataset, save_dataset, DataRef, Dataset, QualityMetrics, SharedBlobStore};
use crate::error::ExecutionError;
use crate::task::{ExecutionResult, IoScope};

/// Resource ceilings for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    #[serde(with = "crate::cache::duration_secs")]
    pub timeout: Duration,
    /// Ceiling on the estimated in-memory size of the working dataset.
    pub max_bytes: usize,
    pub max_rows: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_bytes: 256 * 1024 * 1024,
            max_rows: 1_000_000,
        }
    }
}

impl ResourceLimits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }
}

/// A successful execution: the summary plus the output itself.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub result: ExecutionResult,
    pub output: Dataset,
}

/// Runs artifacts against stored data.
pub struct Executor {
    store: SharedBlobStore,
    limits: ResourceLimits,
    output_prefix: String,
    executions: AtomicU64,
}

impl Executor {
    pub fn new(store: SharedBlobStore, limits: ResourceLimits) -> Self {
        Self {
            store,
            limits,
            output_prefix: "outputs".to_string(),
            executions: AtomicU64::new(0),
        }
    }

    pub fn with_output_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_prefix = prefix.into();
        self
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn store(&self) -> &SharedBlobStore {
        &self.store
    }

    /// Number of executions started so far.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Load every in-scope dataset `program` merges in.
    ///
    /// Out-of-scope sources are skipped; the interpreter refuses them.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecutionError`] if an in-scope source cannot be loaded.
    pub async fn load_sources(
        &self,
        program: &TransformProgram,
        scope: &IoScope,
    ) -> Result<Sources, ExecutionError> {
        let mut sources = Sources::new();
        for source in program.merge_sources() {
            if !scope.can_read_ref(source) || sources.contains_key(source) {
                continue;
            }
            let data = load_dataset(self.store.as_ref(), source).await?;
            debug!(source = %source, rows = data.row_count(), "Loaded merge source");
            sources.insert(source.clone(), data);
        }
        Ok(sources)
    }

    /// Execute `artifact` against the dataset stored at `input`.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecutionError`] if the input cannot be loaded, a step
    /// fails, a ceiling is hit, the deadline passes, `cancel` fires, or the
    /// worker panics.
    pub async fn execute(
        &self,
        artifact: &Artifact,
        input: &DataRef,
        scope: &IoScope,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        self.executions.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let data = load_dataset(self.store.as_ref(), input).await?;
        let sources = self.load_sources(&artifact.program, scope).await?;
        let output = self
            .run_isolated(artifact, data, sources, scope, cancel)
            .await?;

        let output_ref = DataRef::new(format!("{}/{}", self.output_prefix, Uuid::new_v4()));
        save_dataset(self.store.as_ref(), &output_ref, &output)
            .await
            .map_err(|e| ExecutionError::Io(e.to_string()))?;

        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            artifact_id = %artifact.id,
            output = %output_ref,
            rows = output.row_count(),
            duration_ms,
            "Execution finished"
        );
        let result = ExecutionResult {
            output_ref,
            quality: QualityMetrics::compute(&output),
            success: true,
            error: None,
            rows: output.row_count(),
            columns: output.column_count(),
            duration_ms,
        };
        Ok(ExecutionOutput { result, output })
    }

    async fn run_isolated(
        &self,
        artifact: &Artifact,
        data: Dataset,
        sources: Sources,
        scope: &IoScope,
        cancel: &CancellationToken,
    ) -> Result<Dataset, ExecutionError> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let program = artifact.program.clone();
        let scope = scope.clone();
        let limits = self.limits;

        let handle = tokio::task::spawn_blocking(move || {
            let control = RunControl {
                cancel: &worker_stop,
                max_rows: limits.max_rows,
                max_bytes: limits.max_bytes,
                scope: &scope,
                dry_run: false,
                sources: Some(&sources),
            };
            run_program(&program, data, &control)
        });

        let joined = tokio::select! {
            _ = cancel.cancelled() => {
                stop.store(true, Ordering::SeqCst);
                return Err(ExecutionError::Cancelled);
            }
            joined = tokio::time::timeout(limits.timeout, handle) => joined,
        };

        match joined {
            Err(_) => {
                stop.store(true, Ordering::SeqCst);
                warn!(artifact_id = %artifact.id, timeout = ?limits.timeout, "Execution timed out");
                Err(ExecutionError::Timeout(limits.timeout))
            }
            Ok(Err(join_error)) => Err(join_failure(join_error)),
            Ok(Ok(outcome)) => outcome,
        }
    }
}

fn join_failure(err: JoinError) -> ExecutionError {
    if !err.is_panic() {
        return ExecutionError::Cancelled;
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    ExecutionError::Panicked(message)
}
