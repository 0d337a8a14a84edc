//! Task definitions for the stage pipeline.
//!
//! - `StageKind`: the six pipeline stages, in data-flow order
//! - `Task`: a unit of work for one stage, identified for caching by its fingerprint
//! - `TaskStatus`: lifecycle state of a task
//! - `IoScope`: the I/O a task declares it may perform
//! - `ExecutionResult`: output reference and quality of a finished execution

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::fingerprint::Fingerprint;
use crate::data::{DataRef, QualityMetrics, Schema};

/// Pipeline stage kinds, in data-flow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Wrangling,
    Cleaning,
    FeatureEngineering,
    Analysis,
    Modeling,
    Interpretation,
}

impl StageKind {
    /// All stages in pipeline order.
    pub const ALL: [StageKind; 6] = [
        StageKind::Wrangling,
        StageKind::Cleaning,
        StageKind::FeatureEngineering,
        StageKind::Analysis,
        StageKind::Modeling,
        StageKind::Interpretation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Wrangling => "wrangling",
            StageKind::Cleaning => "cleaning",
            StageKind::FeatureEngineering => "feature_engineering",
            StageKind::Analysis => "analysis",
            StageKind::Modeling => "modeling",
            StageKind::Interpretation => "interpretation",
        }
    }

    /// Downstream stage, if any.
    pub fn next(&self) -> Option<StageKind> {
        let idx = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// Whether the stage emits a summary table instead of transformed data.
    ///
    /// Report outputs branch off the data flow: the next stage still reads
    /// the latest transformed dataset.
    pub fn is_report(&self) -> bool {
        matches!(
            self,
            StageKind::Analysis | StageKind::Modeling | StageKind::Interpretation
        )
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .find(|stage| stage.as_str() == normalized)
            .copied()
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    /// An artifact for the task passed validation.
    Validated,
    /// The validated artifact ran and its output passed quality checks.
    Executed,
    Failed,
    /// Served from the artifact cache without invoking a backend.
    CachedHit,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Executed | TaskStatus::Failed | TaskStatus::CachedHit
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Executed | TaskStatus::CachedHit)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Validated => "validated",
            TaskStatus::Executed => "executed",
            TaskStatus::Failed => "failed",
            TaskStatus::CachedHit => "cached_hit",
        };
        write!(f, "{}", s)
    }
}

/// I/O a task is allowed to perform. Everything is denied by default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoScope {
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub allow_process: bool,
    #[serde(default)]
    pub readable_paths: Vec<PathBuf>,
    #[serde(default)]
    pub writable_paths: Vec<PathBuf>,
    /// Blob-store key prefixes whose datasets may be merged in.
    #[serde(default)]
    pub readable_refs: Vec<String>,
}

impl IoScope {
    pub fn with_readable(mut self, path: impl Into<PathBuf>) -> Self {
        self.readable_paths.push(path.into());
        self
    }

    pub fn with_writable(mut self, path: impl Into<PathBuf>) -> Self {
        self.writable_paths.push(path.into());
        self
    }

    pub fn with_readable_ref(mut self, prefix: impl Into<String>) -> Self {
        self.readable_refs.push(prefix.into());
        self
    }

    /// Whether `data_ref` lies under a readable key prefix. Prefixes match
    /// whole `/`-separated segments and `..` segments are never in scope.
    pub fn can_read_ref(&self, data_ref: &DataRef) -> bool {
        let key = data_ref.as_str();
        if key.split('/').any(|segment| segment == "..") {
            return false;
        }
        self.readable_refs.iter().any(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            key == prefix
                || key
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    pub fn can_read(&self, path: &Path) -> bool {
        within_any(path, &self.readable_paths)
    }

    pub fn can_write(&self, path: &Path) -> bool {
        within_any(path, &self.writable_paths)
    }
}

/// Lexical containment check; `..` components are never in scope.
fn within_any(path: &Path, roots: &[PathBuf]) -> bool {
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return false;
    }
    roots.iter().any(|root| path.starts_with(root))
}

/// A unit of work for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub stage: StageKind,
    pub input: DataRef,
    /// Operation name within the stage (e.g. "clean", "describe").
    pub operation: String,
    pub params: Value,
    pub fingerprint: Fingerprint,
    pub status: TaskStatus,
    pub retry_count: u32,
    /// Tasks that must report before this one runs.
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    #[serde(default)]
    pub expected_schema: Option<Schema>,
    #[serde(default)]
    pub scope: IoScope,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task and compute its fingerprint.
    pub fn new(
        stage: StageKind,
        input: DataRef,
        operation: impl Into<String>,
        params: Value,
    ) -> Self {
        let operation = operation.into();
        let fingerprint = Fingerprint::compute(stage, &input, &operation, &params);
        Self {
            id: Uuid::new_v4(),
            stage,
            input,
            operation,
            params,
            fingerprint,
            status: TaskStatus::Pending,
            retry_count: 0,
            depends_on: Vec::new(),
            expected_schema: None,
            scope: IoScope::default(),
            created_at: Utc::now(),
        }
    }

    pub fn depends_on(mut self, upstream: Uuid) -> Self {
        self.depends_on.push(upstream);
        self
    }

    pub fn with_expected_schema(mut self, schema: Schema) -> Self {
        self.expected_schema = Some(schema);
        self
    }

    pub fn with_scope(mut self, scope: IoScope) -> Self {
        self.scope = scope;
        self
    }

    /// A fresh task for the same stage with revised parameters.
    ///
    /// The new task gets its own id and fingerprint, so a re-run never
    /// collides with the original in the cache.
    pub fn revise(&self, input: DataRef, params: Value) -> Task {
        Task::new(self.stage, input, self.operation.clone(), params)
            .with_scope(self.scope.clone())
            .with_expected(self.expected_schema.clone())
    }

    fn with_expected(mut self, schema: Option<Schema>) -> Self {
        self.expected_schema = schema;
        self
    }

    /// Parameter lookup helper.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

/// Outcome of executing an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output_ref: DataRef,
    pub quality: QualityMetrics,
    pub success: bool,
    pub error: Option<String>,
    pub rows: usize,
    pub columns: usize,
    pub duration_ms: u64,
}
