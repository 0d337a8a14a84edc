//! Pipeline plans: a linear sequence of stage steps with an optional
//! feedback edge.
//!
//! Each step runs on the latest transformed dataset. Report stages
//! (analysis, modeling, interpretation) produce summary tables that are
//! recorded but not chained. If the plan declares a `feedback` step and its
//! trigger stage fails, the supervisor re-runs the earlier step with revised
//! parameters (a new task, hence a new fingerprint) and then replays every
//! step after it.
//!
//! ```yaml
//! name: churn
//! steps:
//!   - stage: cleaning
//!     operation: clean
//!     params: { numeric_strategy: median }
//!   - stage: modeling
//!     operation: baseline
//!     params: { target: churned }
//! feedback:
//!   trigger: modeling
//!   stage: feature_engineering
//!   params: { drop_constant: true }
//! ```

use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::{Supervisor, SupervisorError};
use crate::agents::TaskReport;
use crate::data::{DataRef, Schema};
use crate::error::ConfigError;
use crate::monitor::{EventKind, MonitorEvent};
use crate::task::{Fingerprint, IoScope, StageKind, Task, TaskStatus};

fn empty_params() -> Value {
    json!({})
}

/// One stage invocation in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub stage: StageKind,
    pub operation: String,
    #[serde(default = "empty_params")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_schema: Option<Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<IoScope>,
}

impl PlanStep {
    pub fn new(stage: StageKind, operation: impl Into<String>, params: Value) -> Self {
        Self {
            stage,
            operation: operation.into(),
            params,
            expected_schema: None,
            scope: None,
        }
    }

    fn to_task(&self, input: DataRef, upstream: Option<Uuid>) -> Task {
        let mut task = Task::new(self.stage, input, self.operation.clone(), self.params.clone());
        if let Some(schema) = &self.expected_schema {
            task = task.with_expected_schema(schema.clone());
        }
        if let Some(scope) = &self.scope {
            task = task.with_scope(scope.clone());
        }
        if let Some(upstream) = upstream {
            task = task.depends_on(upstream);
        }
        task
    }
}

fn default_trigger() -> StageKind {
    StageKind::Modeling
}

fn default_feedback_stage() -> StageKind {
    StageKind::FeatureEngineering
}

fn default_max_rounds() -> u32 {
    1
}

/// Re-engineering edge taken when the trigger stage fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackStep {
    #[serde(default = "default_trigger")]
    pub trigger: StageKind,
    /// Stage to re-run; its last step before the trigger is revised.
    #[serde(default = "default_feedback_stage")]
    pub stage: StageKind,
    /// Replacement operation; the original step's operation when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Merged over the original step's parameters.
    #[serde(default = "empty_params")]
    pub params: Value,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

/// A named, linear pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePlan {
    pub name: String,
    pub steps: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackStep>,
}

impl PipelinePlan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            feedback: None,
        }
    }

    pub fn with_step(mut self, step: PlanStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_feedback(mut self, feedback: FeedbackStep) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let plan: PipelinePlan = serde_yaml::from_str(yaml)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check structure: steps in data-flow order, object parameters, and a
    /// feedback edge that points backwards at steps the plan contains.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::ValidationFailed(msg));
        if self.name.trim().is_empty() {
            return fail("plan name must not be empty".to_string());
        }
        if self.steps.is_empty() {
            return fail("plan has no steps".to_string());
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.operation.trim().is_empty() {
                return fail(format!("step {} has no operation", i + 1));
            }
            if !step.params.is_object() {
                return fail(format!("step {} params must be a mapping", i + 1));
            }
        }
        if let Some(pair) = self.steps.windows(2).find(|w| w[1].stage < w[0].stage) {
            return fail(format!(
                "step '{}' ({}) runs after '{}' ({}); stages must follow data-flow order",
                pair[1].operation, pair[1].stage, pair[0].operation, pair[0].stage
            ));
        }

        if let Some(feedback) = &self.feedback {
            if feedback.stage >= feedback.trigger {
                return fail(format!(
                    "feedback must target a stage before {}, got {}",
                    feedback.trigger, feedback.stage
                ));
            }
            for stage in [feedback.trigger, feedback.stage] {
                if !self.steps.iter().any(|s| s.stage == stage) {
                    return fail(format!("feedback refers to {} but no step runs it", stage));
                }
            }
            if !feedback.params.is_object() {
                return fail("feedback params must be a mapping".to_string());
            }
            if feedback.max_rounds == 0 {
                return fail("feedback max_rounds must be at least 1".to_string());
            }
        }
        Ok(())
    }

    /// A six-stage starter plan built on the library routines.
    pub fn template() -> Self {
        PipelinePlan::new("example")
            .with_step(PlanStep::new(
                StageKind::Wrangling,
                "standardize",
                json!({"lowercase": true}),
            ))
            .with_step(PlanStep::new(
                StageKind::Cleaning,
                "clean",
                json!({"numeric_strategy": "median", "drop_duplicates": true}),
            ))
            .with_step(PlanStep::new(
                StageKind::FeatureEngineering,
                "create_features",
                json!({"drop_constant": true}),
            ))
            .with_step(PlanStep::new(StageKind::Analysis, "describe", json!({})))
            .with_step(PlanStep::new(
                StageKind::Modeling,
                "baseline",
                json!({"target": "target"}),
            ))
            .with_step(PlanStep::new(
                StageKind::Interpretation,
                "feature_importance",
                json!({"target": "target"}),
            ))
            .with_feedback(FeedbackStep {
                trigger: StageKind::Modeling,
                stage: StageKind::FeatureEngineering,
                operation: Some("select_features".to_string()),
                params: json!({"correlation_threshold": 0.9}),
                max_rounds: 1,
            })
    }
}

/// Outcome of one submitted step.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub stage: StageKind,
    pub operation: String,
    pub task_id: Uuid,
    pub fingerprint: Fingerprint,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub output: Option<DataRef>,
    pub quality: Option<f64>,
    pub reasons: Vec<String>,
    /// Zero for the first pass, otherwise the feedback round.
    pub round: u32,
}

impl StepOutcome {
    fn from_report(report: &TaskReport, round: u32) -> Self {
        Self {
            stage: report.task.stage,
            operation: report.task.operation.clone(),
            task_id: report.task.id,
            fingerprint: report.task.fingerprint.clone(),
            status: report.status(),
            retry_count: report.task.retry_count,
            output: report.result.as_ref().map(|r| r.output_ref.clone()),
            quality: report.result.as_ref().map(|r| r.quality.overall),
            reasons: report.failure_reasons(),
            round,
        }
    }

    fn unassigned(task: &Task, error: &SupervisorError, round: u32) -> Self {
        Self {
            stage: task.stage,
            operation: task.operation.clone(),
            task_id: task.id,
            fingerprint: task.fingerprint.clone(),
            status: TaskStatus::Failed,
            retry_count: 0,
            output: None,
            quality: None,
            reasons: vec![error.to_string()],
            round,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Result of running a whole plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub plan: String,
    pub success: bool,
    /// Latest transformed dataset.
    pub data_output: DataRef,
    /// Every submitted step, in submission order.
    pub steps: Vec<StepOutcome>,
    pub feedback_rounds: u32,
    pub duration_ms: u64,
}

impl PlanReport {
    /// Summary outputs of report stages that succeeded.
    pub fn reports(&self) -> Vec<(StageKind, &DataRef)> {
        self.steps
            .iter()
            .filter(|s| s.stage.is_report() && s.is_success())
            .filter_map(|s| s.output.as_ref().map(|o| (s.stage, o)))
            .collect()
    }

    pub fn failed_step(&self) -> Option<&StepOutcome> {
        self.steps.iter().rev().find(|s| !s.is_success())
    }
}

/// Shallow merge of two JSON objects; `overlay` wins.
fn merge_params(base: &Value, overlay: &Value) -> Value {
    let mut merged: Map<String, Value> = base.as_object().cloned().unwrap_or_default();
    if let Some(overlay) = overlay.as_object() {
        for (key, value) in overlay {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

impl Supervisor {
    /// Run `plan` against the dataset stored at `input`.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Plan`] if the plan is invalid. Task
    /// failures are reported inside the [`PlanReport`].
    pub async fn run_plan(
        &self,
        plan: &PipelinePlan,
        input: DataRef,
    ) -> Result<PlanReport, SupervisorError> {
        plan.validate()
            .map_err(|e| SupervisorError::Plan(e.to_string()))?;
        let started = Instant::now();
        info!(plan = %plan.name, steps = plan.steps.len(), "Running plan");

        let mut data = input;
        let mut upstream: Option<Uuid> = None;
        let mut issued: Vec<Option<Task>> = vec![None; plan.steps.len()];
        let mut outcomes = Vec::new();
        let mut rounds = 0u32;
        let mut success = true;
        let mut idx = 0;

        while idx < plan.steps.len() {
            let step = &plan.steps[idx];
            let task = step.to_task(data.clone(), upstream);
            issued[idx] = Some(task.clone());

            let (outcome, ok) = self.submit_step(task, rounds).await;
            if ok {
                if !step.stage.is_report() {
                    if let Some(output) = &outcome.output {
                        data = output.clone();
                    }
                }
                upstream = Some(outcome.task_id);
                outcomes.push(outcome);
                idx += 1;
                continue;
            }
            let failed_id = outcome.task_id;
            outcomes.push(outcome);

            let Some((target, revised)) =
                self.feedback_task(plan, &issued, idx, rounds, failed_id)
            else {
                success = false;
                break;
            };
            rounds += 1;
            let (outcome, ok) = self.submit_step(revised, rounds).await;
            let output = outcome.output.clone();
            let revised_id = outcome.task_id;
            outcomes.push(outcome);
            if !ok {
                success = false;
                break;
            }
            if !plan.steps[target].stage.is_report() {
                if let Some(output) = output {
                    data = output;
                }
            }
            upstream = Some(revised_id);
            idx = target + 1;
        }

        let report = PlanReport {
            plan: plan.name.clone(),
            success,
            data_output: data,
            steps: outcomes,
            feedback_rounds: rounds,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if report.success {
            info!(plan = %plan.name, duration_ms = report.duration_ms, "Plan finished");
        } else {
            warn!(
                plan = %plan.name,
                failed_stage = ?report.failed_step().map(|s| s.stage),
                "Plan failed"
            );
        }
        Ok(report)
    }

    async fn submit_step(&self, task: Task, round: u32) -> (StepOutcome, bool) {
        let snapshot = task.clone();
        match self.submit(task).await {
            Ok(report) => {
                let outcome = StepOutcome::from_report(&report, round);
                let ok = report.is_success();
                (outcome, ok)
            }
            Err(e) => (StepOutcome::unassigned(&snapshot, &e, round), false),
        }
    }

    /// Build the revised task for a failed step at `failed_idx`, if the
    /// plan's feedback edge applies. Returns the index of the step being
    /// revised along with the new task.
    fn feedback_task(
        &self,
        plan: &PipelinePlan,
        issued: &[Option<Task>],
        failed_idx: usize,
        rounds: u32,
        failed_id: Uuid,
    ) -> Option<(usize, Task)> {
        let feedback = plan.feedback.as_ref()?;
        if plan.steps[failed_idx].stage != feedback.trigger || rounds >= feedback.max_rounds {
            return None;
        }
        let target = (0..failed_idx)
            .rev()
            .find(|i| plan.steps[*i].stage == feedback.stage)?;
        let original = issued[target].as_ref()?;

        let revised = revised_task(original, feedback);

        info!(
            trigger = %feedback.trigger,
            stage = %feedback.stage,
            round = rounds + 1,
            fingerprint = %revised.fingerprint.short(),
            "Feedback: re-engineering before retrying downstream stages"
        );
        self.sink().emit(&MonitorEvent::task(
            feedback.trigger,
            failed_id,
            EventKind::FeedbackTriggered,
            json!({
                "failed_task": failed_id,
                "target_stage": feedback.stage,
                "revised_task": revised.id,
                "operation": revised.operation,
                "round": rounds + 1,
            }),
        ));
        Some((target, revised))
    }
}

/// The task that replaces `original` when `feedback` fires: same input,
/// scope, expected schema and upstream edge, with the overlay applied.
fn revised_task(original: &Task, feedback: &FeedbackStep) -> Task {
    let params = merge_params(&original.params, &feedback.params);
    let mut revised = match &feedback.operation {
        Some(operation) => {
            let task = Task::new(original.stage, original.input.clone(), operation.clone(), params)
                .with_scope(original.scope.clone());
            match &original.expected_schema {
                Some(schema) => task.with_expected_schema(schema.clone()),
                None => task,
            }
        }
        None => original.revise(original.input.clone(), params),
    };
    revised.depends_on = original.depends_on.clone();
    revised
}
