//! Artifact and output validation.
//!
//! Validation is synchronous and deterministic. An artifact passes through
//! static checks (shape, limits, capabilities, forbidden patterns) and then a
//! dynamic dry run on a sample of the input. After execution the output is
//! checked for schema conformance and data quality.

pub mod output_checks;
pub mod program_checks;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::artifact::{Artifact, Sources};
use crate::data::{Dataset, Schema};
use crate::task::{ExecutionResult, IoScope, Task};

/// Where in validation a problem was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPhase {
    Static,
    Dynamic,
    Output,
}

impl ValidationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationPhase::Static => "static",
            ValidationPhase::Dynamic => "dynamic",
            ValidationPhase::Output => "output",
        }
    }
}

impl std::fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single failed check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub phase: ValidationPhase,
    /// Short check name (e.g., "step_limit", "null_ratio").
    pub check: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.phase, self.check, self.message)
    }
}

/// Outcome of a validation pass.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub issues: Vec<ValidationIssue>,
    /// Non-blocking observations.
    pub warnings: Vec<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            issues: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(
        &mut self,
        phase: ValidationPhase,
        check: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.issues.push(ValidationIssue {
            phase,
            check: check.into(),
            message: message.into(),
        });
        self.passed = false;
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Phase of the first recorded failure.
    pub fn failed_phase(&self) -> Option<ValidationPhase> {
        self.issues.first().map(|i| i.phase)
    }

    /// All failures joined into one line.
    pub fn reason(&self) -> String {
        self.issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validator thresholds and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub max_steps: usize,
    pub max_expr_depth: usize,
    /// Regexes that must not match synthesized source text.
    pub forbidden_patterns: Vec<String>,
    /// Rows taken from the head of the input for the dry run.
    pub sample_rows: usize,
    /// Highest tolerated null ratio of any output column.
    pub max_null_ratio: f64,
    /// Highest tolerated fraction of numeric cells with |z| > 3.
    pub max_outlier_ratio: f64,
    /// Lowest tolerated overall quality score.
    pub min_quality: f64,
    pub allow_empty_output: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_steps: 64,
            max_expr_depth: 16,
            forbidden_patterns: vec![
                r"(?i)\bsubprocess\b".to_string(),
                r"(?i)\bos\.system\b".to_string(),
                r"__import__".to_string(),
                r"(?i)\beval\s*\(".to_string(),
                r"(?i)\bexec\s*\(".to_string(),
                r"rm\s+-rf".to_string(),
            ],
            sample_rows: 50,
            max_null_ratio: 0.5,
            max_outlier_ratio: 0.2,
            min_quality: 0.5,
            allow_empty_output: false,
        }
    }
}

impl ValidatorConfig {
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_forbidden_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.forbidden_patterns.push(pattern.into());
        self
    }

    pub fn with_min_quality(mut self, min_quality: f64) -> Self {
        self.min_quality = min_quality;
        self
    }

    pub fn with_max_null_ratio(mut self, ratio: f64) -> Self {
        self.max_null_ratio = ratio;
        self
    }
}

/// What the validator knows about the task an artifact was produced for.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext<'a> {
    pub scope: &'a IoScope,
    pub input_schema: &'a Schema,
    /// Input data for the dry run; the schema alone is used when absent.
    pub sample: Option<&'a Dataset>,
    pub expected_schema: Option<&'a Schema>,
    /// Datasets the program merges in, for the dry run.
    pub sources: Option<&'a Sources>,
}

impl<'a> TaskContext<'a> {
    pub fn new(scope: &'a IoScope, input_schema: &'a Schema) -> Self {
        Self {
            scope,
            input_schema,
            sample: None,
            expected_schema: None,
            sources: None,
        }
    }

    /// Context taking scope and expected schema from `task`.
    pub fn for_task(task: &'a Task, input_schema: &'a Schema) -> Self {
        Self {
            scope: &task.scope,
            input_schema,
            sample: None,
            expected_schema: task.expected_schema.as_ref(),
            sources: None,
        }
    }

    pub fn with_sample(mut self, sample: &'a Dataset) -> Self {
        self.sample = Some(sample);
        self
    }

    pub fn with_expected_schema(mut self, schema: &'a Schema) -> Self {
        self.expected_schema = Some(schema);
        self
    }

    pub fn with_sources(mut self, sources: &'a Sources) -> Self {
        self.sources = Some(sources);
        self
    }
}

/// Validator with compiled patterns.
#[derive(Debug, Clone)]
pub struct Validator {
    config: ValidatorConfig,
    patterns: Vec<Regex>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

impl Validator {
    /// Build a validator. Patterns that fail to compile are logged and skipped.
    pub fn new(config: ValidatorConfig) -> Self {
        let patterns = config
            .forbidden_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Skipping invalid forbidden pattern");
                    None
                }
            })
            .collect();
        Self { config, patterns }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Static then dynamic checks. The dry run is skipped when static checks fail.
    pub fn validate_artifact(&self, artifact: &Artifact, ctx: &TaskContext<'_>) -> Verdict {
        let mut verdict = Verdict::pass();
        program_checks::check_static(&self.config, &self.patterns, artifact, ctx, &mut verdict);
        if verdict.passed {
            program_checks::check_dynamic(&self.config, artifact, ctx, &mut verdict);
        }
        verdict
    }

    /// Schema, null ratio, outlier ratio and quality checks on an executed output.
    pub fn validate_output(
        &self,
        result: &ExecutionResult,
        output: &Dataset,
        expected: Option<&Schema>,
    ) -> Verdict {
        let mut verdict = Verdict::pass();
        output_checks::check_shape(&self.config, result, output, expected, &mut verdict);
        output_checks::check_quality(&self.config, result, &mut verdict);
        verdict
    }

    /// Like [`validate_output`](Self::validate_output) without the quality
    /// thresholds. Used for report outputs (summaries, metrics tables) whose
    /// sparsity says nothing about data quality.
    pub fn validate_report(
        &self,
        result: &ExecutionResult,
        output: &Dataset,
        expected: Option<&Schema>,
    ) -> Verdict {
        let mut verdict = Verdict::pass();
        output_checks::check_shape(&self.config, result, output, expected, &mut verdict);
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_bookkeeping() {
        let mut verdict = Verdict::pass();
        assert!(verdict.passed);
        verdict.add_warning("just so you know");
        assert!(verdict.passed);

        verdict.add_error(ValidationPhase::Dynamic, "dry_run", "column 'x' not found");
        verdict.add_error(ValidationPhase::Output, "schema", "missing column 'y'");
        assert!(!verdict.passed);
        assert_eq!(verdict.failed_phase(), Some(ValidationPhase::Dynamic));
        assert_eq!(
            verdict.reason(),
            "[dynamic:dry_run] column 'x' not found; [output:schema] missing column 'y'"
        );
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let validator = Validator::new(ValidatorConfig::default().with_forbidden_pattern("(unclosed"));
        assert_eq!(validator.patterns.len(), ValidatorConfig::default().forbidden_patterns.len());
    }
}
