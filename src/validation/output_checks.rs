//! Post-execution checks on an output dataset.

use super::{ValidationPhase, ValidatorConfig, Verdict};
use crate::data::{Dataset, Schema};
use crate::task::ExecutionResult;

pub(crate) fn check_shape(
    config: &ValidatorConfig,
    result: &ExecutionResult,
    output: &Dataset,
    expected: Option<&Schema>,
    verdict: &mut Verdict,
) {
    let phase = ValidationPhase::Output;

    if !result.success {
        verdict.add_error(
            phase,
            "execution",
            result
                .error
                .clone()
                .unwrap_or_else(|| "execution reported failure".to_string()),
        );
        return;
    }

    if output.is_empty() && !config.allow_empty_output {
        verdict.add_error(phase, "empty_output", "output has no rows");
    }

    if let Some(expected) = expected {
        for problem in expected.mismatches(&output.schema()) {
            verdict.add_error(phase, "schema", problem);
        }
    }
}

pub(crate) fn check_quality(config: &ValidatorConfig, result: &ExecutionResult, verdict: &mut Verdict) {
    if !result.success {
        return;
    }
    let phase = ValidationPhase::Output;
    let quality = &result.quality;

    for (column, ratio) in quality.columns_over_null_ratio(config.max_null_ratio) {
        verdict.add_error(
            phase,
            "null_ratio",
            format!(
                "column '{}' is {:.0}% null (limit {:.0}%)",
                column,
                ratio * 100.0,
                config.max_null_ratio * 100.0
            ),
        );
    }

    if quality.outlier_ratio > config.max_outlier_ratio {
        verdict.add_error(
            phase,
            "outlier_ratio",
            format!(
                "{:.1}% of numeric cells are outliers (limit {:.1}%)",
                quality.outlier_ratio * 100.0,
                config.max_outlier_ratio * 100.0
            ),
        );
    }

    if quality.overall < config.min_quality {
        verdict.add_error(
            phase,
            "quality",
            format!(
                "overall quality {:.2} is below {:.2}",
                quality.overall, config.min_quality
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::data::{DataRef, DataType, Dataset, QualityMetrics, Schema};
    use crate::task::ExecutionResult;
    use crate::validation::{Validator, ValidatorConfig};
    use serde_json::json;

    fn result_for(output: &Dataset) -> ExecutionResult {
        ExecutionResult {
            output_ref: DataRef::new("out"),
            quality: QualityMetrics::compute(output),
            success: true,
            error: None,
            rows: output.row_count(),
            columns: output.column_count(),
            duration_ms: 3,
        }
    }

    fn clean_output() -> Dataset {
        Dataset::new(
            vec!["price".to_string(), "city".to_string()],
            vec![
                vec![json!(100.0), json!("paris")],
                vec![json!(120.0), json!("lyon")],
                vec![json!(90.0), json!("nice")],
            ],
        )
    }

    #[test]
    fn test_clean_output_passes() {
        let output = clean_output();
        let expected = Schema::default().with_field("price", DataType::Float);
        let verdict = Validator::default().validate_output(&result_for(&output), &output, Some(&expected));
        assert!(verdict.passed, "{}", verdict.reason());
    }

    #[test]
    fn test_schema_and_null_ratio_failures() {
        let output = Dataset::new(
            vec!["price".to_string()],
            vec![vec![json!(null)], vec![json!(null)], vec![json!(5.0)]],
        );
        let expected = Schema::default()
            .with_field("price", DataType::Float)
            .with_field("city", DataType::String);
        let verdict = Validator::default().validate_output(&result_for(&output), &output, Some(&expected));
        let checks: Vec<&str> = verdict.issues.iter().map(|i| i.check.as_str()).collect();
        assert!(checks.contains(&"schema"));
        assert!(checks.contains(&"null_ratio"));
    }

    #[test]
    fn test_failed_execution_and_empty_output() {
        let output = clean_output().empty_like();
        let mut result = result_for(&output);
        let verdict = Validator::default().validate_output(&result, &output, None);
        assert_eq!(verdict.issues[0].check, "empty_output");

        result.success = false;
        result.error = Some("timed out".to_string());
        let verdict = Validator::default().validate_output(&result, &output, None);
        assert_eq!(verdict.issues.len(), 1);
        assert_eq!(verdict.issues[0].message, "timed out");
    }

    #[test]
    fn test_report_skips_quality_thresholds() {
        let output = Dataset::new(
            vec!["column".to_string(), "mean".to_string()],
            vec![vec![json!("city"), json!(null)], vec![json!("zip"), json!(null)]],
        );
        let validator = Validator::new(ValidatorConfig::default());
        assert!(!validator.validate_output(&result_for(&output), &output, None).passed);
        assert!(validator.validate_report(&result_for(&output), &output, None).passed);
    }
}
