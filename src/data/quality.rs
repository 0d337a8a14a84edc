//! Data quality scoring.
//!
//! Scores are in `[0.0, 1.0]` where higher is better:
//! - completeness: 1 - ratio of null cells
//! - uniqueness: 1 - ratio of duplicate rows
//! - consistency: fraction of columns whose non-null cells share one type
//! - overall: mean of the three

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::dataset::{DataType, Dataset};

/// Z-score above which a numeric cell counts as an outlier.
pub const OUTLIER_Z_THRESHOLD: f64 = 3.0;

/// Quality metrics computed over a dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub completeness: f64,
    pub uniqueness: f64,
    pub consistency: f64,
    pub overall: f64,
    /// Null ratio per column.
    pub null_ratios: BTreeMap<String, f64>,
    /// Fraction of numeric cells with |z| above [`OUTLIER_Z_THRESHOLD`].
    pub outlier_ratio: f64,
}

impl QualityMetrics {
    /// Compute all metrics for `dataset`.
    ///
    /// An empty dataset is considered perfectly complete, unique and
    /// consistent; emptiness is checked separately by the output validator.
    pub fn compute(dataset: &Dataset) -> Self {
        let rows = dataset.row_count();
        let cols = dataset.column_count();

        let mut null_ratios = BTreeMap::new();
        let mut total_nulls = 0usize;
        for (idx, name) in dataset.columns.iter().enumerate() {
            let nulls = dataset.column_values(idx).filter(|v| v.is_null()).count();
            total_nulls += nulls;
            let ratio = if rows == 0 { 0.0 } else { nulls as f64 / rows as f64 };
            null_ratios.insert(name.clone(), ratio);
        }

        let cells = rows * cols;
        let completeness = if cells == 0 {
            1.0
        } else {
            1.0 - total_nulls as f64 / cells as f64
        };

        let uniqueness = if rows == 0 {
            1.0
        } else {
            dataset.distinct_rows() as f64 / rows as f64
        };

        let schema = dataset.schema();
        let consistency = if cols == 0 {
            1.0
        } else {
            let consistent = schema
                .fields
                .iter()
                .filter(|f| f.dtype != DataType::Mixed)
                .count();
            consistent as f64 / cols as f64
        };

        let overall = (completeness + uniqueness + consistency) / 3.0;

        Self {
            completeness,
            uniqueness,
            consistency,
            overall,
            null_ratios,
            outlier_ratio: outlier_ratio(dataset),
        }
    }

    /// Columns whose null ratio exceeds `max_ratio`.
    pub fn columns_over_null_ratio(&self, max_ratio: f64) -> Vec<(&str, f64)> {
        self.null_ratios
            .iter()
            .filter(|(_, r)| **r > max_ratio)
            .map(|(c, r)| (c.as_str(), *r))
            .collect()
    }
}

/// Mean and population standard deviation of the non-null values.
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}

fn outlier_ratio(dataset: &Dataset) -> f64 {
    let mut numeric_cells = 0usize;
    let mut outliers = 0usize;
    for idx in 0..dataset.column_count() {
        let values: Vec<f64> = dataset
            .column_values(idx)
            .filter_map(|v| match v {
                Value::Number(n) => n.as_f64(),
                _ => None,
            })
            .collect();
        let Some((mean, std)) = mean_std(&values) else {
            continue;
        };
        numeric_cells += values.len();
        if std > 0.0 {
            outliers += values
                .iter()
                .filter(|v| ((*v - mean) / std).abs() > OUTLIER_Z_THRESHOLD)
                .count();
        }
    }
    if numeric_cells == 0 {
        0.0
    } else {
        outliers as f64 / numeric_cells as f64
    }
}
