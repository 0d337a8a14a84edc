//! Transform programs: the executable content of an artifact.
//!
//! A program is an ordered list of [`Step`]s applied to a [`Dataset`]. Programs
//! are plain JSON so both backends can emit them and the cache can persist
//! them:
//!
//! ```json
//! {"steps": [
//!   {"op": "fill_missing", "column": "price", "strategy": "median"},
//!   {"op": "derive", "name": "log_price", "expr": {"log": {"column": "price"}}}
//! ]}
//! ```
//!
//! [`Dataset`]: crate::data::Dataset

use std::path::PathBuf;

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::{DataRef, DataType};
use crate::task::{sha256_hex, to_canonical_json};

/// How `fill_missing` replaces nulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStrategy {
    /// Drop rows where the column is null.
    Drop,
    Mean,
    Median,
    /// Most frequent non-null value; ties go to the first seen.
    Mode,
    /// Use the step's `value`.
    Constant,
}

/// Which rows a `merge` keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// Only rows whose keys appear on both sides.
    Inner,
    /// Every working row, matched where possible.
    Left,
    /// Rows from either side, matched where keys agree.
    #[default]
    Outer,
}

/// Calendar field extracted by `datetime_parts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatetimePart {
    Year,
    Quarter,
    Month,
    Day,
    /// Monday is 0.
    Weekday,
    DayOfYear,
    Hour,
    Minute,
}

impl DatetimePart {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatetimePart::Year => "year",
            DatetimePart::Quarter => "quarter",
            DatetimePart::Month => "month",
            DatetimePart::Day => "day",
            DatetimePart::Weekday => "weekday",
            DatetimePart::DayOfYear => "day_of_year",
            DatetimePart::Hour => "hour",
            DatetimePart::Minute => "minute",
        }
    }

    pub fn extract(&self, at: &NaiveDateTime) -> i64 {
        match self {
            DatetimePart::Year => i64::from(at.year()),
            DatetimePart::Quarter => i64::from((at.month() - 1) / 3 + 1),
            DatetimePart::Month => i64::from(at.month()),
            DatetimePart::Day => i64::from(at.day()),
            DatetimePart::Weekday => i64::from(at.weekday().num_days_from_monday()),
            DatetimePart::DayOfYear => i64::from(at.ordinal()),
            DatetimePart::Hour => i64::from(at.hour()),
            DatetimePart::Minute => i64::from(at.minute()),
        }
    }
}

/// Arithmetic expression over the columns of one row.
///
/// Serialized externally tagged: `{"add": [{"column": "a"}, {"literal": 1}]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Column(String),
    Literal(f64),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    /// Natural log of `1 + x`, so zero stays finite.
    Log(Box<Expr>),
    Abs(Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    /// Nesting depth; a leaf has depth 1.
    pub fn depth(&self) -> usize {
        match self {
            Expr::Column(_) | Expr::Literal(_) => 1,
            Expr::Neg(e) | Expr::Log(e) | Expr::Abs(e) => 1 + e.depth(),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) | Expr::Pow(a, b) => {
                1 + a.depth().max(b.depth())
            }
        }
    }

    /// Columns referenced anywhere in the tree.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Column(name) => out.push(name),
            Expr::Literal(_) => {}
            Expr::Neg(e) | Expr::Log(e) | Expr::Abs(e) => e.collect_columns(out),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) | Expr::Pow(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_outlier_z() -> f64 {
    3.0
}

fn default_correlation_threshold() -> f64 {
    0.95
}

fn default_holdout_every() -> usize {
    5
}

fn default_max_categories() -> usize {
    20
}

/// One transform applied to the working dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    // Wrangling
    SelectColumns {
        columns: Vec<String>,
    },
    DropColumns {
        columns: Vec<String>,
    },
    RenameColumn {
        from: String,
        to: String,
    },
    CastColumn {
        column: String,
        to: DataType,
    },
    NormalizeText {
        column: String,
        #[serde(default = "default_true")]
        lowercase: bool,
        #[serde(default = "default_true")]
        trim: bool,
    },
    /// Join a second stored dataset on key columns. Right-hand columns whose
    /// names clash with working columns get a `_right` suffix.
    Merge {
        source: DataRef,
        on: Vec<String>,
        #[serde(default)]
        how: JoinKind,
    },

    // Cleaning
    FillMissing {
        /// `None` applies the strategy to every column.
        #[serde(default)]
        column: Option<String>,
        strategy: FillStrategy,
        #[serde(default)]
        value: Option<Value>,
    },
    DropDuplicates {
        #[serde(default)]
        subset: Option<Vec<String>>,
    },
    DropMissingRows {
        #[serde(default)]
        columns: Option<Vec<String>>,
    },
    ClipOutliers {
        column: String,
        #[serde(default = "default_outlier_z")]
        z: f64,
    },

    // Feature engineering
    Derive {
        name: String,
        expr: Expr,
    },
    Interaction {
        columns: Vec<String>,
        #[serde(default)]
        name: Option<String>,
    },
    /// Replace a categorical column with one 0/1 column per category,
    /// named `<prefix>_<category>` (prefix defaults to the column name).
    OneHotEncode {
        column: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default = "default_max_categories")]
        max_categories: usize,
    },
    /// Add `<prefix>_<part>` integer columns parsed from a date/time column.
    /// Unparseable cells yield nulls.
    DatetimeParts {
        column: String,
        parts: Vec<DatetimePart>,
        #[serde(default)]
        prefix: Option<String>,
    },
    DropConstantColumns,
    DropCorrelatedColumns {
        #[serde(default = "default_correlation_threshold")]
        threshold: f64,
    },
    SampleRows {
        max_rows: usize,
    },

    // Analysis
    Describe {
        #[serde(default)]
        columns: Option<Vec<String>>,
    },
    Correlate {
        #[serde(default)]
        columns: Option<Vec<String>>,
    },

    // Modeling and interpretation
    BaselineModel {
        target: String,
        #[serde(default = "default_holdout_every")]
        holdout_every: usize,
    },
    FeatureImportance {
        target: String,
    },

    // Capability-bearing
    Export {
        path: PathBuf,
    },
    Load {
        path: PathBuf,
    },
    Fetch {
        url: String,
    },
    Shell {
        command: String,
    },
}

impl Step {
    /// Short name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Step::SelectColumns { .. } => "select_columns",
            Step::DropColumns { .. } => "drop_columns",
            Step::RenameColumn { .. } => "rename_column",
            Step::CastColumn { .. } => "cast_column",
            Step::NormalizeText { .. } => "normalize_text",
            Step::Merge { .. } => "merge",
            Step::FillMissing { .. } => "fill_missing",
            Step::DropDuplicates { .. } => "drop_duplicates",
            Step::DropMissingRows { .. } => "drop_missing_rows",
            Step::ClipOutliers { .. } => "clip_outliers",
            Step::Derive { .. } => "derive",
            Step::Interaction { .. } => "interaction",
            Step::OneHotEncode { .. } => "one_hot_encode",
            Step::DatetimeParts { .. } => "datetime_parts",
            Step::DropConstantColumns => "drop_constant_columns",
            Step::DropCorrelatedColumns { .. } => "drop_correlated_columns",
            Step::SampleRows { .. } => "sample_rows",
            Step::Describe { .. } => "describe",
            Step::Correlate { .. } => "correlate",
            Step::BaselineModel { .. } => "baseline_model",
            Step::FeatureImportance { .. } => "feature_importance",
            Step::Export { .. } => "export",
            Step::Load { .. } => "load",
            Step::Fetch { .. } => "fetch",
            Step::Shell { .. } => "shell",
        }
    }

    /// Capability this step needs beyond pure in-memory computation.
    pub fn capability(&self) -> Option<Capability> {
        match self {
            Step::Export { path } => Some(Capability::FileWrite(path.clone())),
            Step::Load { path } => Some(Capability::FileRead(path.clone())),
            Step::Fetch { url } => Some(Capability::Network(url.clone())),
            Step::Shell { command } => Some(Capability::Process(command.clone())),
            Step::Merge { source, .. } => Some(Capability::DatasetRead(source.clone())),
            _ => None,
        }
    }
}

/// An I/O capability requested by a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Network(String),
    Process(String),
    FileRead(PathBuf),
    FileWrite(PathBuf),
    /// Another dataset in the blob store.
    DatasetRead(DataRef),
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Network(url) => write!(f, "network access to {}", url),
            Capability::Process(cmd) => write!(f, "process spawn '{}'", cmd),
            Capability::FileRead(p) => write!(f, "file read {}", p.display()),
            Capability::FileWrite(p) => write!(f, "file write {}", p.display()),
            Capability::DatasetRead(r) => write!(f, "dataset read {}", r),
        }
    }
}

/// Ordered list of steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformProgram {
    pub steps: Vec<Step>,
}

impl TransformProgram {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn required_capabilities(&self) -> Vec<Capability> {
        self.steps.iter().filter_map(Step::capability).collect()
    }

    /// Deepest expression in any `derive` step (0 when there is none).
    pub fn max_expr_depth(&self) -> usize {
        self.steps
            .iter()
            .filter_map(|s| match s {
                Step::Derive { expr, .. } => Some(expr.depth()),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Stored datasets the program merges in, in step order.
    pub fn merge_sources(&self) -> Vec<&DataRef> {
        self.steps
            .iter()
            .filter_map(|s| match s {
                Step::Merge { source, .. } => Some(source),
                _ => None,
            })
            .collect()
    }

    /// SHA-256 of the canonical JSON form.
    pub fn content_hash(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        sha256_hex(&to_canonical_json(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_json_shape() {
        let program: TransformProgram = serde_json::from_value(json!({
            "steps": [
                {"op": "fill_missing", "column": "price", "strategy": "median"},
                {"op": "derive", "name": "ratio", "expr": {"div": [{"column": "a"}, {"literal": 2.0}]}},
                {"op": "drop_constant_columns"},
                {"op": "normalize_text", "column": "city"}
            ]
        }))
        .expect("program should parse");

        assert_eq!(program.len(), 4);
        assert_eq!(
            program.steps[0],
            Step::FillMissing {
                column: Some("price".to_string()),
                strategy: FillStrategy::Median,
                value: None,
            }
        );
        assert!(matches!(
            program.steps[3],
            Step::NormalizeText { lowercase: true, trim: true, .. }
        ));
    }

    #[test]
    fn test_expr_depth_and_columns() {
        let expr = Expr::Add(
            Box::new(Expr::column("a")),
            Box::new(Expr::Log(Box::new(Expr::Mul(
                Box::new(Expr::column("b")),
                Box::new(Expr::Literal(2.0)),
            )))),
        );
        assert_eq!(expr.depth(), 4);
        assert_eq!(expr.columns(), vec!["a", "b"]);
    }

    #[test]
    fn test_required_capabilities() {
        let program = TransformProgram::new(vec![
            Step::DropConstantColumns,
            Step::Export { path: PathBuf::from("/tmp/out.json") },
            Step::Fetch { url: "http://example.com".to_string() },
        ]);
        let caps = program.required_capabilities();
        assert_eq!(caps.len(), 2);
        assert!(matches!(caps[0], Capability::FileWrite(_)));
        assert!(matches!(caps[1], Capability::Network(_)));
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = TransformProgram::new(vec![Step::DropDuplicates { subset: None }]);
        let b = TransformProgram::new(vec![Step::DropDuplicates { subset: None }]);
        let c = TransformProgram::new(vec![Step::DropConstantColumns]);
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_new_ops_parse_with_defaults() {
        let program: TransformProgram = serde_json::from_value(json!({
            "steps": [
                {"op": "merge", "source": "raw/orders", "on": ["customer_id"]},
                {"op": "one_hot_encode", "column": "city"},
                {"op": "datetime_parts", "column": "signup", "parts": ["year", "day_of_year"]}
            ]
        }))
        .expect("program should parse");

        assert!(matches!(
            &program.steps[0],
            Step::Merge { how: JoinKind::Outer, source, .. } if source.as_str() == "raw/orders"
        ));
        assert!(matches!(
            program.steps[1],
            Step::OneHotEncode { max_categories: 20, prefix: None, .. }
        ));
        assert_eq!(program.merge_sources(), vec![&DataRef::new("raw/orders")]);
        assert!(matches!(
            program.required_capabilities().as_slice(),
            [Capability::DatasetRead(_)]
        ));
    }

    #[test]
    fn test_datetime_part_extraction() {
        let at = NaiveDateTime::parse_from_str("2024-11-03 14:25:00", "%Y-%m-%d %H:%M:%S")
            .expect("timestamp");
        let parts: Vec<i64> = [
            DatetimePart::Year,
            DatetimePart::Quarter,
            DatetimePart::Month,
            DatetimePart::Day,
            DatetimePart::Weekday,
            DatetimePart::DayOfYear,
            DatetimePart::Hour,
            DatetimePart::Minute,
        ]
        .iter()
        .map(|p| p.extract(&at))
        .collect();
        // 2024-11-03 was a Sunday, the 308th day of a leap year.
        assert_eq!(parts, vec![2024, 4, 11, 3, 6, 308, 14, 25]);
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        let result: Result<Step, _> = serde_json::from_value(json!({"op": "format_disk"}));
        assert!(result.is_err());
    }
}
