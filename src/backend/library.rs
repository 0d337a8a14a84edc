//! Deterministic library routines.
//!
//! Each routine reads the task parameters and the input schema and emits a
//! fixed transform program. Routines never look at the data itself, so the
//! same request always yields the same program.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Backend, BackendRequest};
use crate::artifact::{
    Artifact, BackendKind, DatetimePart, Expr, FillStrategy, JoinKind, Step, TransformProgram,
};
use crate::data::{DataRef, DataType, Schema};
use crate::error::BackendError;
use crate::task::StageKind;

type Routine = fn(&Map<String, Value>, &Schema) -> Result<TransformProgram, BackendError>;

/// Every (stage, operation) pair the library handles.
pub const OPERATIONS: &[(StageKind, &str)] = &[
    (StageKind::Wrangling, "standardize"),
    (StageKind::Wrangling, "select"),
    (StageKind::Wrangling, "merge"),
    (StageKind::Cleaning, "clean"),
    (StageKind::Cleaning, "deduplicate"),
    (StageKind::FeatureEngineering, "create_features"),
    (StageKind::FeatureEngineering, "select_features"),
    (StageKind::FeatureEngineering, "encode"),
    (StageKind::FeatureEngineering, "datetime_features"),
    (StageKind::Analysis, "describe"),
    (StageKind::Analysis, "correlations"),
    (StageKind::Modeling, "baseline"),
    (StageKind::Interpretation, "feature_importance"),
];

/// Parameter keys that ask for behavior no fixed routine can provide.
const FREE_FORM_KEYS: &[&str] = &["instructions", "user_instructions"];

fn routine_for(stage: StageKind, operation: &str) -> Option<Routine> {
    let routine: Routine = match (stage, operation) {
        (StageKind::Wrangling, "standardize") => standardize,
        (StageKind::Wrangling, "select") => select,
        (StageKind::Wrangling, "merge") => merge,
        (StageKind::Cleaning, "clean") => clean,
        (StageKind::Cleaning, "deduplicate") => deduplicate,
        (StageKind::FeatureEngineering, "create_features") => create_features,
        (StageKind::FeatureEngineering, "select_features") => select_features,
        (StageKind::FeatureEngineering, "encode") => encode,
        (StageKind::FeatureEngineering, "datetime_features") => datetime_features,
        (StageKind::Analysis, "describe") => describe,
        (StageKind::Analysis, "correlations") => correlations,
        (StageKind::Modeling, "baseline") => baseline,
        (StageKind::Interpretation, "feature_importance") => feature_importance,
        _ => return None,
    };
    Some(routine)
}

/// Backend over the fixed routine table.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibraryBackend;

impl LibraryBackend {
    pub fn new() -> Self {
        Self
    }

    /// Build the program for a stage operation without wrapping it.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Unsupported` if the operation is unknown or its
    /// parameters cannot be satisfied against `schema`.
    pub fn program_for(
        &self,
        stage: StageKind,
        operation: &str,
        params: &Value,
        schema: &Schema,
    ) -> Result<TransformProgram, BackendError> {
        let routine = routine_for(stage, operation).ok_or_else(|| {
            BackendError::Unsupported(format!("no library routine for {}/{}", stage, operation))
        })?;
        let empty = Map::new();
        let params = match params {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(BackendError::Unsupported(format!(
                    "parameters must be an object, got {}",
                    other
                )))
            }
        };
        if let Some(key) = FREE_FORM_KEYS.iter().find(|k| params.contains_key(**k)) {
            return Err(BackendError::Unsupported(format!(
                "'{}' needs a generative backend",
                key
            )));
        }
        routine(params, schema)
    }
}

#[async_trait]
impl Backend for LibraryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Library
    }

    fn covers(&self, stage: StageKind, operation: &str) -> bool {
        routine_for(stage, operation).is_some()
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    async fn produce(
        &self,
        request: BackendRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<Artifact, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        let task = request.task;
        let program =
            self.program_for(task.stage, &task.operation, &task.params, request.input_schema)?;
        debug!(
            stage = %task.stage,
            operation = %task.operation,
            steps = program.len(),
            "Library routine built program"
        );
        Ok(Artifact::new(BackendKind::Library, program))
    }
}

// ============================================================================
// Parameter helpers
// ============================================================================

fn unsupported(message: impl Into<String>) -> BackendError {
    BackendError::Unsupported(message.into())
}

fn string_list(params: &Map<String, Value>, key: &str) -> Result<Option<Vec<String>>, BackendError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| unsupported(format!("'{}' must list column names", key)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(unsupported(format!("'{}' must be an array", key))),
    }
}

fn required_str<'p>(params: &'p Map<String, Value>, key: &str) -> Result<&'p str, BackendError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| unsupported(format!("missing string parameter '{}'", key)))
}

fn optional_f64(params: &Map<String, Value>, key: &str) -> Result<Option<f64>, BackendError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| unsupported(format!("'{}' must be a number", key))),
    }
}

fn optional_usize(params: &Map<String, Value>, key: &str) -> Result<Option<usize>, BackendError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| unsupported(format!("'{}' must be a non-negative integer", key))),
    }
}

fn flag(params: &Map<String, Value>, key: &str, default: bool) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn require_columns(schema: &Schema, columns: &[String]) -> Result<(), BackendError> {
    let missing: Vec<&str> = columns
        .iter()
        .filter(|c| schema.field(c).is_none())
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(unsupported(format!("unknown columns: {}", missing.join(", "))))
    }
}

fn require_numeric(schema: &Schema, column: &str) -> Result<(), BackendError> {
    match schema.field(column) {
        None => Err(unsupported(format!("unknown column '{}'", column))),
        Some(f) if !f.dtype.is_numeric() => Err(unsupported(format!(
            "column '{}' is {}, not numeric",
            column, f.dtype
        ))),
        Some(_) => Ok(()),
    }
}

fn columns_of(schema: &Schema, pred: impl Fn(DataType) -> bool) -> Vec<String> {
    schema
        .fields
        .iter()
        .filter(|f| pred(f.dtype))
        .map(|f| f.name.clone())
        .collect()
}

// ============================================================================
// Routines
// ============================================================================

/// Rename, cast and normalize text columns.
///
/// Parameters: `rename` (object from→to), `casts` (object column→type),
/// `text_columns` (defaults to every string column).
fn standardize(params: &Map<String, Value>, schema: &Schema) -> Result<TransformProgram, BackendError> {
    let mut steps = Vec::new();
    let mut renamed = schema.clone();

    if let Some(rename) = params.get("rename") {
        let map = rename
            .as_object()
            .ok_or_else(|| unsupported("'rename' must be an object"))?;
        for (from, to) in map {
            let to = to
                .as_str()
                .ok_or_else(|| unsupported(format!("rename target for '{}' must be a string", from)))?;
            require_columns(&renamed, std::slice::from_ref(from))?;
            for field in renamed.fields.iter_mut().filter(|f| &f.name == from) {
                field.name = to.to_string();
            }
            steps.push(Step::RenameColumn {
                from: from.clone(),
                to: to.to_string(),
            });
        }
    }

    if let Some(casts) = params.get("casts") {
        let map = casts
            .as_object()
            .ok_or_else(|| unsupported("'casts' must be an object"))?;
        for (column, dtype) in map {
            let to: DataType = serde_json::from_value(dtype.clone())
                .map_err(|_| unsupported(format!("unknown type {} for '{}'", dtype, column)))?;
            require_columns(&renamed, std::slice::from_ref(column))?;
            steps.push(Step::CastColumn {
                column: column.clone(),
                to,
            });
        }
    }

    let text_columns = match string_list(params, "text_columns")? {
        Some(cols) => {
            require_columns(&renamed, &cols)?;
            cols
        }
        None => columns_of(&renamed, |t| t == DataType::String),
    };
    for column in text_columns {
        steps.push(Step::NormalizeText {
            column,
            lowercase: flag(params, "lowercase", true),
            trim: true,
        });
    }

    Ok(TransformProgram::new(steps))
}

/// Keep or drop a named set of columns.
fn select(params: &Map<String, Value>, schema: &Schema) -> Result<TransformProgram, BackendError> {
    if let Some(columns) = string_list(params, "columns")? {
        require_columns(schema, &columns)?;
        return Ok(TransformProgram::new(vec![Step::SelectColumns { columns }]));
    }
    if let Some(columns) = string_list(params, "drop")? {
        require_columns(schema, &columns)?;
        return Ok(TransformProgram::new(vec![Step::DropColumns { columns }]));
    }
    Err(unsupported("select needs 'columns' or 'drop'"))
}

/// Join another stored dataset on shared key columns.
///
/// Parameters: `source` (blob-store key), `on` (key columns), `how`
/// (`inner`, `left` or `outer`; default `outer`). The task scope must list
/// the source under its readable refs.
fn merge(params: &Map<String, Value>, schema: &Schema) -> Result<TransformProgram, BackendError> {
    let source = required_str(params, "source")?;
    let on = string_list(params, "on")?
        .filter(|keys| !keys.is_empty())
        .ok_or_else(|| unsupported("merge needs key columns in 'on'"))?;
    require_columns(schema, &on)?;
    let how = match params.get("how") {
        None | Some(Value::Null) => JoinKind::default(),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|_| unsupported(format!("unknown join kind {}", value)))?,
    };
    Ok(TransformProgram::new(vec![Step::Merge {
        source: DataRef::new(source),
        on,
        how,
    }]))
}

/// Impute missing values, drop duplicates and optionally clip outliers.
///
/// Numeric columns use `numeric_strategy` (mean by default), everything else
/// uses the mode.
fn clean(params: &Map<String, Value>, schema: &Schema) -> Result<TransformProgram, BackendError> {
    let numeric_strategy = match params.get("numeric_strategy").and_then(Value::as_str) {
        None | Some("mean") => FillStrategy::Mean,
        Some("median") => FillStrategy::Median,
        Some("drop") => FillStrategy::Drop,
        Some(other) => return Err(unsupported(format!("unknown numeric strategy '{}'", other))),
    };

    let mut steps = Vec::new();
    for field in &schema.fields {
        let strategy = if field.dtype.is_numeric() {
            numeric_strategy
        } else if field.dtype == DataType::Null {
            continue;
        } else {
            FillStrategy::Mode
        };
        steps.push(Step::FillMissing {
            column: Some(field.name.clone()),
            strategy,
            value: None,
        });
    }

    if flag(params, "drop_duplicates", true) {
        steps.push(Step::DropDuplicates { subset: None });
    }

    if flag(params, "clip_outliers", false) {
        let z = optional_f64(params, "outlier_z")?.unwrap_or(3.0);
        if z <= 0.0 {
            return Err(unsupported("'outlier_z' must be positive"));
        }
        for column in columns_of(schema, |t| t.is_numeric()) {
            steps.push(Step::ClipOutliers { column, z });
        }
    }

    Ok(TransformProgram::new(steps))
}

fn deduplicate(params: &Map<String, Value>, schema: &Schema) -> Result<TransformProgram, BackendError> {
    let subset = string_list(params, "subset")?;
    if let Some(cols) = &subset {
        require_columns(schema, cols)?;
    }
    Ok(TransformProgram::new(vec![Step::DropDuplicates { subset }]))
}

/// Interaction terms, log transforms and constant-column removal.
///
/// Parameters: `interactions` (array of column-name arrays), `log` (columns
/// to add `log_<name>` for), `drop_constant` (default true).
fn create_features(
    params: &Map<String, Value>,
    schema: &Schema,
) -> Result<TransformProgram, BackendError> {
    let mut steps = Vec::new();

    if let Some(value) = params.get("interactions") {
        let groups = value
            .as_array()
            .ok_or_else(|| unsupported("'interactions' must be an array"))?;
        for group in groups {
            let columns: Vec<String> = group
                .as_array()
                .ok_or_else(|| unsupported("each interaction must list columns"))?
                .iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect();
            if columns.len() < 2 {
                return Err(unsupported("an interaction needs at least two columns"));
            }
            for column in &columns {
                require_numeric(schema, column)?;
            }
            steps.push(Step::Interaction {
                columns,
                name: None,
            });
        }
    }

    for column in string_list(params, "log")?.unwrap_or_default() {
        require_numeric(schema, &column)?;
        steps.push(Step::Derive {
            name: format!("log_{}", column),
            expr: Expr::Log(Box::new(Expr::Abs(Box::new(Expr::column(column))))),
        });
    }

    if flag(params, "drop_constant", true) {
        steps.push(Step::DropConstantColumns);
    }

    if steps.is_empty() {
        return Err(unsupported("create_features was given nothing to create"));
    }
    Ok(TransformProgram::new(steps))
}

/// Drop constant and highly correlated columns, optionally downsampling.
fn select_features(
    params: &Map<String, Value>,
    _schema: &Schema,
) -> Result<TransformProgram, BackendError> {
    let threshold = optional_f64(params, "correlation_threshold")?.unwrap_or(0.95);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(unsupported("'correlation_threshold' must be within [0, 1]"));
    }
    let mut steps = vec![
        Step::DropConstantColumns,
        Step::DropCorrelatedColumns { threshold },
    ];
    if let Some(max_rows) = optional_usize(params, "max_rows")? {
        steps.push(Step::SampleRows { max_rows });
    }
    Ok(TransformProgram::new(steps))
}

/// One-hot encode categorical columns.
///
/// Parameters: `columns` (defaults to every string column), `max_categories`
/// (default 20).
fn encode(params: &Map<String, Value>, schema: &Schema) -> Result<TransformProgram, BackendError> {
    let columns = match string_list(params, "columns")? {
        Some(cols) => {
            require_columns(schema, &cols)?;
            cols
        }
        None => columns_of(schema, |t| t == DataType::String),
    };
    if columns.is_empty() {
        return Err(unsupported("no categorical columns to encode"));
    }
    let max_categories = optional_usize(params, "max_categories")?.unwrap_or(20);
    if max_categories == 0 {
        return Err(unsupported("'max_categories' must be positive"));
    }
    let steps = columns
        .into_iter()
        .map(|column| Step::OneHotEncode {
            column,
            prefix: None,
            max_categories,
        })
        .collect();
    Ok(TransformProgram::new(steps))
}

/// Calendar features from date/time text columns.
///
/// Parameters: `columns` (required), `parts` (default year, month, day,
/// weekday).
fn datetime_features(
    params: &Map<String, Value>,
    schema: &Schema,
) -> Result<TransformProgram, BackendError> {
    let columns = string_list(params, "columns")?
        .filter(|cols| !cols.is_empty())
        .ok_or_else(|| unsupported("datetime_features needs 'columns'"))?;
    for column in &columns {
        match schema.field(column) {
            None => return Err(unsupported(format!("unknown column '{}'", column))),
            Some(f) if f.dtype != DataType::String => {
                return Err(unsupported(format!(
                    "column '{}' is {}, not date/time text",
                    column, f.dtype
                )))
            }
            Some(_) => {}
        }
    }
    let parts: Vec<DatetimePart> = match params.get("parts") {
        None | Some(Value::Null) => vec![
            DatetimePart::Year,
            DatetimePart::Month,
            DatetimePart::Day,
            DatetimePart::Weekday,
        ],
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|_| unsupported(format!("unknown date parts {}", value)))?,
    };
    if parts.is_empty() {
        return Err(unsupported("'parts' must not be empty"));
    }
    let steps = columns
        .into_iter()
        .map(|column| Step::DatetimeParts {
            column,
            parts: parts.clone(),
            prefix: None,
        })
        .collect();
    Ok(TransformProgram::new(steps))
}

fn describe(params: &Map<String, Value>, schema: &Schema) -> Result<TransformProgram, BackendError> {
    let columns = string_list(params, "columns")?;
    if let Some(cols) = &columns {
        require_columns(schema, cols)?;
    }
    Ok(TransformProgram::new(vec![Step::Describe { columns }]))
}

fn correlations(
    params: &Map<String, Value>,
    schema: &Schema,
) -> Result<TransformProgram, BackendError> {
    let columns = string_list(params, "columns")?;
    if let Some(cols) = &columns {
        for column in cols {
            require_numeric(schema, column)?;
        }
    } else if columns_of(schema, |t| t.is_numeric()).len() < 2 {
        return Err(unsupported("correlations need at least two numeric columns"));
    }
    Ok(TransformProgram::new(vec![Step::Correlate { columns }]))
}

fn baseline(params: &Map<String, Value>, schema: &Schema) -> Result<TransformProgram, BackendError> {
    let target = required_str(params, "target")?;
    require_columns(schema, &[target.to_string()])?;
    let holdout_every = optional_usize(params, "holdout_every")?.unwrap_or(5);
    if holdout_every < 2 {
        return Err(unsupported("'holdout_every' must be at least 2"));
    }
    Ok(TransformProgram::new(vec![Step::BaselineModel {
        target: target.to_string(),
        holdout_every,
    }]))
}

fn feature_importance(
    params: &Map<String, Value>,
    schema: &Schema,
) -> Result<TransformProgram, BackendError> {
    let target = required_str(params, "target")?;
    require_numeric(schema, target)?;
    Ok(TransformProgram::new(vec![Step::FeatureImportance {
        target: target.to_string(),
    }]))
}
