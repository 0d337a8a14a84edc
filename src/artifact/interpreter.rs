//! Step interpreter.
//!
//! Applies a [`TransformProgram`] to a dataset. The interpreter checks the
//! cancellation flag and the resource ceilings between steps. Network and
//! process steps are always refused here; file steps are honoured only inside
//! the task's declared scope.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::trace;

use super::analytics;
use chrono::{DateTime, NaiveDate, NaiveDateTime};

use super::program::{DatetimePart, Expr, FillStrategy, JoinKind, Step, TransformProgram};
use crate::data::dataset::{cell, cell_mut, row_key};
use crate::data::quality::mean_std;
use crate::data::{DataRef, DataType, Dataset};
use crate::error::ExecutionError;
use crate::task::IoScope;

/// Datasets a program merges in, loaded ahead of the run.
pub type Sources = HashMap<DataRef, Dataset>;

/// Limits and flags for one interpreter run.
pub struct RunControl<'a> {
    pub cancel: &'a AtomicBool,
    pub max_rows: usize,
    pub max_bytes: usize,
    pub scope: &'a IoScope,
    /// Skip file side effects (used for validation dry runs).
    pub dry_run: bool,
    /// Preloaded `merge` sources. A dry run passes over a source that is
    /// missing here; a real run fails on it.
    pub sources: Option<&'a Sources>,
}

/// Run every step of `program` over `input`.
///
/// # Errors
///
/// Returns the first step failure, `Cancelled` when the flag is raised, or a
/// limit error when the working dataset grows past a ceiling.
pub fn run_program(
    program: &TransformProgram,
    input: Dataset,
    control: &RunControl<'_>,
) -> Result<Dataset, ExecutionError> {
    let mut data = input;
    check_limits(&data, control)?;
    for (idx, step) in program.steps.iter().enumerate() {
        if control.cancel.load(Ordering::SeqCst) {
            return Err(ExecutionError::Cancelled);
        }
        trace!(step = idx, op = step.name(), rows = data.row_count(), "Applying step");
        data = apply_step(step, data, control)?;
        check_limits(&data, control)?;
    }
    Ok(data)
}

fn check_limits(data: &Dataset, control: &RunControl<'_>) -> Result<(), ExecutionError> {
    if data.row_count() > control.max_rows {
        return Err(ExecutionError::RowLimitExceeded {
            rows: data.row_count(),
            limit: control.max_rows,
        });
    }
    let used = data.estimated_bytes();
    if used > control.max_bytes {
        return Err(ExecutionError::MemoryExceeded {
            used,
            limit: control.max_bytes,
        });
    }
    Ok(())
}

pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// JSON number for `x`; non-finite values become null.
pub(crate) fn num(x: f64) -> Value {
    serde_json::Number::from_f64(x)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn apply_step(step: &Step, data: Dataset, control: &RunControl<'_>) -> Result<Dataset, ExecutionError> {
    match step {
        Step::SelectColumns { columns } => select_columns(data, columns),
        Step::DropColumns { columns } => {
            for c in columns {
                data.column_index(c)?;
            }
            let keep: Vec<String> = data
                .columns
                .iter()
                .filter(|c| !columns.contains(c))
                .cloned()
                .collect();
            select_columns(data, &keep)
        }
        Step::RenameColumn { from, to } => {
            let idx = data.column_index(from)?;
            if from != to && data.has_column(to) {
                return Err(ExecutionError::InvalidStep(format!(
                    "cannot rename '{}' to existing column '{}'",
                    from, to
                )));
            }
            let mut data = data;
            data.columns[idx] = to.clone();
            Ok(data)
        }
        Step::CastColumn { column, to } => cast_column(data, column, *to),
        Step::Merge { source, on, how } => {
            if !control.scope.can_read_ref(source) {
                return Err(ExecutionError::CapabilityDenied(format!("dataset read {}", source)));
            }
            match control.sources.and_then(|loaded| loaded.get(source)) {
                Some(right) => merge(data, right, on, *how),
                None if control.dry_run => Ok(data),
                None => Err(ExecutionError::Io(format!("merge source {} was not loaded", source))),
            }
        }
        Step::NormalizeText {
            column,
            lowercase,
            trim,
        } => {
            let idx = data.column_index(column)?;
            let mut data = data;
            for row in &mut data.rows {
                if let Value::String(s) = cell(row, idx) {
                    let mut out = if *trim { s.trim().to_string() } else { s.clone() };
                    if *lowercase {
                        out = out.to_lowercase();
                    }
                    *cell_mut(row, idx) = Value::String(out);
                }
            }
            Ok(data)
        }
        Step::FillMissing {
            column,
            strategy,
            value,
        } => fill_missing(data, column.as_deref(), *strategy, value.as_ref()),
        Step::DropDuplicates { subset } => {
            let indices = match subset {
                Some(cols) => column_indices(&data, cols)?,
                None => (0..data.column_count()).collect(),
            };
            let mut seen = HashSet::new();
            let mut data = data;
            data.rows.retain(|row| {
                let key: Vec<Value> = indices.iter().map(|i| cell(row, *i).clone()).collect();
                seen.insert(row_key(&key))
            });
            Ok(data)
        }
        Step::DropMissingRows { columns } => {
            let indices = match columns {
                Some(cols) => column_indices(&data, cols)?,
                None => (0..data.column_count()).collect(),
            };
            let mut data = data;
            data.rows
                .retain(|row| indices.iter().all(|i| !cell(row, *i).is_null()));
            Ok(data)
        }
        Step::ClipOutliers { column, z } => {
            if *z <= 0.0 {
                return Err(ExecutionError::InvalidStep(
                    "clip_outliers z must be positive".to_string(),
                ));
            }
            let idx = data.column_index(column)?;
            let values: Vec<f64> = data.numeric_column(column)?.into_iter().flatten().collect();
            let mut data = data;
            if let Some((mean, std)) = mean_std(&values) {
                let (lo, hi) = (mean - z * std, mean + z * std);
                for row in &mut data.rows {
                    if let Some(v) = as_f64(cell(row, idx)) {
                        if v < lo || v > hi {
                            *cell_mut(row, idx) = num(v.clamp(lo, hi));
                        }
                    }
                }
            }
            Ok(data)
        }
        Step::Derive { name, expr } => {
            let mut series = HashMap::new();
            for col in expr.columns() {
                if !series.contains_key(col) {
                    series.insert(col.to_string(), data.numeric_column(col)?);
                }
            }
            let values: Vec<Value> = (0..data.row_count())
                .map(|row| eval(expr, &series, row).map(num).unwrap_or(Value::Null))
                .collect();
            Ok(set_column(data, name, values))
        }
        Step::Interaction { columns, name } => {
            if columns.len() < 2 {
                return Err(ExecutionError::InvalidStep(
                    "interaction needs at least two columns".to_string(),
                ));
            }
            let series: Vec<Vec<Option<f64>>> = columns
                .iter()
                .map(|c| data.numeric_column(c))
                .collect::<Result<_, _>>()?;
            let values = (0..data.row_count())
                .map(|row| {
                    series
                        .iter()
                        .try_fold(1.0, |acc, s| s[row].map(|v| acc * v))
                        .map(num)
                        .unwrap_or(Value::Null)
                })
                .collect();
            let name = name.clone().unwrap_or_else(|| columns.join("_x_"));
            Ok(set_column(data, &name, values))
        }
        Step::OneHotEncode {
            column,
            prefix,
            max_categories,
        } => one_hot(data, column, prefix.as_deref(), *max_categories),
        Step::DatetimeParts {
            column,
            parts,
            prefix,
        } => datetime_parts(data, column, parts, prefix.as_deref()),
        Step::DropConstantColumns => {
            let keep: Vec<String> = data
                .columns
                .iter()
                .enumerate()
                .filter(|(idx, _)| {
                    let distinct: HashSet<String> = data
                        .column_values(*idx)
                        .filter(|v| !v.is_null())
                        .map(|v| v.to_string())
                        .collect();
                    distinct.len() > 1
                })
                .map(|(_, c)| c.clone())
                .collect();
            select_columns(data, &keep)
        }
        Step::DropCorrelatedColumns { threshold } => {
            let names = analytics::numeric_column_names(&data);
            let series: Vec<Vec<Option<f64>>> = names
                .iter()
                .map(|n| data.numeric_column(n))
                .collect::<Result<_, _>>()?;
            let mut dropped: HashSet<usize> = HashSet::new();
            for i in 0..names.len() {
                if dropped.contains(&i) {
                    continue;
                }
                for j in (i + 1)..names.len() {
                    if dropped.contains(&j) {
                        continue;
                    }
                    if let Some(r) = analytics::pearson(&series[i], &series[j]) {
                        if r.abs() > *threshold {
                            dropped.insert(j);
                        }
                    }
                }
            }
            let dropped_names: HashSet<&String> = dropped.iter().map(|i| &names[*i]).collect();
            let keep: Vec<String> = data
                .columns
                .iter()
                .filter(|c| !dropped_names.contains(c))
                .cloned()
                .collect();
            select_columns(data, &keep)
        }
        Step::SampleRows { max_rows } => {
            if *max_rows == 0 {
                return Err(ExecutionError::InvalidStep(
                    "sample_rows max_rows must be positive".to_string(),
                ));
            }
            let n = data.row_count();
            if n <= *max_rows {
                return Ok(data);
            }
            let stride = n.div_ceil(*max_rows);
            let mut data = data;
            data.rows = data.rows.into_iter().step_by(stride).collect();
            Ok(data)
        }
        Step::Describe { columns } => analytics::describe(&data, columns.as_deref()),
        Step::Correlate { columns } => analytics::correlate(&data, columns.as_deref()),
        Step::BaselineModel {
            target,
            holdout_every,
        } => analytics::baseline_model(&data, target, *holdout_every),
        Step::FeatureImportance { target } => analytics::feature_importance(&data, target),
        Step::Export { path } => {
            if !control.scope.can_write(path) {
                return Err(ExecutionError::CapabilityDenied(format!(
                    "file write {}",
                    path.display()
                )));
            }
            if !control.dry_run {
                let body = serde_json::to_vec_pretty(&data.to_records())
                    .map_err(|e| ExecutionError::Io(e.to_string()))?;
                std::fs::write(path, body).map_err(|e| ExecutionError::Io(e.to_string()))?;
            }
            Ok(data)
        }
        Step::Load { path } => {
            if !control.scope.can_read(path) {
                return Err(ExecutionError::CapabilityDenied(format!(
                    "file read {}",
                    path.display()
                )));
            }
            if control.dry_run {
                return Ok(data);
            }
            let raw = std::fs::read_to_string(path).map_err(|e| ExecutionError::Io(e.to_string()))?;
            let value: Value =
                serde_json::from_str(&raw).map_err(|e| ExecutionError::Io(e.to_string()))?;
            Dataset::from_json_value(value).map_err(|e| ExecutionError::Io(e.to_string()))
        }
        Step::Fetch { url } => Err(ExecutionError::CapabilityDenied(format!(
            "network access to {}",
            url
        ))),
        Step::Shell { command } => Err(ExecutionError::CapabilityDenied(format!(
            "process spawn '{}'",
            command
        ))),
    }
}

fn column_indices(data: &Dataset, columns: &[String]) -> Result<Vec<usize>, ExecutionError> {
    columns.iter().map(|c| data.column_index(c)).collect()
}

fn select_columns(data: Dataset, columns: &[String]) -> Result<Dataset, ExecutionError> {
    let indices = column_indices(&data, columns)?;
    let rows = data
        .rows
        .into_iter()
        .map(|row| indices.iter().map(|i| cell(&row, *i).clone()).collect())
        .collect();
    Ok(Dataset::new(columns.to_vec(), rows))
}

/// Replace `name` if it exists, otherwise append it.
fn key_of(row: &[Value], indices: &[usize]) -> String {
    let key: Vec<Value> = indices.iter().map(|i| cell(row, *i).clone()).collect();
    row_key(&key)
}

/// Join `right` onto `left` by the `on` columns. Output rows follow the left
/// order (each left row expanded by its matches in right order); an outer
/// join then appends unmatched right rows. Null keys match each other.
fn merge(left: Dataset, right: &Dataset, on: &[String], how: JoinKind) -> Result<Dataset, ExecutionError> {
    if on.is_empty() {
        return Err(ExecutionError::InvalidStep(
            "merge needs at least one key column".to_string(),
        ));
    }
    let left_keys = column_indices(&left, on)?;
    let right_keys = column_indices(right, on)?;
    let right_rest: Vec<usize> = (0..right.columns.len())
        .filter(|i| !right_keys.contains(i))
        .collect();

    let width = left.columns.len();
    let mut columns = left.columns.clone();
    for i in &right_rest {
        let name = &right.columns[*i];
        if left.has_column(name) {
            columns.push(format!("{}_right", name));
        } else {
            columns.push(name.clone());
        }
    }

    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (r, row) in right.rows.iter().enumerate() {
        index.entry(key_of(row, &right_keys)).or_default().push(r);
    }
    let right_part = |r: usize| right_rest.iter().map(move |i| cell(&right.rows[r], *i).clone());

    let mut matched = vec![false; right.rows.len()];
    let mut rows = Vec::with_capacity(left.rows.len());
    for row in &left.rows {
        let mut base = row.clone();
        base.resize(width, Value::Null);
        match index.get(&key_of(row, &left_keys)) {
            Some(hits) => {
                for r in hits {
                    matched[*r] = true;
                    let mut out = base.clone();
                    out.extend(right_part(*r));
                    rows.push(out);
                }
            }
            None if how != JoinKind::Inner => {
                base.resize(columns.len(), Value::Null);
                rows.push(base);
            }
            None => {}
        }
    }
    if how == JoinKind::Outer {
        for (r, row) in right.rows.iter().enumerate() {
            if matched[r] {
                continue;
            }
            let mut out = vec![Value::Null; width];
            for (l, ri) in left_keys.iter().zip(&right_keys) {
                out[*l] = cell(row, *ri).clone();
            }
            out.extend(right_part(r));
            rows.push(out);
        }
    }
    Ok(Dataset::new(columns, rows))
}

fn category_label(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Categories come out in sorted order; a null row gets 0 everywhere.
fn one_hot(
    data: Dataset,
    column: &str,
    prefix: Option<&str>,
    max_categories: usize,
) -> Result<Dataset, ExecutionError> {
    let idx = data.column_index(column)?;
    let labels: Vec<Option<String>> = data.column_values(idx).map(category_label).collect();
    let categories: BTreeSet<&str> = labels.iter().flatten().map(String::as_str).collect();
    if categories.len() > max_categories {
        return Err(ExecutionError::InvalidStep(format!(
            "column '{}' has {} categories, more than the {} allowed",
            column,
            categories.len(),
            max_categories
        )));
    }

    let prefix = prefix.unwrap_or(column);
    let keep: Vec<String> = data
        .columns
        .iter()
        .filter(|c| c.as_str() != column)
        .cloned()
        .collect();
    let mut out = select_columns(data, &keep)?;
    for category in categories {
        let values = labels
            .iter()
            .map(|label| Value::from(i64::from(label.as_deref() == Some(category))))
            .collect();
        out = set_column(out, &format!("{}_{}", prefix, category), values);
    }
    Ok(out)
}

/// RFC 3339 (wall-clock fields kept), `YYYY-MM-DD[ HH:MM[:SS]]` or the same
/// with a `T` separator.
fn parse_datetime(value: &Value) -> Option<NaiveDateTime> {
    let text = value.as_str()?.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.naive_local());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(at) = NaiveDateTime::parse_from_str(text, format) {
            return Some(at);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
}

fn datetime_parts(
    data: Dataset,
    column: &str,
    parts: &[DatetimePart],
    prefix: Option<&str>,
) -> Result<Dataset, ExecutionError> {
    if parts.is_empty() {
        return Err(ExecutionError::InvalidStep(
            "datetime_parts needs at least one part".to_string(),
        ));
    }
    let idx = data.column_index(column)?;
    let parsed: Vec<Option<NaiveDateTime>> = data.column_values(idx).map(parse_datetime).collect();
    let prefix = prefix.unwrap_or(column).to_string();
    let mut out = data;
    for part in parts {
        let values = parsed
            .iter()
            .map(|at| at.map_or(Value::Null, |at| Value::from(part.extract(&at))))
            .collect();
        out = set_column(out, &format!("{}_{}", prefix, part.as_str()), values);
    }
    Ok(out)
}

fn set_column(mut data: Dataset, name: &str, values: Vec<Value>) -> Dataset {
    match data.columns.iter().position(|c| c == name) {
        Some(idx) => {
            for (row, v) in data.rows.iter_mut().zip(values) {
                *cell_mut(row, idx) = v;
            }
        }
        None => {
            let idx = data.columns.len();
            data.columns.push(name.to_string());
            for (row, v) in data.rows.iter_mut().zip(values) {
                *cell_mut(row, idx) = v;
            }
        }
    }
    data
}

fn eval(expr: &Expr, series: &HashMap<String, Vec<Option<f64>>>, row: usize) -> Option<f64> {
    let out = match expr {
        Expr::Column(name) => series.get(name)?[row]?,
        Expr::Literal(v) => *v,
        Expr::Add(a, b) => eval(a, series, row)? + eval(b, series, row)?,
        Expr::Sub(a, b) => eval(a, series, row)? - eval(b, series, row)?,
        Expr::Mul(a, b) => eval(a, series, row)? * eval(b, series, row)?,
        Expr::Div(a, b) => {
            let denom = eval(b, series, row)?;
            if denom == 0.0 {
                return None;
            }
            eval(a, series, row)? / denom
        }
        Expr::Neg(e) => -eval(e, series, row)?,
        Expr::Log(e) => {
            let v = eval(e, series, row)?;
            if v <= -1.0 {
                return None;
            }
            v.ln_1p()
        }
        Expr::Abs(e) => eval(e, series, row)?.abs(),
        Expr::Pow(a, b) => eval(a, series, row)?.powf(eval(b, series, row)?),
    };
    out.is_finite().then_some(out)
}

fn cast_column(data: Dataset, column: &str, to: DataType) -> Result<Dataset, ExecutionError> {
    let idx = data.column_index(column)?;
    let mut data = data;
    for row in &mut data.rows {
        let value = cell(row, idx);
        if value.is_null() {
            continue;
        }
        let cast = cast_value(value, to).ok_or_else(|| {
            ExecutionError::InvalidStep(format!(
                "cannot cast {} in column '{}' to {}",
                value, column, to
            ))
        })?;
        *cell_mut(row, idx) = cast;
    }
    Ok(data)
}

fn cast_value(value: &Value, to: DataType) -> Option<Value> {
    match to {
        DataType::Float => match value {
            Value::Number(n) => n.as_f64().map(num),
            Value::String(s) => s.trim().parse::<f64>().ok().map(num),
            Value::Bool(b) => Some(num(if *b { 1.0 } else { 0.0 })),
            _ => None,
        },
        DataType::Integer => {
            let f = match value {
                Value::Number(n) => n.as_f64()?,
                Value::String(s) => s.trim().parse::<f64>().ok()?,
                Value::Bool(b) => f64::from(u8::from(*b)),
                _ => return None,
            };
            (f.is_finite() && f.fract() == 0.0).then(|| Value::from(f as i64))
        }
        DataType::String => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        DataType::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::Number(n) => match n.as_f64()? {
                v if v == 0.0 => Some(Value::Bool(false)),
                v if v == 1.0 => Some(Value::Bool(true)),
                _ => None,
            },
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        DataType::Null | DataType::Mixed => None,
    }
}

fn fill_missing(
    data: Dataset,
    column: Option<&str>,
    strategy: FillStrategy,
    value: Option<&Value>,
) -> Result<Dataset, ExecutionError> {
    let targets: Vec<usize> = match column {
        Some(c) => vec![data.column_index(c)?],
        None => (0..data.column_count()).collect(),
    };
    let schema = data.schema();
    let mut data = data;

    for idx in targets {
        let name = data.columns[idx].clone();
        let fill = match strategy {
            FillStrategy::Drop => {
                data.rows.retain(|row| !cell(row, idx).is_null());
                continue;
            }
            FillStrategy::Constant => value.cloned().ok_or_else(|| {
                ExecutionError::InvalidStep("fill_missing constant needs a value".to_string())
            })?,
            FillStrategy::Mean | FillStrategy::Median => {
                let numeric = schema
                    .field(&name)
                    .map(|f| f.dtype.is_numeric())
                    .unwrap_or(false);
                if !numeric {
                    // Whole-table fills only touch numeric columns.
                    if column.is_none() {
                        continue;
                    }
                    data.numeric_column(&name)?;
                }
                let mut values: Vec<f64> =
                    data.numeric_column(&name)?.into_iter().flatten().collect();
                let stat = if strategy == FillStrategy::Mean {
                    mean_std(&values).map(|(m, _)| m)
                } else {
                    median(&mut values)
                };
                match stat {
                    Some(v) => num(v),
                    None => continue,
                }
            }
            FillStrategy::Mode => match mode(&data, idx) {
                Some(v) => v,
                None => continue,
            },
        };
        for row in &mut data.rows {
            let slot = cell_mut(row, idx);
            if slot.is_null() {
                *slot = fill.clone();
            }
        }
    }
    Ok(data)
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Most frequent non-null value; ties go to the first seen.
fn mode(data: &Dataset, idx: usize) -> Option<Value> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut firsts: Vec<&Value> = Vec::new();
    for v in data.column_values(idx).filter(|v| !v.is_null()) {
        let key = v.to_string();
        let order = firsts.len();
        let entry = counts.entry(key).or_insert_with(|| (0, order));
        if entry.1 == order {
            firsts.push(v);
        }
        entry.0 += 1;
    }
    counts
        .values()
        .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        .map(|(_, order)| firsts[*order].clone())
}
