//! Summary-producing steps: describe, correlate, baseline model and feature
//! importance. Each replaces the working dataset with a small result table.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use super::interpreter::{as_f64, num};
use crate::data::quality::mean_std;
use crate::data::{DataType, Dataset};
use crate::error::ExecutionError;

/// Pearson correlation over rows where both values are present.
///
/// Returns `None` with fewer than two complete pairs or zero variance.
pub fn pearson(xs: &[Option<f64>], ys: &[Option<f64>]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys.iter())
        .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
        .collect();
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mx = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let my = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (x, y) in &pairs {
        cov += (x - mx) * (y - my);
        vx += (x - mx).powi(2);
        vy += (y - my).powi(2);
    }
    if vx == 0.0 || vy == 0.0 {
        return None;
    }
    Some(cov / (vx.sqrt() * vy.sqrt()))
}

/// Names of columns whose inferred type is integer or float.
pub fn numeric_column_names(dataset: &Dataset) -> Vec<String> {
    dataset
        .schema()
        .fields
        .into_iter()
        .filter(|f| f.dtype.is_numeric())
        .map(|f| f.name)
        .collect()
}

pub fn describe(dataset: &Dataset, columns: Option<&[String]>) -> Result<Dataset, ExecutionError> {
    let names: Vec<String> = match columns {
        Some(cols) => cols.to_vec(),
        None => dataset.columns.clone(),
    };
    let schema = dataset.schema();

    let header = [
        "column", "dtype", "count", "missing", "unique", "mean", "std", "min", "max",
    ];
    let mut rows = Vec::with_capacity(names.len());
    for name in &names {
        let idx = dataset.column_index(name)?;
        let dtype = schema
            .field(name)
            .map(|f| f.dtype)
            .unwrap_or(DataType::Null);
        let count = dataset.column_values(idx).filter(|v| !v.is_null()).count();
        let missing = dataset.row_count() - count;
        let unique: BTreeSet<String> = dataset
            .column_values(idx)
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .collect();

        let values: Vec<f64> = dataset.column_values(idx).filter_map(as_f64).collect();
        let (mean, std, min, max) = match (dtype.is_numeric(), mean_std(&values)) {
            (true, Some((mean, std))) => {
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                (num(mean), num(std), num(min), num(max))
            }
            _ => (Value::Null, Value::Null, Value::Null, Value::Null),
        };

        rows.push(vec![
            Value::from(name.as_str()),
            Value::from(dtype.to_string()),
            Value::from(count),
            Value::from(missing),
            Value::from(unique.len()),
            mean,
            std,
            min,
            max,
        ]);
    }
    Ok(Dataset::new(header.iter().map(|s| s.to_string()).collect(), rows))
}

pub fn correlate(dataset: &Dataset, columns: Option<&[String]>) -> Result<Dataset, ExecutionError> {
    let names = match columns {
        Some(cols) => cols.to_vec(),
        None => numeric_column_names(dataset),
    };
    let series: Vec<Vec<Option<f64>>> = names
        .iter()
        .map(|n| dataset.numeric_column(n))
        .collect::<Result<_, _>>()?;

    let mut header = vec!["column".to_string()];
    header.extend(names.iter().cloned());

    let rows = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mut row = vec![Value::from(name.as_str())];
            row.extend(series.iter().map(|other| {
                pearson(&series[i], other).map(num).unwrap_or(Value::Null)
            }));
            row
        })
        .collect();
    Ok(Dataset::new(header, rows))
}

/// Mean (regression) or majority-class (classification) predictor scored on
/// every `holdout_every`-th row.
pub fn baseline_model(
    dataset: &Dataset,
    target: &str,
    holdout_every: usize,
) -> Result<Dataset, ExecutionError> {
    if holdout_every < 2 {
        return Err(ExecutionError::InvalidStep(
            "holdout_every must be at least 2".to_string(),
        ));
    }
    let idx = dataset.column_index(target)?;
    let labelled: Vec<&Value> = dataset
        .column_values(idx)
        .filter(|v| !v.is_null())
        .collect();
    if labelled.len() < 2 {
        return Err(ExecutionError::InvalidStep(format!(
            "baseline_model needs at least 2 labelled rows, found {}",
            labelled.len()
        )));
    }

    let (train, test): (Vec<(usize, &Value)>, Vec<(usize, &Value)>) = labelled
        .into_iter()
        .enumerate()
        .partition(|(i, _)| i % holdout_every != 0);
    let train: Vec<&Value> = train.into_iter().map(|(_, v)| v).collect();
    let test: Vec<&Value> = test.into_iter().map(|(_, v)| v).collect();

    let header: Vec<String> = [
        "target", "model", "prediction", "metric", "value", "train_rows", "test_rows",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let row = |model: &str, prediction: Value, metric: &str, value: f64| {
        vec![
            Value::from(target),
            Value::from(model),
            prediction,
            Value::from(metric),
            num(value),
            Value::from(train.len()),
            Value::from(test.len()),
        ]
    };

    let numeric = train.iter().chain(test.iter()).all(|v| as_f64(v).is_some());
    if numeric {
        let train_y: Vec<f64> = train.iter().filter_map(|v| as_f64(v)).collect();
        let test_y: Vec<f64> = test.iter().filter_map(|v| as_f64(v)).collect();
        let (prediction, _) = mean_std(&train_y).ok_or_else(|| {
            ExecutionError::InvalidStep("empty training split".to_string())
        })?;
        let n = test_y.len() as f64;
        let mae = test_y.iter().map(|y| (y - prediction).abs()).sum::<f64>() / n;
        let rmse = (test_y.iter().map(|y| (y - prediction).powi(2)).sum::<f64>() / n).sqrt();
        Ok(Dataset::new(
            header,
            vec![
                row("mean", num(prediction), "mae", mae),
                row("mean", num(prediction), "rmse", rmse),
            ],
        ))
    } else {
        let mut counts: HashMap<String, (usize, usize, &Value)> = HashMap::new();
        for (order, v) in train.iter().enumerate() {
            let entry = counts.entry(v.to_string()).or_insert((0, order, v));
            entry.0 += 1;
        }
        let (_, _, majority) = counts
            .values()
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
            .copied()
            .ok_or_else(|| ExecutionError::InvalidStep("empty training split".to_string()))?;
        let correct = test.iter().filter(|v| **v == majority).count();
        let accuracy = correct as f64 / test.len() as f64;
        Ok(Dataset::new(
            header,
            vec![row("majority", majority.clone(), "accuracy", accuracy)],
        ))
    }
}

/// |pearson r| of every other numeric column against a numeric target,
/// highest first.
pub fn feature_importance(dataset: &Dataset, target: &str) -> Result<Dataset, ExecutionError> {
    let y = dataset.numeric_column(target)?;
    let mut scored: Vec<(String, f64)> = numeric_column_names(dataset)
        .into_iter()
        .filter(|name| name != target)
        .map(|name| {
            let x = dataset.numeric_column(&name)?;
            let r = pearson(&x, &y).map(f64::abs).unwrap_or(0.0);
            Ok((name, r))
        })
        .collect::<Result<_, ExecutionError>>()?;
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let rows = scored
        .into_iter()
        .enumerate()
        .map(|(rank, (name, importance))| {
            vec![Value::from(name), num(importance), Value::from(rank + 1)]
        })
        .collect();
    Ok(Dataset::new(
        vec!["feature".to_string(), "importance".to_string(), "rank".to_string()],
        rows,
    ))
}
