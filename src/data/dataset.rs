//! Tabular dataset and schema descriptor.
//!
//! Datasets are row-major tables of JSON cells. They are the only data the
//! executor operates on; upstream sources hand them over as blobs referenced
//! by a [`DataRef`](super::DataRef).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ExecutionError;

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Integer,
    Float,
    Boolean,
    String,
    /// Only nulls observed.
    Null,
    /// More than one non-null type observed.
    Mixed,
}

impl DataType {
    /// Type of a single cell.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => DataType::Null,
            Value::Bool(_) => DataType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => DataType::Integer,
            Value::Number(_) => DataType::Float,
            Value::String(_) => DataType::String,
            Value::Array(_) | Value::Object(_) => DataType::Mixed,
        }
    }

    /// Whether values of this type can be read as `f64`.
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Float)
    }

    /// Whether a column of type `self` satisfies an expected type.
    ///
    /// Integers satisfy floats and all-null columns satisfy anything.
    pub fn conforms_to(&self, expected: DataType) -> bool {
        *self == expected
            || *self == DataType::Null
            || (*self == DataType::Integer && expected == DataType::Float)
    }

    fn merge(self, other: DataType) -> DataType {
        match (self, other) {
            (a, b) if a == b => a,
            (DataType::Null, b) => b,
            (a, DataType::Null) => a,
            (DataType::Integer, DataType::Float) | (DataType::Float, DataType::Integer) => {
                DataType::Float
            }
            _ => DataType::Mixed,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
            DataType::String => "string",
            DataType::Null => "null",
            DataType::Mixed => "mixed",
        };
        write!(f, "{}", s)
    }
}

/// A named, typed column in a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub dtype: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Schema descriptor for a dataset.
///
/// When used as an *expected* schema, every listed field must be present in
/// the output with a conforming type; extra output columns are allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Builder-style helper for expected schemas.
    pub fn with_field(mut self, name: impl Into<String>, dtype: DataType) -> Self {
        self.fields.push(Field::new(name, dtype));
        self
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Check that `actual` carries every field of `self`.
    ///
    /// Returns the list of human-readable mismatches (empty when conformant).
    pub fn mismatches(&self, actual: &Schema) -> Vec<String> {
        let mut problems = Vec::new();
        for expected in &self.fields {
            match actual.field(&expected.name) {
                None => problems.push(format!("missing column '{}'", expected.name)),
                Some(found) if !found.dtype.conforms_to(expected.dtype) => problems.push(format!(
                    "column '{}' has type {} but {} was expected",
                    expected.name, found.dtype, expected.dtype
                )),
                Some(_) => {}
            }
        }
        problems
    }
}

static NULL: Value = Value::Null;

/// Cell `idx` of `row`; a row shorter than the header reads as null there.
pub(crate) fn cell(row: &[Value], idx: usize) -> &Value {
    row.get(idx).unwrap_or(&NULL)
}

/// Mutable cell `idx` of `row`, widening the row with nulls if it is short.
pub(crate) fn cell_mut(row: &mut Vec<Value>, idx: usize) -> &mut Value {
    if row.len() <= idx {
        row.resize(idx + 1, Value::Null);
    }
    &mut row[idx]
}

/// Row-major table of JSON cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Dataset {
    /// Create a dataset, padding or truncating rows to the column count.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, Value::Null);
                row
            })
            .collect();
        Self { columns, rows }
    }

    /// Build a dataset from a list of JSON objects.
    ///
    /// Column order follows first appearance across records.
    pub fn from_records(records: &[Map<String, Value>]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    /// Parse either a JSON array of objects or `{"columns": .., "rows": ..}`.
    pub fn from_json_value(value: Value) -> Result<Self, serde_json::Error> {
        match value {
            Value::Array(items) => {
                let records: Vec<Map<String, Value>> = items
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<Result<_, _>>()?;
                Ok(Self::from_records(&records))
            }
            other => {
                let ds: Dataset = serde_json::from_value(other)?;
                Ok(Self::new(ds.columns, ds.rows))
            }
        }
    }

    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, ExecutionError> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| ExecutionError::ColumnNotFound(name.to_string()))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Iterate the cells of one column.
    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &Value> {
        self.rows.iter().map(move |row| cell(row, idx))
    }

    /// Numeric view of a column; nulls become `None`.
    ///
    /// Fails when a non-null cell is not a number.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<Option<f64>>, ExecutionError> {
        let idx = self.column_index(name)?;
        self.column_values(idx)
            .map(|v| match v {
                Value::Null => Ok(None),
                Value::Number(n) => Ok(n.as_f64()),
                other => Err(ExecutionError::NotNumeric {
                    column: name.to_string(),
                    detail: format!("found {}", DataType::of(other)),
                }),
            })
            .collect()
    }

    /// Infer the schema from the cells.
    pub fn schema(&self) -> Schema {
        let fields = self
            .columns
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let dtype = self
                    .column_values(idx)
                    .fold(DataType::Null, |acc, v| acc.merge(DataType::of(v)));
                Field::new(name.clone(), dtype)
            })
            .collect();
        Schema { fields }
    }

    /// Pad or truncate every row to the header width.
    pub fn normalized(self) -> Self {
        Self::new(self.columns, self.rows)
    }

    /// Deterministic head sample used for dry runs.
    pub fn head(&self, n: usize) -> Dataset {
        Dataset {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Same columns, no rows.
    pub fn empty_like(&self) -> Dataset {
        Dataset {
            columns: self.columns.clone(),
            rows: Vec::new(),
        }
    }

    /// Rough in-memory footprint used for the executor's memory ceiling.
    pub fn estimated_bytes(&self) -> usize {
        let header: usize = self.columns.iter().map(|c| c.len() + 24).sum();
        let cells: usize = self
            .rows
            .iter()
            .flat_map(|row| row.iter())
            .map(estimate_value_bytes)
            .sum();
        header + cells
    }

    /// Count of distinct rows.
    pub fn distinct_rows(&self) -> usize {
        let mut seen = BTreeMap::new();
        for row in &self.rows {
            seen.insert(row_key(row), ());
        }
        seen.len()
    }
}

/// Stable textual key for a row, used for duplicate detection.
pub(crate) fn row_key(row: &[Value]) -> String {
    serde_json::to_string(row).unwrap_or_default()
}

fn estimate_value_bytes(value: &Value) -> usize {
    const CELL: usize = 16;
    match value {
        Value::String(s) => CELL + s.len(),
        Value::Array(items) => CELL + items.iter().map(estimate_value_bytes).sum::<usize>(),
        Value::Object(map) => {
            CELL + map
                .iter()
                .map(|(k, v)| k.len() + estimate_value_bytes(v))
                .sum::<usize>()
        }
        _ => CELL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Dataset {
        Dataset::from_json_value(json!([
            {"id": 1, "price": 9.5, "city": "Lyon"},
            {"id": 2, "price": null, "city": "Paris"},
            {"id": 3, "price": 12, "city": null, "extra": true}
        ]))
        .expect("valid records")
    }

    #[test]
    fn test_from_records_column_order_and_padding() {
        let ds = sample();
        assert_eq!(ds.columns, vec!["id", "price", "city", "extra"]);
        assert_eq!(ds.rows[0][3], Value::Null);
        assert_eq!(ds.row_count(), 3);
    }

    #[test]
    fn test_schema_inference_merges_types() {
        let schema = sample().schema();
        assert_eq!(schema.field("id").map(|f| f.dtype), Some(DataType::Integer));
        assert_eq!(schema.field("price").map(|f| f.dtype), Some(DataType::Float));
        assert_eq!(schema.field("city").map(|f| f.dtype), Some(DataType::String));
        assert_eq!(schema.field("extra").map(|f| f.dtype), Some(DataType::Boolean));
    }

    #[test]
    fn test_schema_mismatches() {
        let expected = Schema::default()
            .with_field("price", DataType::Float)
            .with_field("id", DataType::Float)
            .with_field("score", DataType::Float)
            .with_field("city", DataType::Integer);
        let problems = expected.mismatches(&sample().schema());
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.contains("score")));
        assert!(problems.iter().any(|p| p.contains("city")));
    }

    #[test]
    fn test_numeric_column_rejects_strings() {
        let ds = sample();
        assert_eq!(
            ds.numeric_column("price").expect("numeric"),
            vec![Some(9.5), None, Some(12.0)]
        );
        assert!(matches!(
            ds.numeric_column("city"),
            Err(ExecutionError::NotNumeric { .. })
        ));
        assert!(matches!(
            ds.numeric_column("nope"),
            Err(ExecutionError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn test_columnar_json_form() {
        let ds = Dataset::from_json_value(json!({
            "columns": ["a", "b"],
            "rows": [[1], [2, 3]]
        }))
        .expect("columnar form");
        assert_eq!(ds.rows[0], vec![json!(1), Value::Null]);
        assert_eq!(ds.to_records()[1]["b"], json!(3));
    }

    #[test]
    fn test_short_rows_read_as_null() {
        let ragged = Dataset {
            columns: vec!["a".to_string(), "b".to_string()],
            rows: vec![vec![json!(1), json!("x")], vec![json!(2)]],
        };
        let b: Vec<&Value> = ragged.column_values(1).collect();
        assert_eq!(b, vec![&json!("x"), &Value::Null]);
        assert_eq!(ragged.schema().field("b").map(|f| f.dtype), Some(DataType::String));
        assert_eq!(ragged.normalized().rows[1], vec![json!(2), Value::Null]);
    }

    #[test]
    fn test_head_and_distinct() {
        let ds = Dataset::new(
            vec!["x".to_string()],
            vec![vec![json!(1)], vec![json!(1)], vec![json!(2)]],
        );
        assert_eq!(ds.head(2).row_count(), 2);
        assert_eq!(ds.distinct_rows(), 2);
        assert!(ds.estimated_bytes() > 0);
    }
}
