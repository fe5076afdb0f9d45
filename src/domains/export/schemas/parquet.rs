use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use chrono::DateTime;
use serde_json::Value;
use std::collections::HashMap;

use crate::domains::export::types::Row;

/// Number of leading rows sampled when inferring a columnar schema.
pub const SCHEMA_SAMPLE_ROWS: usize = 100;

/// Logical column types the columnar encoder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Utf8,
    Int64,
    Float64,
    Boolean,
    Timestamp,
}

impl ColumnType {
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnType::Utf8 => DataType::Utf8,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Millisecond, None),
        }
    }

    /// Type of a single value, `None` for null.
    pub fn of_value(value: &Value) -> Option<ColumnType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Number(n) if n.is_i64() => Some(ColumnType::Int64),
            Value::Number(_) => Some(ColumnType::Float64),
            Value::String(s) if DateTime::parse_from_rfc3339(s).is_ok() => Some(ColumnType::Timestamp),
            Value::String(_) | Value::Array(_) | Value::Object(_) => Some(ColumnType::Utf8),
        }
    }

    /// Widen two sampled types into one that can hold both.
    pub fn widen(self, other: ColumnType) -> ColumnType {
        match (self, other) {
            (a, b) if a == b => a,
            (ColumnType::Int64, ColumnType::Float64) | (ColumnType::Float64, ColumnType::Int64) => ColumnType::Float64,
            _ => ColumnType::Utf8,
        }
    }
}

/// Infer a nullable schema from the first sampled rows, in first-seen field order.
///
/// Fields that are null in every sampled row default to strings.
pub fn infer_schema(rows: &[Row]) -> Schema {
    let mut order: Vec<String> = Vec::new();
    let mut types: HashMap<String, Option<ColumnType>> = HashMap::new();

    for row in rows.iter().take(SCHEMA_SAMPLE_ROWS) {
        for (name, value) in row {
            let observed = ColumnType::of_value(value);
            match types.get_mut(name) {
                Some(current) => {
                    *current = match (*current, observed) {
                        (Some(a), Some(b)) => Some(a.widen(b)),
                        (a, None) => a,
                        (None, b) => b,
                    };
                }
                None => {
                    order.push(name.clone());
                    types.insert(name.clone(), observed);
                }
            }
        }
    }

    let fields: Vec<Field> = order
        .iter()
        .map(|name| {
            let column_type = types.get(name).copied().flatten().unwrap_or(ColumnType::Utf8);
            Field::new(name, column_type.data_type(), true)
        })
        .collect();

    let mut metadata = HashMap::new();
    metadata.insert("schema_version".to_string(), "1.0".to_string());
    metadata.insert("inferred_from_rows".to_string(), rows.len().min(SCHEMA_SAMPLE_ROWS).to_string());

    Schema::new(fields).with_metadata(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_infers_scalar_types_in_field_order() {
        let rows = vec![row(json!({
            "id": 1,
            "score": 0.5,
            "text": "great product",
            "flagged": false,
            "created_at": "2024-03-01T10:00:00Z",
            "tags": ["a", "b"],
        }))];
        let schema = infer_schema(&rows);
        let types: Vec<(&str, DataType)> = schema
            .fields()
            .iter()
            .map(|f| (f.name().as_str(), f.data_type().clone()))
            .collect();

        assert_eq!(
            types,
            vec![
                ("id", DataType::Int64),
                ("score", DataType::Float64),
                ("text", DataType::Utf8),
                ("flagged", DataType::Boolean),
                ("created_at", DataType::Timestamp(TimeUnit::Millisecond, None)),
                ("tags", DataType::Utf8),
            ]
        );
    }

    #[test]
    fn test_widens_within_sample() {
        let rows = vec![
            row(json!({ "n": 1, "mixed": true, "late": null })),
            row(json!({ "n": 2.5, "mixed": "yes", "late": 7 })),
        ];
        let schema = infer_schema(&rows);
        assert_eq!(schema.field_with_name("n").unwrap().data_type(), &DataType::Float64);
        assert_eq!(schema.field_with_name("mixed").unwrap().data_type(), &DataType::Utf8);
        assert_eq!(schema.field_with_name("late").unwrap().data_type(), &DataType::Int64);
    }

    #[test]
    fn test_all_null_field_defaults_to_string() {
        let schema = infer_schema(&[row(json!({ "empty": null }))]);
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        assert!(schema.field(0).is_nullable());
    }

    #[test]
    fn test_only_first_hundred_rows_are_sampled() {
        let mut rows: Vec<Row> = (0..SCHEMA_SAMPLE_ROWS).map(|i| row(json!({ "v": i }))).collect();
        rows.push(row(json!({ "v": "text" })));
        let schema = infer_schema(&rows);
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
    }
}
