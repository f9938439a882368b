//! Index metadata: field mappings, settings and lifecycle state.

mod types;

pub use types::{
    FieldMapping, FieldType, IndexMeta, IndexSettings, IndexState, PipelineBindings,
};

use crate::error::{Error, Result};
use serde_json::Value;

/// Validate a document's fields against the index mappings.
///
/// Unknown fields are rejected; known fields must carry a JSON value
/// compatible with the declared type.
pub fn validate_document(meta: &IndexMeta, fields: &serde_json::Map<String, Value>) -> Result<()> {
    for (name, value) in fields {
        let mapping = meta
            .mappings
            .get(name)
            .ok_or_else(|| Error::schema(name.clone(), "field is not mapped"))?;
        if value.is_null() {
            continue;
        }
        check_value(name, mapping.field_type, value)?;
    }
    Ok(())
}

fn check_value(field: &str, field_type: FieldType, value: &Value) -> Result<()> {
    let ok = match field_type {
        FieldType::Text | FieldType::Keyword => value.is_string(),
        FieldType::I64 => value.as_i64().is_some(),
        FieldType::F64 => value.is_number(),
        FieldType::Bool => value.is_boolean(),
        FieldType::Date => value.is_string() || value.is_i64() || value.is_u64(),
        FieldType::Object => value.is_object(),
    };
    if !ok {
        return Err(Error::schema(
            field,
            format!("expected {:?}, got {}", field_type, json_kind(value)),
        ));
    }
    if field_type == FieldType::Date {
        parse_date(field, value)?;
    }
    Ok(())
}

/// Parse a date value into epoch milliseconds. Accepts RFC 3339 strings and
/// integer epoch millis.
pub fn parse_date(field: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::schema(field, "date millis out of i64 range")),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| Error::schema(field, format!("invalid date `{}`: {}", s, e))),
        other => Err(Error::schema(
            field,
            format!("expected date, got {}", json_kind(other)),
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
