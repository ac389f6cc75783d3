//! Row decoding and the query-parameter union.
//!
//! Postgres values become JSON by driver type name; anything unrecognised
//! falls through a chain of decode attempts and ends as a hex string or null
//! rather than an error.

use crate::error::ServerError;
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};

/// The closed set of parameter types accepted from tool arguments. Values are
/// bound positionally as `$1, $2, ...`; no type inference is attempted.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl QueryParam {
    /// Map a JSON argument value into the union. Arrays and objects are
    /// rejected: they have no single Postgres binding without inference.
    pub fn from_json(value: &Value) -> Result<Self, ServerError> {
        match value {
            Value::Null => Ok(QueryParam::Null),
            Value::Bool(b) => Ok(QueryParam::Bool(*b)),
            Value::String(s) => Ok(QueryParam::Text(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(QueryParam::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(QueryParam::Float(f))
                } else {
                    Err(ServerError::validation(format!(
                        "Unsupported numeric parameter: {n}"
                    )))
                }
            }
            Value::Array(_) | Value::Object(_) => Err(ServerError::validation(
                "Query parameters must be strings, numbers, booleans, or null",
            )),
        }
    }

    pub fn from_json_array(values: &[Value]) -> Result<Vec<Self>, ServerError> {
        values.iter().map(Self::from_json).collect()
    }
}

/// Bind the union members onto a sqlx query in order.
pub fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[QueryParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            QueryParam::Text(s) => query.bind(s.clone()),
            QueryParam::Int(i) => query.bind(*i),
            QueryParam::Float(f) => query.bind(*f),
            QueryParam::Bool(b) => query.bind(*b),
            // An untyped NULL; Postgres infers the slot type from context.
            QueryParam::Null => query.bind(None::<String>),
        };
    }
    query
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "dataType")]
    pub type_name: String,
}

pub fn field_descriptions(row: &PgRow) -> Vec<FieldInfo> {
    row.columns()
        .iter()
        .map(|col| FieldInfo {
            name: col.name().to_string(),
            type_name: col.type_info().name().to_string(),
        })
        .collect()
}

pub fn row_to_json(row: &PgRow) -> Map<String, Value> {
    let mut map = Map::new();
    for (idx, col) in row.columns().iter().enumerate() {
        map.insert(col.name().to_string(), column_to_json(row, idx, col));
    }
    map
}

fn column_to_json(row: &PgRow, idx: usize, col: &sqlx::postgres::PgColumn) -> Value {
    match col.type_info().name() {
        "BOOL" => {
            if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
                return v.map(Value::Bool).unwrap_or(Value::Null);
            }
        }
        "INT2" => {
            if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
                return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
            }
        }
        "INT4" => {
            if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
                return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
            }
        }
        "INT8" => {
            if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
                return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
            }
        }
        "FLOAT4" => {
            if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
                return float_value(v.map(f64::from));
            }
        }
        "FLOAT8" => {
            if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
                return float_value(v);
            }
        }
        // Kept as a string: NUMERIC precision does not fit a JSON float.
        "NUMERIC" => {
            if let Ok(v) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
                return v.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null);
            }
        }
        "UUID" => {
            if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
                return v.map(|u| Value::String(u.to_string())).unwrap_or(Value::Null);
            }
        }
        "JSON" | "JSONB" => {
            if let Ok(v) = row.try_get::<Option<Value>, _>(idx) {
                return v.unwrap_or(Value::Null);
            }
        }
        "TIMESTAMPTZ" => {
            if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
                return v.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null);
            }
        }
        "TIMESTAMP" => {
            if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
                return v.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null);
            }
        }
        "DATE" => {
            if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
                return v.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null);
            }
        }
        "TIME" => {
            if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
                return v.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null);
            }
        }
        "BYTEA" => {
            if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
                return v
                    .map(|b| Value::String(hex_string(&b)))
                    .unwrap_or(Value::Null);
            }
        }
        _ => {}
    }
    // TEXT, VARCHAR, CHAR, NAME, and the long tail of string-ish types.
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return float_value(v);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v
            .map(|b| Value::String(hex_string(&b)))
            .unwrap_or(Value::Null);
    }
    Value::Null
}

fn float_value(v: Option<f64>) -> Value {
    v.and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
