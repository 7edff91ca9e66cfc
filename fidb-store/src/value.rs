//! Column values and row records.
//!
//! A row is an insertion-ordered JSON object. Everything written through the
//! views is a primitive [`Value`]; rows loaded from disk are kept as raw JSON
//! and checked when a column is read.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::fmt;

/// Reserved column holding the row key.
pub const ID_COLUMN: &str = "id";

/// Reserved column marking a soft-deleted row.
pub const TOMBSTONE_COLUMN: &str = "tombstone";

/// 2^53: every integer up to this magnitude is an exact `f64`.
pub const MAX_EXACT_INTEGER: u64 = 1 << 53;

/// A row record: column name → stored value, in insertion order.
pub type Row = serde_json::Map<String, Json>;

/// A primitive column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    /// Convert a stored JSON value. Objects and arrays yield `None`.
    pub fn from_json(json: &Json) -> Option<Self> {
        match json {
            Json::Null => Some(Value::Null),
            Json::Bool(b) => Some(Value::Bool(*b)),
            Json::Number(n) => n.as_f64().map(Value::Number),
            Json::String(s) => Some(Value::String(s.clone())),
            Json::Array(_) | Json::Object(_) => None,
        }
    }

    /// Convert to the stored JSON form.
    ///
    /// Integral numbers are stored as JSON integers so that `942` and `942.0`
    /// compare equal after a reload. Non-finite numbers become `null`.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => Json::String(s.clone()),
        }
    }

    /// Name of the runtime type, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

fn number_to_json(n: f64) -> Json {
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_EXACT_INTEGER as f64 {
        Json::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Json::Number)
            .unwrap_or(Json::Null)
    }
}

/// Whether a JSON integer would be rounded as a [`Value::Number`].
pub fn is_inexact_integer(json: &Json) -> bool {
    let Json::Number(n) = json else {
        return false;
    };
    if let Some(i) = n.as_i64() {
        i.unsigned_abs() > MAX_EXACT_INTEGER
    } else if let Some(u) = n.as_u64() {
        u > MAX_EXACT_INTEGER
    } else {
        false
    }
}

/// Name of a JSON value's runtime type, used in error messages.
pub fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Whether a row carries `tombstone: true`.
pub fn is_tombstoned(row: &Row) -> bool {
    matches!(row.get(TOMBSTONE_COLUMN), Some(Json::Bool(true)))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
