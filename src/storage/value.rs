//! Cell values and declared column types
//!
//! `Value::Null` is the explicit "absent" marker used everywhere a cell is
//! missing or could not be converted to its declared type. It is distinct
//! from `Int(0)`, `Float(0.0)` and `Str("")`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Canonical text form of a timestamp (fraction only when non-zero)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A single cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Timestamp(NaiveDateTime),
}

/// Declared type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int,
    Float,
    Str,
    Bool,
    Timestamp,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The runtime type of the value, `None` for nulls
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(DataType::Int),
            Value::Float(_) => Some(DataType::Float),
            Value::Str(_) => Some(DataType::Str),
            Value::Bool(_) => Some(DataType::Bool),
            Value::Timestamp(_) => Some(DataType::Timestamp),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Infer a value from a text cell: empty is null, then integer, float,
    /// boolean, and finally a plain string.
    pub fn infer(text: &str) -> Value {
        if text.is_empty() {
            return Value::Null;
        }
        if let Ok(v) = text.parse::<i64>() {
            return Value::Int(v);
        }
        if let Ok(v) = text.parse::<f64>() {
            return Value::Float(v);
        }
        match parse_bool(text) {
            Some(v) => Value::Bool(v),
            None => Value::Str(text.to_string()),
        }
    }

    /// Convert to `ty`, yielding `Null` when the value cannot be represented
    pub fn cast(&self, ty: DataType) -> Value {
        match (ty, self) {
            (_, Value::Null) => Value::Null,

            (DataType::Int, Value::Int(v)) => Value::Int(*v),
            (DataType::Int, Value::Float(v)) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
                    Value::Int(*v as i64)
                } else {
                    Value::Null
                }
            }
            (DataType::Int, Value::Bool(v)) => Value::Int(i64::from(*v)),
            (DataType::Int, Value::Str(s)) => match Value::infer(s.trim()) {
                Value::Str(_) => Value::Null,
                other => other.cast(DataType::Int),
            },
            (DataType::Int, Value::Timestamp(t)) => t
                .and_utc()
                .timestamp_nanos_opt()
                .map_or(Value::Null, Value::Int),

            (DataType::Float, Value::Float(v)) => Value::Float(*v),
            (DataType::Float, Value::Int(v)) => Value::Float(*v as f64),
            (DataType::Float, Value::Bool(v)) => Value::Float(if *v { 1.0 } else { 0.0 }),
            (DataType::Float, Value::Str(s)) => s
                .trim()
                .parse::<f64>()
                .map_or(Value::Null, Value::Float),
            (DataType::Float, Value::Timestamp(_)) => Value::Null,

            (DataType::Str, Value::Str(s)) => Value::Str(s.clone()),
            (DataType::Str, other) => Value::Str(other.to_string()),

            (DataType::Bool, Value::Bool(v)) => Value::Bool(*v),
            (DataType::Bool, Value::Int(0)) => Value::Bool(false),
            (DataType::Bool, Value::Int(1)) => Value::Bool(true),
            (DataType::Bool, Value::Float(v)) if *v == 0.0 => Value::Bool(false),
            (DataType::Bool, Value::Float(v)) if *v == 1.0 => Value::Bool(true),
            (DataType::Bool, Value::Str(s)) => match s.trim() {
                "0" => Value::Bool(false),
                "1" => Value::Bool(true),
                other => parse_bool(other).map_or(Value::Null, Value::Bool),
            },
            (DataType::Bool, _) => Value::Null,

            (DataType::Timestamp, Value::Timestamp(t)) => Value::Timestamp(*t),
            (DataType::Timestamp, Value::Int(ns)) => Value::Timestamp(from_nanos(*ns)),
            (DataType::Timestamp, Value::Str(s)) => {
                parse_timestamp(s).map_or(Value::Null, Value::Timestamp)
            }
            (DataType::Timestamp, _) => Value::Null,
        }
    }
}

/// Bit-level float comparison so that NaN equals NaN, matching how stored
/// frames compare after a round trip.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Int(v) => v.hash(state),
            Value::Float(v) => {
                if v.is_nan() {
                    f64::NAN.to_bits().hash(state)
                } else if *v == 0.0 {
                    0.0f64.to_bits().hash(state)
                } else {
                    v.to_bits().hash(state)
                }
            }
            Value::Str(v) => v.hash(state),
            Value::Bool(v) => v.hash(state),
            Value::Timestamp(v) => v.hash(state),
        }
    }
}

/// Text form used by the file backend and for `Str` coercion
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(v) => write!(f, "{}", v),
            // Debug keeps the trailing ".0" so integral floats read back as floats
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Str(v) => f.write_str(v),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Timestamp(t) => write!(f, "{}", format_timestamp(t)),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Int => write!(f, "int"),
            DataType::Float => write!(f, "float"),
            DataType::Str => write!(f, "str"),
            DataType::Bool => write!(f, "bool"),
            DataType::Timestamp => write!(f, "timestamp"),
        }
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "int" | "int64" | "integer" => Ok(DataType::Int),
            "float" | "float64" | "double" => Ok(DataType::Float),
            "str" | "string" | "text" => Ok(DataType::Str),
            "bool" | "boolean" => Ok(DataType::Bool),
            "timestamp" | "datetime" | "datetime64[ns]" => Ok(DataType::Timestamp),
            other => Err(format!("unknown data type: {other}")),
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    if text.eq_ignore_ascii_case("true") {
        Some(true)
    } else if text.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Nanoseconds since the Unix epoch to a naive UTC timestamp
pub fn from_nanos(ns: i64) -> NaiveDateTime {
    DateTime::from_timestamp_nanos(ns).naive_utc()
}

/// Parse a timestamp into naive UTC.
///
/// Offsets are applied and then dropped; integers are nanoseconds since the
/// epoch.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.naive_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    text.parse::<i64>().ok().map(from_nanos)
}

pub fn format_timestamp(t: &NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}
