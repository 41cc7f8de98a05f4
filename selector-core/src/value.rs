//! Literal values carried by selectors, updates and decoded rows.
//!
//! JSON has no date or arbitrary-precision type, so both travel in wrapper
//! objects: `{"$date": "2024-01-01T00:00:00Z"}` and `{"$decimal": "1.50"}`.
//! Regular expressions only appear under `$pattern` and are handled there.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};

use crate::error::{SelectorError, SelectorResult};

/// A decoded literal value
#[derive(Debug, Clone, PartialEq)]
pub enum TValue {
    Null,
    Bool(bool),
    Number(f64),
    /// Arbitrary precision number kept in its textual form
    Decimal(String),
    String(String),
    Date(DateTime<Utc>),
    Array(Vec<TValue>),
    Object(BTreeMap<String, TValue>),
}

/// Type names accepted by `$type`
pub const TYPE_NAMES: &[&str] = &[
    "null", "boolean", "number", "decimal", "string", "date", "array", "object",
];

impl TValue {
    /// Decode a JSON value, unwrapping `$date`/`$decimal` wrappers.
    ///
    /// Object keys starting with `$` are rejected so operators can never be
    /// smuggled inside a literal.
    pub fn from_json(value: &Value) -> SelectorResult<TValue> {
        match value {
            Value::Null => Ok(TValue::Null),
            Value::Bool(b) => Ok(TValue::Bool(*b)),
            Value::Number(n) => n
                .as_f64()
                .map(TValue::Number)
                .ok_or_else(|| SelectorError::value(format!("unrepresentable number {}", n))),
            Value::String(s) => Ok(TValue::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(TValue::from_json)
                .collect::<SelectorResult<Vec<_>>>()
                .map(TValue::Array),
            Value::Object(map) => Self::from_json_object(map),
        }
    }

    fn from_json_object(map: &Map<String, Value>) -> SelectorResult<TValue> {
        if map.len() == 1 {
            if let Some(raw) = map.get("$date") {
                let text = raw
                    .as_str()
                    .ok_or_else(|| SelectorError::value("$date must be a string"))?;
                let date = DateTime::parse_from_rfc3339(text)
                    .map_err(|e| SelectorError::value(format!("invalid date '{}': {}", text, e)))?;
                return Ok(TValue::Date(date.with_timezone(&Utc)));
            }
            if let Some(raw) = map.get("$decimal") {
                let text = match raw {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return Err(SelectorError::value("$decimal must be a string")),
                };
                if !is_decimal_literal(&text) {
                    return Err(SelectorError::value(format!("invalid decimal '{}'", text)));
                }
                return Ok(TValue::Decimal(text));
            }
        }

        let mut object = BTreeMap::new();
        for (key, value) in map {
            if key.starts_with('$') {
                return Err(SelectorError::value(format!("invalid object key '{}'", key)));
            }
            object.insert(key.clone(), TValue::from_json(value)?);
        }
        Ok(TValue::Object(object))
    }

    /// Encode back into JSON using the same wrapper conventions.
    pub fn to_json(&self) -> Value {
        match self {
            TValue::Null => Value::Null,
            TValue::Bool(b) => Value::Bool(*b),
            TValue::Number(n) => Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null),
            TValue::Decimal(d) => serde_json::json!({ "$decimal": d }),
            TValue::String(s) => Value::String(s.clone()),
            TValue::Date(d) => {
                serde_json::json!({ "$date": d.to_rfc3339_opts(SecondsFormat::Millis, true) })
            }
            TValue::Array(items) => Value::Array(items.iter().map(TValue::to_json).collect()),
            TValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Scalars are the only values accepted by comparison operators
    pub fn is_scalar(&self) -> bool {
        !matches!(self, TValue::Array(_) | TValue::Object(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TValue::Null)
    }

    /// Name reported to `$type`
    pub fn type_name(&self) -> &'static str {
        match self {
            TValue::Null => "null",
            TValue::Bool(_) => "boolean",
            TValue::Number(_) => "number",
            TValue::Decimal(_) => "decimal",
            TValue::String(_) => "string",
            TValue::Date(_) => "date",
            TValue::Array(_) => "array",
            TValue::Object(_) => "object",
        }
    }

    /// Numeric view of numbers and decimals
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TValue::Number(n) => Some(*n),
            TValue::Decimal(d) => d.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[TValue]> {
        match self {
            TValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Resolve a dotted path; numeric segments index into arrays.
    pub fn get_path(&self, path: &str) -> Option<&TValue> {
        let mut current = self;
        for segment in path.split('.') {
            current = match current {
                TValue::Object(map) => map.get(segment)?,
                TValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Equality used by `$eq`, `$in` and set operators.
    ///
    /// Numbers and decimals compare by value.
    pub fn loose_eq(&self, other: &TValue) -> bool {
        match (self, other) {
            (TValue::Number(_) | TValue::Decimal(_), TValue::Number(_) | TValue::Decimal(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            (TValue::Array(a), TValue::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (TValue::Object(a), TValue::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).map(|w| v.loose_eq(w)).unwrap_or(false))
            }
            _ => self == other,
        }
    }

    /// Ordering between values of compatible kinds; `None` otherwise.
    pub fn compare(&self, other: &TValue) -> Option<Ordering> {
        match (self, other) {
            (TValue::Number(_) | TValue::Decimal(_), TValue::Number(_) | TValue::Decimal(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            (TValue::String(a), TValue::String(b)) => Some(a.cmp(b)),
            (TValue::Date(a), TValue::Date(b)) => Some(a.cmp(b)),
            (TValue::Bool(a), TValue::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<&str> for TValue {
    fn from(value: &str) -> Self {
        TValue::String(value.to_string())
    }
}

impl From<String> for TValue {
    fn from(value: String) -> Self {
        TValue::String(value)
    }
}

impl From<f64> for TValue {
    fn from(value: f64) -> Self {
        TValue::Number(value)
    }
}

impl From<bool> for TValue {
    fn from(value: bool) -> Self {
        TValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for TValue {
    fn from(value: DateTime<Utc>) -> Self {
        TValue::Date(value)
    }
}

fn is_decimal_literal(text: &str) -> bool {
    let body = text.strip_prefix('-').unwrap_or(text);
    let (mantissa, exponent) = match body.split_once(['e', 'E']) {
        Some((m, e)) => (m, Some(e)),
        None => (body, None),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (mantissa, None),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(int_part)
        && frac_part.map(digits).unwrap_or(true)
        && exponent
            .map(|e| digits(e.strip_prefix(['+', '-']).unwrap_or(e)))
            .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_wrappers() {
        let date = TValue::from_json(&json!({"$date": "2024-03-01T12:00:00Z"})).unwrap();
        assert_eq!(date.type_name(), "date");

        let decimal = TValue::from_json(&json!({"$decimal": "12.50"})).unwrap();
        assert_eq!(decimal, TValue::Decimal("12.50".to_string()));
        assert_eq!(decimal.as_f64(), Some(12.5));
    }

    #[test]
    fn test_reject_operator_keys_in_literals() {
        assert!(TValue::from_json(&json!({"$gt": 1})).is_err());
        assert!(TValue::from_json(&json!({"a": {"$where": "x"}})).is_err());
        assert!(TValue::from_json(&json!({"$decimal": "1.2.3"})).is_err());
        assert!(TValue::from_json(&json!({"$date": "yesterday"})).is_err());
    }

    #[test]
    fn test_round_trip_json() {
        let raw = json!({"a": [1.5, "x", null], "d": {"$date": "2024-03-01T12:00:00.000Z"}});
        let value = TValue::from_json(&raw).unwrap();
        assert_eq!(value.to_json(), raw);
    }

    #[test]
    fn test_get_path() {
        let value = TValue::from_json(&json!({"a": {"b": [10, {"c": 3}]}})).unwrap();
        assert_eq!(value.get_path("a.b.0"), Some(&TValue::Number(10.0)));
        assert_eq!(value.get_path("a.b.1.c"), Some(&TValue::Number(3.0)));
        assert_eq!(value.get_path("a.x"), None);
    }

    #[test]
    fn test_compare_mixed_numeric() {
        let a = TValue::Number(1.5);
        let b = TValue::Decimal("2".to_string());
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert!(TValue::Decimal("2.0".to_string()).loose_eq(&TValue::Number(2.0)));
        assert_eq!(TValue::from("a").compare(&TValue::Number(1.0)), None);
    }
}
