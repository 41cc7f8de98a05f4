//! Value encoding for columns of a given schema type.
//!
//! Pointers are stored as `Target$id` and relations as arrays of those, so
//! ids from different classes never collide.

use selector_core::TValue;

use super::{Sql, SqlParam};
use crate::error::{DbError, DbResult};
use crate::schema::DataType;

/// Prefix `id` with its class: `User$abc`
pub fn reference_key(target: &str, id: &str) -> String {
    format!("{}${}", target, id)
}

/// Stored key of a pointer value given as an id or an object with `_id`
pub fn pointer_key(target: &str, value: &TValue) -> DbResult<String> {
    match value {
        TValue::String(id) => Ok(reference_key(target, id)),
        TValue::Object(map) => {
            if let Some(class_name) = map.get("className").and_then(TValue::as_str) {
                if class_name != target {
                    return Err(DbError::InvalidValue(format!(
                        "expected a {} object, got {}",
                        target, class_name
                    )));
                }
            }
            match map.get("_id") {
                Some(TValue::String(id)) => Ok(reference_key(target, id)),
                _ => Err(DbError::InvalidValue(format!("{} reference requires an _id", target))),
            }
        }
        _ => Err(DbError::InvalidValue(format!("invalid {} reference", target))),
    }
}

fn mismatch(data_type: &DataType, value: &TValue) -> DbError {
    DbError::InvalidValue(format!(
        "expected {} value, got {}",
        data_type,
        value.type_name()
    ))
}

fn strings(data_type: &DataType, values: &[TValue]) -> DbResult<Vec<String>> {
    values
        .iter()
        .map(|v| match v {
            TValue::String(s) => Ok(s.clone()),
            other => Err(mismatch(data_type, other)),
        })
        .collect()
}

fn references(target: &str, values: &[TValue]) -> DbResult<Vec<String>> {
    values.iter().map(|v| pointer_key(target, v)).collect()
}

/// Parameter for a value written to or compared with a column
pub fn encode_value(data_type: &DataType, value: &TValue) -> DbResult<Sql> {
    if value.is_null() {
        return Ok(Sql::null());
    }

    let param = match (data_type, value) {
        (DataType::Boolean, TValue::Bool(b)) => SqlParam::Bool(*b),
        (DataType::Number, TValue::Number(_) | TValue::Decimal(_)) => {
            SqlParam::Float(value.as_f64().ok_or_else(|| mismatch(data_type, value))?)
        }
        (DataType::Decimal, TValue::Decimal(d)) => SqlParam::Decimal(d.clone()),
        (DataType::Decimal, TValue::Number(n)) => SqlParam::Decimal(n.to_string()),
        (DataType::String, TValue::String(s)) => SqlParam::Text(s.clone()),
        (DataType::Date, TValue::Date(d)) => SqlParam::Timestamp(*d),
        (DataType::StringArray, TValue::Array(items)) => {
            SqlParam::TextArray(strings(data_type, items)?)
        }
        (DataType::Object, _) => SqlParam::Json(value.to_json()),
        (DataType::Array, TValue::Array(items)) => {
            SqlParam::JsonArray(items.iter().map(TValue::to_json).collect())
        }
        (DataType::Vector { dimension }, TValue::Array(items)) => {
            let numbers = items
                .iter()
                .map(|v| v.as_f64().ok_or_else(|| mismatch(data_type, v)))
                .collect::<DbResult<Vec<f64>>>()?;
            if numbers.len() != *dimension {
                return Err(DbError::InvalidValue(format!(
                    "expected vector of dimension {}, got {}",
                    dimension,
                    numbers.len()
                )));
            }
            SqlParam::FloatArray(numbers)
        }
        (DataType::Pointer { target }, _) => SqlParam::Text(pointer_key(target, value)?),
        (
            DataType::Relation {
                target,
                foreign_field: None,
            },
            TValue::Array(items),
        ) => SqlParam::TextArray(references(target, items)?),
        (DataType::Relation { .. }, _) if data_type.is_virtual() => {
            return Err(DbError::UnsupportedOperation(
                "relation resolved through a foreign field cannot be written".to_string(),
            ))
        }
        _ => return Err(mismatch(data_type, value)),
    };
    Ok(Sql::param(param))
}

/// Array parameter holding elements for an array column
pub fn encode_list(data_type: &DataType, values: &[TValue]) -> DbResult<Sql> {
    let param = match data_type {
        DataType::StringArray => SqlParam::TextArray(strings(data_type, values)?),
        DataType::Array => SqlParam::JsonArray(values.iter().map(TValue::to_json).collect()),
        DataType::Vector { .. } => SqlParam::FloatArray(
            values
                .iter()
                .map(|v| v.as_f64().ok_or_else(|| mismatch(data_type, v)))
                .collect::<DbResult<Vec<f64>>>()?,
        ),
        DataType::Relation {
            target,
            foreign_field: None,
        } => SqlParam::TextArray(references(target, values)?),
        other => {
            return Err(DbError::UnsupportedOperation(format!(
                "list operand on {} column",
                other
            )))
        }
    };
    Ok(Sql::param(param))
}

/// Parameter compared against a JSONB expression
pub fn encode_json(value: &TValue) -> Sql {
    Sql::param(SqlParam::Json(value.to_json()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_pointer_keys() {
        assert_eq!(pointer_key("User", &TValue::from("abc")).unwrap(), "User$abc");

        let object = TValue::Object(BTreeMap::from([
            ("className".to_string(), TValue::from("User")),
            ("_id".to_string(), TValue::from("abc")),
        ]));
        assert_eq!(pointer_key("User", &object).unwrap(), "User$abc");

        let wrong = TValue::Object(BTreeMap::from([
            ("className".to_string(), TValue::from("Role")),
            ("_id".to_string(), TValue::from("abc")),
        ]));
        assert!(pointer_key("User", &wrong).is_err());
        assert!(pointer_key("User", &TValue::Number(1.0)).is_err());
    }

    #[test]
    fn test_encode_by_type() {
        let sql = encode_value(&DataType::Decimal, &TValue::Number(1.5)).unwrap();
        assert_eq!(sql, Sql::param(SqlParam::Decimal("1.5".to_string())));

        let sql = encode_value(&DataType::String, &TValue::Null).unwrap();
        assert_eq!(sql, Sql::null());

        let err = encode_value(&DataType::String, &TValue::Number(1.0)).unwrap_err();
        assert!(matches!(err, DbError::InvalidValue(_)));

        let vector = TValue::Array(vec![TValue::Number(0.0), TValue::Number(1.0)]);
        assert!(encode_value(&DataType::Vector { dimension: 3 }, &vector).is_err());
        assert!(encode_value(&DataType::Vector { dimension: 2 }, &vector).is_ok());
    }

    #[test]
    fn test_encode_relation_list() {
        let relation = DataType::Relation {
            target: "Tag".to_string(),
            foreign_field: None,
        };
        let sql = encode_list(&relation, &[TValue::from("a"), TValue::from("b")]).unwrap();
        assert_eq!(
            sql,
            Sql::param(SqlParam::TextArray(vec!["Tag$a".to_string(), "Tag$b".to_string()]))
        );
        assert!(encode_list(&DataType::String, &[]).is_err());
    }
}
