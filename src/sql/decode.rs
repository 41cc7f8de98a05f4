//! Row decoding.
//!
//! Every selected row is a single JSONB object keyed by column name, with
//! shape leaves flattened to dotted keys and populated references already
//! nested. A [`DecodeRecipe`] restores the domain object.

use chrono::{DateTime, Utc};
use selector_core::TValue;
use serde_json::{Map, Value};

use crate::error::{DbError, DbResult};

/// How a projected column becomes a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnDecoder {
    #[default]
    Plain,
    /// Timestamp text, re-encoded as `{"$date": ...}`
    Date,
    /// Decimal projected as text, re-encoded as `{"$decimal": ...}`
    Decimal,
}

impl ColumnDecoder {
    pub fn decode(&self, value: Value) -> DbResult<Value> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (ColumnDecoder::Plain, value) => Ok(value),
            (ColumnDecoder::Date, Value::String(text)) => {
                let date = DateTime::parse_from_rfc3339(&text)
                    .map_err(|e| DbError::InternalError(format!("invalid timestamp '{}': {}", text, e)))?;
                Ok(TValue::Date(date.with_timezone(&Utc)).to_json())
            }
            (ColumnDecoder::Decimal, Value::String(text)) => Ok(TValue::Decimal(text).to_json()),
            (ColumnDecoder::Decimal, Value::Number(n)) => {
                Ok(TValue::Decimal(n.to_string()).to_json())
            }
            (decoder, other) => Err(DbError::InternalError(format!(
                "unexpected {:?} column value {}",
                decoder, other
            ))),
        }
    }
}

/// Decoding plan for one projected object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeRecipe {
    /// Column keys as they appear in the row (`meta.size` for shape leaves)
    pub columns: Vec<(String, ColumnDecoder)>,
    /// Populated fields: name, whether it holds a list, nested recipe
    pub populates: Vec<(String, bool, DecodeRecipe)>,
}

impl DecodeRecipe {
    pub fn decode(&self, row: &Value) -> DbResult<Value> {
        let Value::Object(row) = row else {
            return Err(DbError::InternalError(format!("expected row object, got {}", row)));
        };

        let mut object = Map::new();
        for (key, decoder) in &self.columns {
            let value = decoder.decode(row.get(key).cloned().unwrap_or(Value::Null))?;
            insert_path(&mut object, key, value);
        }

        for (field, many, recipe) in &self.populates {
            let value = match row.get(field) {
                None | Some(Value::Null) if *many => Value::Array(Vec::new()),
                None | Some(Value::Null) => Value::Null,
                Some(Value::Array(items)) if *many => Value::Array(
                    items
                        .iter()
                        .map(|item| recipe.decode(item))
                        .collect::<DbResult<Vec<_>>>()?,
                ),
                Some(item) => recipe.decode(item)?,
            };
            insert_path(&mut object, field, value);
        }

        Ok(Value::Object(object))
    }
}

/// Insert at a dotted key, creating intermediate objects
fn insert_path(object: &mut Map<String, Value>, key: &str, value: Value) {
    match key.split_once('.') {
        None => {
            object.insert(key.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = object
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_path(child, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_columns() {
        let recipe = DecodeRecipe {
            columns: vec![
                ("_id".to_string(), ColumnDecoder::Plain),
                ("_created_at".to_string(), ColumnDecoder::Date),
                ("price".to_string(), ColumnDecoder::Decimal),
                ("meta.size".to_string(), ColumnDecoder::Plain),
                ("meta.unit".to_string(), ColumnDecoder::Plain),
            ],
            populates: Vec::new(),
        };
        let row = json!({
            "_id": "abc",
            "_created_at": "2024-01-02T03:04:05.678+00:00",
            "price": "12.50",
            "meta.size": 3,
            "meta.unit": null,
        });

        let object = recipe.decode(&row).unwrap();
        assert_eq!(
            object,
            json!({
                "_id": "abc",
                "_created_at": {"$date": "2024-01-02T03:04:05.678Z"},
                "price": {"$decimal": "12.50"},
                "meta": {"size": 3, "unit": null},
            })
        );
    }

    #[test]
    fn test_decode_populates() {
        let inner = DecodeRecipe {
            columns: vec![("_id".to_string(), ColumnDecoder::Plain)],
            populates: Vec::new(),
        };
        let recipe = DecodeRecipe {
            columns: vec![("_id".to_string(), ColumnDecoder::Plain)],
            populates: vec![
                ("author".to_string(), false, inner.clone()),
                ("tags".to_string(), true, inner),
            ],
        };

        let object = recipe.decode(&json!({"_id": "p", "author": null, "tags": null})).unwrap();
        assert_eq!(object, json!({"_id": "p", "author": null, "tags": []}));

        let object = recipe
            .decode(&json!({"_id": "p", "author": {"_id": "u"}, "tags": [{"_id": "t"}]}))
            .unwrap();
        assert_eq!(object["author"], json!({"_id": "u"}));
        assert_eq!(object["tags"], json!([{"_id": "t"}]));
    }

    #[test]
    fn test_unexpected_value_is_internal_error() {
        let err = ColumnDecoder::Date.decode(json!(5)).unwrap_err();
        assert!(matches!(err, DbError::InternalError(_)));
    }
}
