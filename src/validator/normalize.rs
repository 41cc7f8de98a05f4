use serde_json::{Map, Value};
use unicode_normalization::UnicodeNormalization;

use crate::error::{DbError, DbResult};

/// NFD-normalize every string and object key, recursively.
///
/// Two keys of one object that normalize to the same key are rejected.
pub fn normalize(value: Value) -> DbResult<Value> {
    match value {
        Value::String(s) => Ok(Value::String(s.nfd().collect())),
        Value::Array(items) => Ok(Value::Array(
            items.into_iter().map(normalize).collect::<DbResult<_>>()?,
        )),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                let key: String = key.nfd().collect();
                if out.contains_key(&key) {
                    return Err(DbError::InvalidValue(format!(
                        "duplicate key '{}' after normalization",
                        key
                    )));
                }
                out.insert(key, normalize(value)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_composed_and_decomposed_forms_match() {
        let composed = json!({"caf\u{e9}": ["r\u{e9}sum\u{e9}", 1, null]});
        let decomposed = json!({"cafe\u{301}": ["re\u{301}sume\u{301}", 1, null]});
        assert_eq!(normalize(composed).unwrap(), normalize(decomposed.clone()).unwrap());
        assert_eq!(normalize(decomposed.clone()).unwrap(), decomposed);
    }

    #[test]
    fn test_non_strings_untouched() {
        let value = json!({"a": 1.5, "b": true, "c": {"$date": "2024-01-01T00:00:00Z"}});
        assert_eq!(normalize(value.clone()).unwrap(), value);
    }

    #[test]
    fn test_keys_colliding_after_normalization_are_rejected() {
        let mut map = Map::new();
        map.insert("caf\u{e9}".to_string(), json!(1));
        map.insert("cafe\u{301}".to_string(), json!(2));
        let err = normalize(json!({"nested": Value::Object(map)})).unwrap_err();
        assert!(matches!(err, DbError::InvalidValue(_)));
    }
}
