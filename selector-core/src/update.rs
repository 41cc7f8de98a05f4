//! Update operators applied by `updateOne`/`upsertOne`.
//!
//! ```json
//! {"count": {"$inc": 1}, "tags": {"$addToSet": ["x"]}, "title": {"$set": "Hi"}}
//! ```

use serde_json::Value;

use crate::error::{SelectorError, SelectorResult};
use crate::value::TValue;

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(TValue),
    Increment(TValue),
    Decrement(TValue),
    Multiply(TValue),
    Divide(TValue),
    Max(TValue),
    Min(TValue),
    AddToSet(Vec<TValue>),
    Push(Vec<TValue>),
    RemoveAll(Vec<TValue>),
    PopFirst(u64),
    PopLast(u64),
}

impl UpdateOp {
    pub fn decode(value: &Value) -> SelectorResult<UpdateOp> {
        let map = value
            .as_object()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| SelectorError::expression("update must hold exactly one operator"))?;
        let Some((key, arg)) = map.iter().next() else {
            return Err(SelectorError::expression("empty update"));
        };

        let numeric = |arg: &Value| -> SelectorResult<TValue> {
            let value = TValue::from_json(arg)?;
            match value {
                TValue::Number(_) | TValue::Decimal(_) => Ok(value),
                _ => Err(SelectorError::value(format!("{} requires a number", key))),
            }
        };
        let list = |arg: &Value| -> SelectorResult<Vec<TValue>> {
            match TValue::from_json(arg)? {
                TValue::Array(items) => Ok(items),
                _ => Err(SelectorError::value(format!("{} requires a list", key))),
            }
        };
        let count = |arg: &Value| -> SelectorResult<u64> {
            arg.as_f64()
                .filter(|n| *n >= 0.0 && n.fract() == 0.0)
                .map(|n| n as u64)
                .ok_or_else(|| SelectorError::value(format!("{} requires a non-negative integer", key)))
        };

        match key.as_str() {
            "$set" => Ok(UpdateOp::Set(TValue::from_json(arg)?)),
            "$inc" => Ok(UpdateOp::Increment(numeric(arg)?)),
            "$dec" => Ok(UpdateOp::Decrement(numeric(arg)?)),
            "$mul" => Ok(UpdateOp::Multiply(numeric(arg)?)),
            "$div" => Ok(UpdateOp::Divide(numeric(arg)?)),
            "$max" | "$min" => {
                let value = TValue::from_json(arg)?;
                if !value.is_scalar() || value.is_null() {
                    return Err(SelectorError::value(format!("{} requires a scalar", key)));
                }
                Ok(if key == "$max" { UpdateOp::Max(value) } else { UpdateOp::Min(value) })
            }
            "$addToSet" => Ok(UpdateOp::AddToSet(list(arg)?)),
            "$push" => Ok(UpdateOp::Push(list(arg)?)),
            "$removeAll" => Ok(UpdateOp::RemoveAll(list(arg)?)),
            "$popFirst" => Ok(UpdateOp::PopFirst(count(arg)?)),
            "$popLast" => Ok(UpdateOp::PopLast(count(arg)?)),
            other => Err(SelectorError::expression(format!("unknown update operator '{}'", other))),
        }
    }

    /// Decode a whole update map, keeping key order.
    pub fn decode_map(value: &Value) -> SelectorResult<Vec<(String, UpdateOp)>> {
        match value {
            Value::Null => Ok(Vec::new()),
            Value::Object(map) => map
                .iter()
                .map(|(key, op)| -> SelectorResult<(String, UpdateOp)> {
                    if key.is_empty() || key.starts_with('$') {
                        return Err(SelectorError::expression(format!("invalid update key '{}'", key)));
                    }
                    Ok((key.clone(), UpdateOp::decode(op)?))
                })
                .collect(),
            _ => Err(SelectorError::expression("update must be an object")),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UpdateOp::Set(_) => "$set",
            UpdateOp::Increment(_) => "$inc",
            UpdateOp::Decrement(_) => "$dec",
            UpdateOp::Multiply(_) => "$mul",
            UpdateOp::Divide(_) => "$div",
            UpdateOp::Max(_) => "$max",
            UpdateOp::Min(_) => "$min",
            UpdateOp::AddToSet(_) => "$addToSet",
            UpdateOp::Push(_) => "$push",
            UpdateOp::RemoveAll(_) => "$removeAll",
            UpdateOp::PopFirst(_) => "$popFirst",
            UpdateOp::PopLast(_) => "$popLast",
        }
    }

    /// Operators that rewrite array contents
    pub fn is_array_mutation(&self) -> bool {
        matches!(
            self,
            UpdateOp::AddToSet(_)
                | UpdateOp::Push(_)
                | UpdateOp::RemoveAll(_)
                | UpdateOp::PopFirst(_)
                | UpdateOp::PopLast(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_update_map() {
        let ops = UpdateOp::decode_map(&json!({
            "title": {"$set": "Hello"},
            "views": {"$inc": 1},
            "tags": {"$push": ["x"]},
            "queue": {"$popFirst": 2}
        }))
        .unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0], ("title".to_string(), UpdateOp::Set(TValue::from("Hello"))));
        assert_eq!(ops[1].1, UpdateOp::Increment(TValue::Number(1.0)));
        assert!(ops[2].1.is_array_mutation());
        assert_eq!(ops[3].1, UpdateOp::PopFirst(2));
    }

    #[test]
    fn test_reject_malformed_updates() {
        assert!(UpdateOp::decode(&json!({"$inc": "a"})).is_err());
        assert!(UpdateOp::decode(&json!({"$set": 1, "$inc": 1})).is_err());
        assert!(UpdateOp::decode(&json!({"$rename": "b"})).is_err());
        assert!(UpdateOp::decode(&json!({"$popLast": -1})).is_err());
        assert!(UpdateOp::decode(&json!({"$push": 1})).is_err());
        assert!(UpdateOp::decode_map(&json!({"$set": {"a": 1}})).is_err());
    }
}
