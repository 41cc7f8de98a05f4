//! Guard against self-referencing input.
//!
//! Each node is compared by address against its ancestors. An owned JSON
//! tree cannot contain itself, so in practice the guard trips on nesting
//! deeper than [`MAX_DEPTH`], which is how unrolled cycles from upstream
//! serializers arrive.

use serde_json::Value;

use crate::error::{DbError, DbResult};

/// Deepest nesting accepted in a request
pub const MAX_DEPTH: usize = 256;

pub fn recursive_check(value: &Value) -> DbResult<()> {
    let mut ancestors: Vec<*const Value> = Vec::new();
    check(value, &mut ancestors)
}

fn check(value: &Value, ancestors: &mut Vec<*const Value>) -> DbResult<()> {
    let children: Box<dyn Iterator<Item = &Value>> = match value {
        Value::Array(items) => Box::new(items.iter()),
        Value::Object(map) => Box::new(map.values()),
        _ => return Ok(()),
    };

    let address = value as *const Value;
    if ancestors.len() >= MAX_DEPTH || ancestors.contains(&address) {
        return Err(DbError::RecursiveStructure);
    }
    ancestors.push(address);
    for child in children {
        check(child, ancestors)?;
    }
    ancestors.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nested(depth: usize) -> Value {
        (0..depth).fold(json!(1), |inner, _| json!({ "a": inner }))
    }

    #[test]
    fn test_plain_values_pass() {
        assert!(recursive_check(&json!(null)).is_ok());
        assert!(recursive_check(&json!({"a": [1, {"b": "c"}], "d": {"e": []}})).is_ok());
    }

    #[test]
    fn test_equal_siblings_are_not_cycles() {
        let shared = json!({"x": 1});
        let value = json!({"a": shared.clone(), "b": shared, "c": [[1], [1]]});
        assert!(recursive_check(&value).is_ok());
    }

    #[test]
    fn test_depth_bound() {
        assert!(recursive_check(&nested(MAX_DEPTH)).is_ok());
        assert!(matches!(
            recursive_check(&nested(MAX_DEPTH + 1)),
            Err(DbError::RecursiveStructure)
        ));
    }
}
