//! Sort options: a key map or a list of expression sorts.

use serde_json::Value;

use crate::error::{SelectorError, SelectorResult};
use crate::expression::QueryExpression;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    fn decode(value: &Value) -> SelectorResult<SortOrder> {
        match value.as_i64() {
            Some(1) => Ok(SortOrder::Ascending),
            Some(-1) => Ok(SortOrder::Descending),
            _ => Err(SelectorError::expression("sort order must be 1 or -1")),
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionSort {
    pub expr: QueryExpression,
    pub order: SortOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortOption {
    /// `{"a": 1, "b.c": -1}`, in declaration order
    Keys(Vec<(String, SortOrder)>),
    /// `[{"expr": {...}, "order": 1}]`
    Expressions(Vec<ExpressionSort>),
}

impl Default for SortOption {
    fn default() -> Self {
        SortOption::Keys(Vec::new())
    }
}

impl SortOption {
    pub fn decode(value: &Value) -> SelectorResult<SortOption> {
        match value {
            Value::Null => Ok(SortOption::default()),
            Value::Object(map) => map
                .iter()
                .map(|(key, order)| -> SelectorResult<(String, SortOrder)> {
                    if key.is_empty() || key.starts_with('$') {
                        return Err(SelectorError::expression(format!("invalid sort key '{}'", key)));
                    }
                    Ok((key.clone(), SortOrder::decode(order)?))
                })
                .collect::<SelectorResult<Vec<_>>>()
                .map(SortOption::Keys),
            Value::Array(items) => items
                .iter()
                .map(|item| -> SelectorResult<ExpressionSort> {
                    let map = item
                        .as_object()
                        .filter(|m| m.len() == 2 && m.contains_key("expr") && m.contains_key("order"))
                        .ok_or_else(|| SelectorError::expression("expression sort requires expr and order"))?;
                    Ok(ExpressionSort {
                        expr: QueryExpression::decode(&map["expr"])?,
                        order: SortOrder::decode(&map["order"])?,
                    })
                })
                .collect::<SelectorResult<Vec<_>>>()
                .map(SortOption::Expressions),
            _ => Err(SelectorError::expression("invalid sort option")),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            SortOption::Keys(keys) => keys.is_empty(),
            SortOption::Expressions(exprs) => exprs.is_empty(),
        }
    }

    /// Field paths the sort reads
    pub fn key_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        let candidates: Vec<String> = match self {
            SortOption::Keys(keys) => keys.iter().map(|(k, _)| k.clone()).collect(),
            SortOption::Expressions(exprs) => exprs.iter().flat_map(|e| e.expr.key_paths()).collect(),
        };
        for path in candidates {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_sort_keeps_order() {
        let sort = SortOption::decode(&json!({"z": 1, "a": -1})).unwrap();
        assert_eq!(
            sort,
            SortOption::Keys(vec![
                ("z".to_string(), SortOrder::Ascending),
                ("a".to_string(), SortOrder::Descending),
            ])
        );
    }

    #[test]
    fn test_expression_sort() {
        let sort = SortOption::decode(&json!([{
            "expr": {"$distance": [{"$key": "vector"}, {"$value": [0, 0]}]},
            "order": 1
        }]))
        .unwrap();
        assert_eq!(sort.key_paths(), vec!["vector".to_string()]);
    }

    #[test]
    fn test_invalid_sort() {
        assert!(SortOption::decode(&json!({"a": 2})).is_err());
        assert!(SortOption::decode(&json!({"$where": 1})).is_err());
        assert!(SortOption::decode(&json!([{"expr": {"$key": "a"}}])).is_err());
        assert!(SortOption::decode(&json!("a")).is_err());
    }
}
