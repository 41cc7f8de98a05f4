//! Row permission predicates and the point-lookup heuristic.

use selector_core::{ComparisonOp, ConditionalType, FieldExpression, QuerySelector, SetOp, TValue};

use super::decoder::QueryDecoder;

/// ACL column checked for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionColumn {
    Read,
    Write,
}

impl PermissionColumn {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionColumn::Read => "_rperm",
            PermissionColumn::Write => "_wperm",
        }
    }
}

impl QueryDecoder<'_> {
    /// `filter AND acl-column intersects caller AND not expired`.
    ///
    /// Master callers get the filter unchanged.
    pub(super) fn row_filter(&self, filter: QuerySelector, column: PermissionColumn) -> QuerySelector {
        if self.identity.is_master {
            return filter.simplify();
        }
        let acl = QuerySelector::Field {
            field: column.as_str().to_string(),
            expr: FieldExpression::Set {
                op: SetOp::Intersect,
                values: self.acls.iter().map(|s| TValue::from(s.as_str())).collect(),
            },
        };
        let not_expired = QuerySelector::Conditional {
            kind: ConditionalType::Or,
            exprs: vec![
                QuerySelector::Field {
                    field: "_expired_at".to_string(),
                    expr: FieldExpression::Comparison {
                        op: ComparisonOp::Eq,
                        value: TValue::Null,
                    },
                },
                QuerySelector::Field {
                    field: "_expired_at".to_string(),
                    expr: FieldExpression::Comparison {
                        op: ComparisonOp::Gt,
                        value: TValue::Date(self.now),
                    },
                },
            ],
        };
        filter.and([acl, not_expired])
    }
}

fn id_equality(selector: &QuerySelector) -> Option<&TValue> {
    match selector {
        QuerySelector::Field {
            field,
            expr: FieldExpression::Comparison {
                op: ComparisonOp::Eq,
                value,
            },
        } if field == "_id" => Some(value),
        _ => None,
    }
}

/// True when a filter can only address one object by id.
///
/// The filter must be an `_id` equality, or an `$and` holding at least one,
/// and every `_id` equality must name the same id. `_id $in [x]` does not
/// qualify.
pub fn is_get_method(filter: &QuerySelector) -> bool {
    let ids: Vec<&TValue> = match filter {
        QuerySelector::Conditional {
            kind: ConditionalType::And,
            exprs,
        } => exprs.iter().filter_map(id_equality).collect(),
        other => id_equality(other).into_iter().collect(),
    };
    match ids.split_first() {
        Some((first, rest)) => rest.iter().all(|id| id == first),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn selector(value: serde_json::Value) -> QuerySelector {
        QuerySelector::decode(&value, false).unwrap().simplify()
    }

    #[test]
    fn test_single_id_equality_is_get() {
        assert!(is_get_method(&selector(json!({"_id": {"$eq": "abc"}}))));
        assert!(is_get_method(&selector(json!({"_id": {"$eq": "abc"}, "title": {"$eq": "x"}}))));
        assert!(is_get_method(&selector(json!([{"_id": {"$eq": "abc"}}, {"_id": {"$eq": "abc"}}]))));
    }

    #[test]
    fn test_other_shapes_are_find() {
        assert!(!is_get_method(&selector(json!({}))));
        assert!(!is_get_method(&selector(json!({"_id": {"$in": ["abc"]}}))));
        assert!(!is_get_method(&selector(json!({"_id": {"$ne": "abc"}}))));
        assert!(!is_get_method(&selector(json!([{"_id": {"$eq": "a"}}, {"_id": {"$eq": "b"}}]))));
        assert!(!is_get_method(&selector(json!({"$nor": [{"_id": {"$eq": "abc"}}]}))));
    }
}
