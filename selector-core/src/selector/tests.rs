//! Tests for the selector decoder.

use super::*;
use serde_json::json;

fn decode(value: serde_json::Value) -> SelectorResult<QuerySelector> {
    QuerySelector::decode(&value, false)
}

fn field(name: &str, op: ComparisonOp, value: TValue) -> QuerySelector {
    QuerySelector::Field {
        field: name.to_string(),
        expr: FieldExpression::Comparison { op, value },
    }
}

#[test]
fn test_single_field() {
    let selector = decode(json!({"age": {"$gte": 18}})).unwrap();
    assert_eq!(selector, field("age", ComparisonOp::Gte, TValue::Number(18.0)));
}

#[test]
fn test_multiple_operators_become_and() {
    let selector = decode(json!({"age": {"$gte": 18, "$lt": 65}})).unwrap();
    assert_eq!(
        selector,
        QuerySelector::Conditional {
            kind: ConditionalType::And,
            exprs: vec![
                field("age", ComparisonOp::Gte, TValue::Number(18.0)),
                field("age", ComparisonOp::Lt, TValue::Number(65.0)),
            ],
        }
    );
}

#[test]
fn test_or_selector() {
    let selector = decode(json!({"$or": [{"a": {"$eq": 1}}, {"b": {"$eq": 2}}]})).unwrap();
    match selector {
        QuerySelector::Conditional { kind, exprs } => {
            assert_eq!(kind, ConditionalType::Or);
            assert_eq!(exprs.len(), 2);
        }
        other => panic!("Expected conditional, got {:?}", other),
    }
}

#[test]
fn test_list_input_is_anded() {
    let selector = decode(json!([{"a": {"$eq": 1}}, {"b": {"$eq": 2}}])).unwrap();
    assert!(matches!(
        selector,
        QuerySelector::Conditional { kind: ConditionalType::And, ref exprs } if exprs.len() == 2
    ));
}

#[test]
fn test_whitelist_rejections() {
    // unknown operator
    assert!(decode(json!({"a": {"$regex": "x"}})).is_err());
    // unknown top-level dollar key
    assert!(decode(json!({"$where": "1 == 1"})).is_err());
    // conditional requires a list
    assert!(decode(json!({"$and": {"a": {"$eq": 1}}})).is_err());
    // field value must be an operator object
    assert!(decode(json!({"a": 1})).is_err());
    assert!(decode(json!({"a": [{"$eq": 1}]})).is_err());
    // comparison requires a scalar
    assert!(decode(json!({"a": {"$eq": [1, 2]}})).is_err());
    // membership requires a list
    assert!(decode(json!({"a": {"$in": 1}})).is_err());
    // $not requires exactly one operator
    assert!(decode(json!({"a": {"$not": {"$eq": 1, "$ne": 2}}})).is_err());
    // $type must name a known type
    assert!(decode(json!({"a": {"$type": "integer"}})).is_err());
    // $size must be a non-negative integer
    assert!(decode(json!({"a": {"$size": 1.5}})).is_err());
    // element field only inside $every/$some
    assert!(decode(json!({"$": {"$eq": 1}})).is_err());
}

#[test]
fn test_element_field_inside_some() {
    let selector = decode(json!({"tags": {"$some": {"$": {"$eq": "a"}}}})).unwrap();
    match selector {
        QuerySelector::Field { field, expr: FieldExpression::Some(inner) } => {
            assert_eq!(field, "tags");
            assert_eq!(*inner, field_eq_element());
        }
        other => panic!("Expected $some, got {:?}", other),
    }
}

fn field_eq_element() -> QuerySelector {
    field(ELEMENT_FIELD, ComparisonOp::Eq, TValue::from("a"))
}

#[test]
fn test_pattern_decoding() {
    let selector = decode(json!({"name": {"$pattern": {"$regex": "^a", "$options": "i"}}})).unwrap();
    assert!(matches!(
        selector,
        QuerySelector::Field { expr: FieldExpression::Pattern(Pattern::Regex { .. }), .. }
    ));
    assert!(decode(json!({"name": {"$pattern": {"$regex": "(", "$options": ""}}})).is_err());
    assert!(decode(json!({"name": {"$pattern": {"$regex": "a", "$options": "x"}}})).is_err());
}

#[test]
fn test_simplify_collapses_and_flattens() {
    let selector = decode(json!({"$and": [{"$and": [{"a": {"$eq": 1}}, {"b": {"$eq": 2}}]}, {"c": {"$eq": 3}}]}))
        .unwrap()
        .simplify();
    match &selector {
        QuerySelector::Conditional { kind, exprs } => {
            assert_eq!(*kind, ConditionalType::And);
            assert_eq!(exprs.len(), 3);
        }
        other => panic!("Expected flattened $and, got {:?}", other),
    }

    let single = decode(json!({"$or": [{"a": {"$eq": 1}}]})).unwrap().simplify();
    assert_eq!(single, field("a", ComparisonOp::Eq, TValue::Number(1.0)));
}

#[test]
fn test_simplify_keeps_nor() {
    let selector = decode(json!({"$nor": [{"$nor": [{"a": {"$eq": 1}}]}]})).unwrap().simplify();
    match selector {
        QuerySelector::Conditional { kind: ConditionalType::Nor, exprs } => {
            assert_eq!(exprs.len(), 1);
            assert!(matches!(exprs[0], QuerySelector::Conditional { kind: ConditionalType::Nor, .. }));
        }
        other => panic!("Expected $nor, got {:?}", other),
    }
}

#[test]
fn test_and_appends_after_self() {
    let base = decode(json!({"title": {"$eq": "Hello"}})).unwrap();
    let acl = decode(json!({"_rperm": {"$intersect": ["*"]}})).unwrap();
    let combined = base.clone().and([acl.clone()]);
    assert_eq!(
        combined,
        QuerySelector::Conditional {
            kind: ConditionalType::And,
            exprs: vec![base, acl],
        }
    );
}

#[test]
fn test_key_paths() {
    let selector = decode(json!({
        "a.b": {"$eq": 1},
        "rel": {"$some": {"name": {"$eq": "x"}}},
        "tags": {"$every": {"$": {"$ne": "y"}}},
        "$expr": {"$gt": [{"$key": "score"}, {"$value": 1}]}
    }))
    .unwrap();
    assert_eq!(
        selector.key_paths(),
        vec!["a.b", "rel", "rel.name", "tags", "score"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );
}

#[test]
fn test_empty_selector_matches_all() {
    let selector = decode(json!({})).unwrap();
    assert!(selector.is_empty());
    assert!(decode(serde_json::Value::Null).unwrap().is_empty());
}
