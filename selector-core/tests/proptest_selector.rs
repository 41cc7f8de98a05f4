//! Property tests for selector simplification and the decoder whitelist.

use proptest::prelude::*;
use selector_core::{QuerySelector, SelectorError};
use serde_json::{json, Value};

// ============================================================================
// Generators
// ============================================================================

/// Generate a field name (never starting with '$')
fn arb_field() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,6}(\\.[a-z]{1,4})?".prop_map(String::from)
}

/// Generate a single field condition
fn arb_leaf() -> impl Strategy<Value = Value> {
    let op = prop_oneof![
        Just("$eq"),
        Just("$ne"),
        Just("$lt"),
        Just("$lte"),
        Just("$gt"),
        Just("$gte"),
    ];
    (arb_field(), op, -100i64..100).prop_map(|(field, op, n)| json!({ field: { op: n } }))
}

/// Generate a nested selector tree
fn arb_selector() -> impl Strategy<Value = Value> {
    arb_leaf().prop_recursive(4, 32, 4, |inner| {
        let kind = prop_oneof![Just("$and"), Just("$or"), Just("$nor")];
        (kind, prop::collection::vec(inner, 0..4)).prop_map(|(kind, items)| json!({ kind: items }))
    })
}

/// Generate an operator key outside the whitelist
fn arb_unknown_operator() -> impl Strategy<Value = String> {
    "\\$[a-z]{2,8}".prop_filter("must not be a known operator", |key| {
        ![
            "$eq", "$ne", "$lt", "$lte", "$gt", "$gte", "$in", "$nin", "$subset", "$superset",
            "$intersect", "$not", "$type", "$pattern", "$size", "$every", "$some", "$and", "$or",
            "$nor", "$expr",
        ]
        .contains(&key.as_str())
    })
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn simplify_is_idempotent(raw in arb_selector()) {
        let selector = QuerySelector::decode(&raw, false).unwrap();
        let once = selector.simplify();
        let twice = once.clone().simplify();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn simplify_preserves_semantics(raw in arb_selector(), a in -100i64..100, b in -100i64..100) {
        let selector = QuerySelector::decode(&raw, false).unwrap();
        let doc = selector_core::TValue::from_json(&json!({"a": a, "b": b, "c": {"d": a}})).unwrap();
        let simplified = selector.clone().simplify();
        prop_assert_eq!(selector.eval(&doc), simplified.eval(&doc));
    }

    #[test]
    fn unknown_field_operator_is_rejected(field in arb_field(), op in arb_unknown_operator()) {
        let raw = json!({ field: { op: 1 } });
        let result = QuerySelector::decode(&raw, false);
        prop_assert!(matches!(result, Err(SelectorError::InvalidExpression(_))));
    }

    #[test]
    fn unknown_top_level_key_is_rejected(op in arb_unknown_operator(), inner in arb_selector()) {
        let raw = json!({ "$and": [inner, { op: [] }] });
        let result = QuerySelector::decode(&raw, false);
        prop_assert!(matches!(result, Err(SelectorError::InvalidExpression(_))));
    }
}
