//! In-memory evaluation of selectors and expressions.
//!
//! This is the reference semantics the SQL compiler mirrors: missing fields
//! read as `Null`, ordered comparisons against `Null` are false, and
//! `$distance` sums squared per-axis differences left to right before a
//! single square root.

use std::cmp::Ordering;

use crate::expression::{BinaryOp, NaryOp, QueryExpression, UnaryOp, VectorOperand};
use crate::selector::{
    ComparisonOp, FieldExpression, MembershipOp, Pattern, QuerySelector, SetOp, ConditionalType,
    ELEMENT_FIELD,
};
use crate::value::TValue;

static NULL: TValue = TValue::Null;

/// Euclidean distance between two equally sized vectors.
///
/// Returns `None` when the dimensions differ.
pub fn euclidean_distance(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() {
        return None;
    }
    let mut sum = 0.0_f64;
    for (x, y) in a.iter().zip(b) {
        let d = x - y;
        sum += d * d;
    }
    Some(sum.sqrt())
}

/// Apply a comparison operator with selector semantics
pub fn compare(op: ComparisonOp, left: &TValue, right: &TValue) -> bool {
    match op {
        ComparisonOp::Eq => left.loose_eq(right),
        ComparisonOp::Ne => !left.loose_eq(right),
        ComparisonOp::Lt => left.compare(right) == Some(Ordering::Less),
        ComparisonOp::Lte => matches!(left.compare(right), Some(Ordering::Less | Ordering::Equal)),
        ComparisonOp::Gt => left.compare(right) == Some(Ordering::Greater),
        ComparisonOp::Gte => {
            matches!(left.compare(right), Some(Ordering::Greater | Ordering::Equal))
        }
    }
}

fn truthy(value: &TValue) -> bool {
    match value {
        TValue::Null => false,
        TValue::Bool(b) => *b,
        TValue::Number(n) => *n != 0.0 && !n.is_nan(),
        TValue::String(s) => !s.is_empty(),
        _ => true,
    }
}

impl QuerySelector {
    /// Evaluate against an object (or, inside `$every`/`$some`, an element).
    pub fn eval(&self, object: &TValue) -> bool {
        match self {
            QuerySelector::Conditional { kind, exprs } => match kind {
                ConditionalType::And => exprs.iter().all(|e| e.eval(object)),
                ConditionalType::Or => exprs.iter().any(|e| e.eval(object)),
                ConditionalType::Nor => !exprs.iter().any(|e| e.eval(object)),
            },
            QuerySelector::Field { field, expr } => {
                let value = if field == ELEMENT_FIELD {
                    object
                } else {
                    object.get_path(field).unwrap_or(&NULL)
                };
                expr.eval(value)
            }
            QuerySelector::Expression(expr) => truthy(&expr.eval(object)),
        }
    }
}

impl FieldExpression {
    pub fn eval(&self, value: &TValue) -> bool {
        match self {
            FieldExpression::Comparison { op, value: operand } => compare(*op, value, operand),
            FieldExpression::Membership { op, values } => {
                let found = values.iter().any(|v| value.loose_eq(v));
                match op {
                    MembershipOp::In => found,
                    MembershipOp::Nin => !found,
                }
            }
            FieldExpression::Set { op, values } => {
                let Some(items) = value.as_array() else {
                    return false;
                };
                let contains = |set: &[TValue], v: &TValue| set.iter().any(|x| x.loose_eq(v));
                match op {
                    SetOp::Subset => items.iter().all(|v| contains(values, v)),
                    SetOp::Superset => values.iter().all(|v| contains(items, v)),
                    SetOp::Intersect => items.iter().any(|v| contains(values, v)),
                }
            }
            FieldExpression::Not(inner) => !inner.eval(value),
            FieldExpression::Type(names) => names.iter().any(|n| n == value.type_name()),
            FieldExpression::Pattern(pattern) => match (value.as_str(), pattern) {
                (Some(text), Pattern::Contains(needle)) => text.contains(needle.as_str()),
                (Some(text), regex) => regex.to_regex().map(|r| r.is_match(text)).unwrap_or(false),
                (None, _) => false,
            },
            FieldExpression::Size(size) => value
                .as_array()
                .map(|items| items.len() as u64 == *size)
                .unwrap_or(false),
            FieldExpression::Every(selector) => value
                .as_array()
                .map(|items| items.iter().all(|item| selector.eval(item)))
                .unwrap_or(false),
            FieldExpression::Some(selector) => value
                .as_array()
                .map(|items| items.iter().any(|item| selector.eval(item)))
                .unwrap_or(false),
        }
    }
}

impl QueryExpression {
    /// Evaluate to a value; type errors and undefined arithmetic give `Null`.
    pub fn eval(&self, object: &TValue) -> TValue {
        match self {
            QueryExpression::Key(path) => {
                let value = if path == ELEMENT_FIELD {
                    Some(object)
                } else {
                    object.get_path(path)
                };
                value.cloned().unwrap_or(TValue::Null)
            }
            QueryExpression::Value(value) => value.clone(),
            QueryExpression::Not(expr) => TValue::Bool(!truthy(&expr.eval(object))),
            QueryExpression::And(exprs) => {
                TValue::Bool(exprs.iter().all(|e| truthy(&e.eval(object))))
            }
            QueryExpression::Or(exprs) => {
                TValue::Bool(exprs.iter().any(|e| truthy(&e.eval(object))))
            }
            QueryExpression::Compare { op, left, right } => {
                TValue::Bool(compare(*op, &left.eval(object), &right.eval(object)))
            }
            QueryExpression::Nary { op, exprs } => {
                let mut numbers = exprs.iter().map(|e| e.eval(object).as_f64());
                let Some(Some(first)) = numbers.next() else {
                    return TValue::Null;
                };
                let mut acc = first;
                for n in numbers {
                    let Some(n) = n else {
                        return TValue::Null;
                    };
                    acc = match op {
                        NaryOp::Add => acc + n,
                        NaryOp::Multiply => acc * n,
                    };
                }
                TValue::Number(acc)
            }
            QueryExpression::Binary { op, left, right } => {
                let (Some(a), Some(b)) = (left.eval(object).as_f64(), right.eval(object).as_f64())
                else {
                    return TValue::Null;
                };
                let result = match op {
                    BinaryOp::Subtract => Some(a - b),
                    BinaryOp::Divide => (b != 0.0).then(|| a / b),
                    BinaryOp::Mod => (b != 0.0).then(|| a % b),
                    BinaryOp::Pow => Some(a.powf(b)),
                };
                result.map(TValue::Number).unwrap_or(TValue::Null)
            }
            QueryExpression::Unary { op, expr } => {
                let value = expr.eval(object);
                match op {
                    UnaryOp::Size => match &value {
                        TValue::Array(items) => TValue::Number(items.len() as f64),
                        TValue::String(s) => TValue::Number(s.chars().count() as f64),
                        _ => TValue::Null,
                    },
                    _ => {
                        let Some(n) = value.as_f64() else {
                            return TValue::Null;
                        };
                        match op {
                            UnaryOp::Abs => TValue::Number(n.abs()),
                            UnaryOp::Neg => TValue::Number(-n),
                            _ if n >= 0.0 => TValue::Number(n.sqrt()),
                            _ => TValue::Null,
                        }
                    }
                }
            }
            QueryExpression::Distance { left, right } => {
                let (Some(a), Some(b)) = (
                    Self::eval_vector(left, object),
                    Self::eval_vector(right, object),
                ) else {
                    return TValue::Null;
                };
                euclidean_distance(&a, &b)
                    .map(TValue::Number)
                    .unwrap_or(TValue::Null)
            }
        }
    }

    fn eval_vector(operand: &VectorOperand, object: &TValue) -> Option<Vec<f64>> {
        match operand {
            VectorOperand::Axes(exprs) => exprs.iter().map(|e| e.eval(object).as_f64()).collect(),
            VectorOperand::Single(expr) => match expr.eval(object) {
                TValue::Array(items) => items.iter().map(TValue::as_f64).collect(),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: serde_json::Value) -> TValue {
        TValue::from_json(&value).unwrap()
    }

    fn selector(value: serde_json::Value) -> QuerySelector {
        QuerySelector::decode(&value, false).unwrap()
    }

    #[test]
    fn test_distance_reference_values() {
        let d = euclidean_distance(&[0.0, 1.0, 2.0], &[0.0, 0.0, 0.0]).unwrap();
        assert_eq!(d, 5.0_f64.sqrt());
        assert!((d - 2.236).abs() < 1e-3);
        assert_eq!(euclidean_distance(&[1.0], &[1.0, 2.0]), None);
    }

    #[test]
    fn test_distance_filter_threshold() {
        let doc = object(json!({"vector": [0, 1, 2]}));
        let near = selector(json!({"$expr": {"$lt": [
            {"$distance": [{"$key": "vector"}, {"$value": [0, 0, 0]}]},
            {"$value": 2.3}
        ]}}));
        let far = selector(json!({"$expr": {"$lt": [
            {"$distance": [{"$key": "vector"}, {"$value": [0, 0, 0]}]},
            {"$value": 2.2}
        ]}}));
        assert!(near.eval(&doc));
        assert!(!far.eval(&doc));
    }

    #[test]
    fn test_distance_over_axes() {
        let doc = object(json!({"x": 0, "y": 1, "z": 2}));
        let expr = QueryExpression::decode(&json!({"$distance": [
            [{"$key": "x"}, {"$key": "y"}, {"$key": "z"}],
            [{"$value": 0}, {"$value": 0}, {"$value": 0}]
        ]}))
        .unwrap();
        assert_eq!(expr.eval(&doc), TValue::Number(5.0_f64.sqrt()));
    }

    #[test]
    fn test_field_operators() {
        let doc = object(json!({"age": 30, "tags": ["a", "b"], "name": "Alice", "missing": null}));
        assert!(selector(json!({"age": {"$gte": 18, "$lt": 65}})).eval(&doc));
        assert!(selector(json!({"tags": {"$intersect": ["b", "z"]}})).eval(&doc));
        assert!(selector(json!({"tags": {"$subset": ["a", "b", "c"]}})).eval(&doc));
        assert!(!selector(json!({"tags": {"$superset": ["a", "c"]}})).eval(&doc));
        assert!(selector(json!({"tags": {"$size": 2}})).eval(&doc));
        assert!(selector(json!({"tags": {"$some": {"$": {"$eq": "a"}}}})).eval(&doc));
        assert!(!selector(json!({"tags": {"$every": {"$": {"$eq": "a"}}}})).eval(&doc));
        assert!(selector(json!({"name": {"$pattern": "lic"}})).eval(&doc));
        assert!(selector(json!({"name": {"$pattern": {"$regex": "^al", "$options": "i"}}})).eval(&doc));
        assert!(selector(json!({"missing": {"$eq": null}})).eval(&doc));
        assert!(selector(json!({"nope": {"$eq": null}})).eval(&doc));
        assert!(!selector(json!({"nope": {"$gt": 1}})).eval(&doc));
        assert!(selector(json!({"nope": {"$not": {"$gt": 1}}})).eval(&doc));
        assert!(selector(json!({"age": {"$type": ["number", "decimal"]}})).eval(&doc));
    }

    #[test]
    fn test_conditionals() {
        let doc = object(json!({"a": 1, "b": 2}));
        assert!(selector(json!({"$or": [{"a": {"$eq": 5}}, {"b": {"$eq": 2}}]})).eval(&doc));
        assert!(!selector(json!({"$nor": [{"a": {"$eq": 1}}]})).eval(&doc));
        assert!(selector(json!({})).eval(&doc));
    }

    #[test]
    fn test_arithmetic_edge_cases() {
        let doc = object(json!({"a": 4, "b": 0}));
        let div = QueryExpression::decode(&json!({"$divide": [{"$key": "a"}, {"$key": "b"}]})).unwrap();
        assert_eq!(div.eval(&doc), TValue::Null);
        let sqrt = QueryExpression::decode(&json!({"$sqrt": {"$key": "a"}})).unwrap();
        assert_eq!(sqrt.eval(&doc), TValue::Number(2.0));
        let add = QueryExpression::decode(&json!({"$add": [{"$key": "a"}, {"$value": 1}, {"$key": "x"}]})).unwrap();
        assert_eq!(add.eval(&doc), TValue::Null);
    }
}
