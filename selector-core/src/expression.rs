//! Value expressions used by `$expr` selectors and expression sorts.
//!
//! ```json
//! {"$lt": [{"$distance": [{"$key": "vector"}, {"$value": [0, 0, 0]}]}, {"$value": 2.3}]}
//! ```

use serde_json::Value;

use crate::error::{SelectorError, SelectorResult};
use crate::selector::ComparisonOp;
use crate::value::TValue;

/// Binary arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Subtract,
    Divide,
    Mod,
    Pow,
}

/// Variadic arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaryOp {
    Add,
    Multiply,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Abs,
    Neg,
    Sqrt,
    Size,
}

/// One side of a `$distance`
#[derive(Debug, Clone, PartialEq)]
pub enum VectorOperand {
    /// One scalar expression per axis, e.g. `[{"$key": "x"}, {"$key": "y"}]`
    Axes(Vec<QueryExpression>),
    /// A single vector-valued expression (vector column or literal array)
    Single(Box<QueryExpression>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryExpression {
    Key(String),
    Value(TValue),
    Not(Box<QueryExpression>),
    And(Vec<QueryExpression>),
    Or(Vec<QueryExpression>),
    Compare {
        op: ComparisonOp,
        left: Box<QueryExpression>,
        right: Box<QueryExpression>,
    },
    Nary {
        op: NaryOp,
        exprs: Vec<QueryExpression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<QueryExpression>,
        right: Box<QueryExpression>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<QueryExpression>,
    },
    Distance {
        left: VectorOperand,
        right: VectorOperand,
    },
}

impl QueryExpression {
    pub fn decode(value: &Value) -> SelectorResult<QueryExpression> {
        let map = value
            .as_object()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| SelectorError::expression("expression must be a single-key object"))?;
        let Some((key, arg)) = map.iter().next() else {
            return Err(SelectorError::expression("empty expression"));
        };

        match key.as_str() {
            "$key" => match arg.as_str() {
                Some(path) if !path.is_empty() => Ok(QueryExpression::Key(path.to_string())),
                _ => Err(SelectorError::expression("$key must be a non-empty string")),
            },
            "$value" => Ok(QueryExpression::Value(TValue::from_json(arg)?)),
            "$not" => Ok(QueryExpression::Not(Box::new(Self::decode(arg)?))),
            "$and" => Ok(QueryExpression::And(Self::decode_list(key, arg)?)),
            "$or" => Ok(QueryExpression::Or(Self::decode_list(key, arg)?)),
            "$add" | "$multiply" => {
                let exprs = Self::decode_list(key, arg)?;
                if exprs.is_empty() {
                    return Err(SelectorError::expression(format!("{} requires operands", key)));
                }
                let op = if key == "$add" { NaryOp::Add } else { NaryOp::Multiply };
                Ok(QueryExpression::Nary { op, exprs })
            }
            "$subtract" | "$divide" | "$mod" | "$pow" => {
                let (left, right) = Self::decode_pair(key, arg)?;
                let op = match key.as_str() {
                    "$subtract" => BinaryOp::Subtract,
                    "$divide" => BinaryOp::Divide,
                    "$mod" => BinaryOp::Mod,
                    _ => BinaryOp::Pow,
                };
                Ok(QueryExpression::Binary { op, left, right })
            }
            "$abs" | "$neg" | "$sqrt" | "$size" => {
                let op = match key.as_str() {
                    "$abs" => UnaryOp::Abs,
                    "$neg" => UnaryOp::Neg,
                    "$sqrt" => UnaryOp::Sqrt,
                    _ => UnaryOp::Size,
                };
                Ok(QueryExpression::Unary {
                    op,
                    expr: Box::new(Self::decode(arg)?),
                })
            }
            "$distance" => {
                let items = arg
                    .as_array()
                    .filter(|items| items.len() == 2)
                    .ok_or_else(|| SelectorError::expression("$distance requires two operands"))?;
                Ok(QueryExpression::Distance {
                    left: Self::decode_operand(&items[0])?,
                    right: Self::decode_operand(&items[1])?,
                })
            }
            other => match ComparisonOp::from_key(other) {
                Some(op) => {
                    let (left, right) = Self::decode_pair(key, arg)?;
                    Ok(QueryExpression::Compare { op, left, right })
                }
                None => Err(SelectorError::expression(format!("unknown operator '{}'", other))),
            },
        }
    }

    fn decode_list(key: &str, arg: &Value) -> SelectorResult<Vec<QueryExpression>> {
        arg.as_array()
            .ok_or_else(|| SelectorError::expression(format!("{} requires a list", key)))?
            .iter()
            .map(Self::decode)
            .collect()
    }

    fn decode_pair(
        key: &str,
        arg: &Value,
    ) -> SelectorResult<(Box<QueryExpression>, Box<QueryExpression>)> {
        match arg.as_array().map(|items| items.as_slice()) {
            Some([left, right]) => Ok((Box::new(Self::decode(left)?), Box::new(Self::decode(right)?))),
            _ => Err(SelectorError::expression(format!("{} requires two operands", key))),
        }
    }

    fn decode_operand(value: &Value) -> SelectorResult<VectorOperand> {
        match value {
            Value::Array(items) if !items.is_empty() => items
                .iter()
                .map(Self::decode)
                .collect::<SelectorResult<Vec<_>>>()
                .map(VectorOperand::Axes),
            Value::Object(_) => Ok(VectorOperand::Single(Box::new(Self::decode(value)?))),
            _ => Err(SelectorError::expression("invalid $distance operand")),
        }
    }

    /// Field paths referenced through `$key`
    pub fn key_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_keys(&mut paths);
        paths
    }

    fn collect_keys(&self, out: &mut Vec<String>) {
        match self {
            QueryExpression::Key(path) => {
                if !out.contains(path) {
                    out.push(path.clone());
                }
            }
            QueryExpression::Value(_) => {}
            QueryExpression::Not(expr) | QueryExpression::Unary { expr, .. } => {
                expr.collect_keys(out)
            }
            QueryExpression::And(exprs)
            | QueryExpression::Or(exprs)
            | QueryExpression::Nary { exprs, .. } => {
                for expr in exprs {
                    expr.collect_keys(out);
                }
            }
            QueryExpression::Compare { left, right, .. }
            | QueryExpression::Binary { left, right, .. } => {
                left.collect_keys(out);
                right.collect_keys(out);
            }
            QueryExpression::Distance { left, right } => {
                for operand in [left, right] {
                    match operand {
                        VectorOperand::Axes(exprs) => {
                            for expr in exprs {
                                expr.collect_keys(out);
                            }
                        }
                        VectorOperand::Single(expr) => expr.collect_keys(out),
                    }
                }
            }
        }
    }
}
