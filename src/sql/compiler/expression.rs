//! `$expr` compilation.
//!
//! Arithmetic runs in `DOUBLE PRECISION` and yields `NULL` wherever the
//! evaluator yields `Null` (division by zero, square root of a negative,
//! non-numeric operands). `$distance` sums squared differences left to right
//! before one `SQRT`, the same order of operations as the evaluator.

use selector_core::eval::compare;
use selector_core::{
    BinaryOp, ComparisonOp, NaryOp, QueryExpression, TValue, UnaryOp, VectorOperand,
};

use super::filter::{not_null_false, null_comparison, when_json_type, Operand, Scope};
use super::QueryCompiler;
use crate::error::{DbError, DbResult};
use crate::schema::DataType;
use crate::sql::encode::{encode_json, encode_value};
use crate::sql::{Sql, SqlParam};

/// A compiled expression with its SQL type
#[derive(Debug, Clone)]
pub(super) enum Compiled {
    Literal(TValue),
    Number(Sql),
    Text(Sql),
    Boolean(Sql),
    Date(Sql),
    Json(Sql),
    Array { sql: Sql, data_type: DataType },
}

fn null_number() -> Sql {
    Sql::raw("NULL::DOUBLE PRECISION")
}

fn call(function: &str, args: Vec<Sql>) -> Sql {
    let mut sql = Sql::raw(&format!("{}(", function));
    sql.push(Sql::join(args, ", ")).push_raw(")");
    sql
}

fn infix(left: Sql, operator: &str, right: Sql) -> Sql {
    let mut sql = Sql::raw("(");
    sql.push(left)
        .push_raw(&format!(" {} ", operator))
        .push(right)
        .push_raw(")");
    sql
}

/// Parameter for a literal compared with SQL of another kind
fn literal_param(value: &TValue) -> Sql {
    match value {
        TValue::Null => Sql::null(),
        TValue::Bool(b) => Sql::param(SqlParam::Bool(*b)),
        TValue::Number(_) | TValue::Decimal(_) => match value.as_f64() {
            Some(n) => Sql::param(SqlParam::Float(n)),
            None => null_number(),
        },
        TValue::String(s) => Sql::param(SqlParam::Text(s.clone())),
        TValue::Date(d) => Sql::param(SqlParam::Timestamp(*d)),
        TValue::Array(_) | TValue::Object(_) => encode_json(value),
    }
}

impl QueryCompiler<'_> {
    pub(super) fn expression(&self, scope: &Scope<'_>, expr: &QueryExpression) -> DbResult<Compiled> {
        match expr {
            QueryExpression::Key(path) => self.key_expression(scope, path),
            QueryExpression::Value(value) => Ok(Compiled::Literal(value.clone())),
            QueryExpression::Not(inner) => {
                let inner = self.expression(scope, inner)?;
                Ok(Compiled::Boolean(not_null_false(self.truthy(inner)?)))
            }
            QueryExpression::And(exprs) | QueryExpression::Or(exprs) => {
                let and = matches!(expr, QueryExpression::And(_));
                if exprs.is_empty() {
                    return Ok(Compiled::Literal(TValue::Bool(and)));
                }
                let parts = exprs
                    .iter()
                    .map(|e| {
                        let compiled = self.expression(scope, e)?;
                        let mut sql = Sql::raw("COALESCE(");
                        sql.push(self.truthy(compiled)?).push_raw(", FALSE)");
                        Ok(sql)
                    })
                    .collect::<DbResult<Vec<_>>>()?;
                Ok(Compiled::Boolean(
                    Sql::join(parts, if and { " AND " } else { " OR " }).wrap(),
                ))
            }
            QueryExpression::Compare { op, left, right } => {
                let left = self.expression(scope, left)?;
                let right = self.expression(scope, right)?;
                self.compare_expressions(*op, left, right)
            }
            QueryExpression::Nary { op, exprs } => {
                let operator = match op {
                    NaryOp::Add => " + ",
                    NaryOp::Multiply => " * ",
                };
                let parts = exprs
                    .iter()
                    .map(|e| self.number(self.expression(scope, e)?))
                    .collect::<DbResult<Vec<_>>>()?;
                Ok(Compiled::Number(Sql::join(parts, operator).wrap()))
            }
            QueryExpression::Binary { op, left, right } => {
                let a = self.number(self.expression(scope, left)?)?;
                let b = self.number(self.expression(scope, right)?)?;
                let mut nonzero = Sql::raw("NULLIF(");
                nonzero.push(b.clone()).push_raw(", 0)");
                let sql = match op {
                    BinaryOp::Subtract => infix(a, "-", b),
                    BinaryOp::Divide => infix(a, "/", nonzero),
                    BinaryOp::Mod => {
                        let quotient = call("TRUNC", vec![infix(a.clone(), "/", nonzero)]);
                        infix(a, "-", infix(b, "*", quotient))
                    }
                    BinaryOp::Pow => call("POWER", vec![a, b]),
                };
                Ok(Compiled::Number(sql))
            }
            QueryExpression::Unary { op, expr } => {
                let inner = self.expression(scope, expr)?;
                if let Compiled::Literal(value) = inner {
                    // constant operands fold to the evaluator's result
                    let folded = QueryExpression::Unary {
                        op: *op,
                        expr: Box::new(QueryExpression::Value(value)),
                    };
                    return Ok(Compiled::Literal(folded.eval(&TValue::Null)));
                }
                let sql = match op {
                    UnaryOp::Size => self.size(inner),
                    UnaryOp::Abs => call("ABS", vec![self.number(inner)?]),
                    UnaryOp::Neg => {
                        let mut sql = Sql::raw("(-");
                        sql.push(self.number(inner)?).push_raw(")");
                        sql
                    }
                    UnaryOp::Sqrt => {
                        let x = self.number(inner)?;
                        let mut sql = Sql::raw("(CASE WHEN ");
                        sql.push(x.clone())
                            .push_raw(" >= 0 THEN SQRT(")
                            .push(x)
                            .push_raw(") END)");
                        sql
                    }
                };
                Ok(Compiled::Number(sql))
            }
            QueryExpression::Distance { left, right } => {
                let left = self.vector(scope, left)?;
                let right = self.vector(scope, right)?;
                let (Some(left), Some(right)) = (left, right) else {
                    return Ok(Compiled::Number(null_number()));
                };
                if left.len() != right.len() {
                    return Ok(Compiled::Number(null_number()));
                }
                let squares = left.into_iter().zip(right).map(|(l, r)| {
                    let difference = infix(l, "-", r);
                    infix(difference.clone(), "*", difference)
                });
                Ok(Compiled::Number(call(
                    "SQRT",
                    vec![Sql::join(squares.collect::<Vec<_>>(), " + ")],
                )))
            }
        }
    }

    fn key_expression(&self, scope: &Scope<'_>, path: &str) -> DbResult<Compiled> {
        match self.resolve(scope, path)? {
            Operand::Scalar { sql, data_type } => Ok(match data_type {
                DataType::Number => Compiled::Number(sql),
                DataType::Decimal => {
                    let mut cast = sql.wrap();
                    cast.push_raw("::DOUBLE PRECISION");
                    Compiled::Number(cast)
                }
                DataType::Boolean => Compiled::Boolean(sql),
                DataType::Date => Compiled::Date(sql),
                _ => Compiled::Text(sql),
            }),
            Operand::Json(sql) => Ok(Compiled::Json(sql)),
            Operand::Array { sql, data_type } => Ok(Compiled::Array { sql, data_type }),
            Operand::Relation(_) | Operand::RelationPath { .. } => Err(
                DbError::UnsupportedOperation(format!("relation '{}' in expression", path)),
            ),
        }
    }

    /// Numeric view; values without one become `NULL`
    fn number(&self, compiled: Compiled) -> DbResult<Sql> {
        Ok(match compiled {
            Compiled::Number(sql) => sql,
            Compiled::Literal(value) => match value.as_f64() {
                Some(n) => Sql::param(SqlParam::Float(n)),
                None => null_number(),
            },
            Compiled::Json(sql) => {
                let mut cast = sql.clone().wrap();
                cast.push_raw("::DOUBLE PRECISION");
                when_json_type(&sql, "number", cast)
            }
            _ => null_number(),
        })
    }

    fn size(&self, compiled: Compiled) -> Sql {
        match compiled {
            Compiled::Array { sql, .. } => {
                let mut size = call("cardinality", vec![sql]);
                size.push_raw("::DOUBLE PRECISION");
                size
            }
            Compiled::Text(sql) => {
                let mut size = call("char_length", vec![sql]);
                size.push_raw("::DOUBLE PRECISION");
                size
            }
            Compiled::Json(sql) => {
                let mut text = sql.clone().wrap();
                text.push_raw(" #>> '{}'");
                let mut size = Sql::raw("(CASE jsonb_typeof(");
                size.push(sql.clone())
                    .push_raw(") WHEN 'array' THEN jsonb_array_length(")
                    .push(sql)
                    .push_raw(") WHEN 'string' THEN char_length(")
                    .push(text)
                    .push_raw(") END)::DOUBLE PRECISION");
                size
            }
            _ => null_number(),
        }
    }

    /// Components of a `$distance` operand; `None` when it can never be a
    /// numeric vector.
    fn vector(&self, scope: &Scope<'_>, operand: &VectorOperand) -> DbResult<Option<Vec<Sql>>> {
        match operand {
            VectorOperand::Axes(exprs) => exprs
                .iter()
                .map(|e| self.number(self.expression(scope, e)?))
                .collect::<DbResult<Vec<_>>>()
                .map(Some),
            VectorOperand::Single(expr) => match self.expression(scope, expr)? {
                Compiled::Literal(TValue::Array(items)) => Ok(items
                    .iter()
                    .map(|v| v.as_f64().map(|n| Sql::param(SqlParam::Float(n))))
                    .collect()),
                Compiled::Array {
                    sql,
                    data_type: DataType::Vector { dimension },
                } => Ok(Some(
                    (1..=dimension)
                        .map(|i| {
                            let mut element = sql.clone().wrap();
                            element.push_raw(&format!("[{}]", i));
                            element
                        })
                        .collect(),
                )),
                Compiled::Array { data_type, .. } => Err(DbError::UnsupportedOperation(format!(
                    "$distance over {} field",
                    data_type
                ))),
                Compiled::Json(_) => Err(DbError::UnsupportedOperation(
                    "$distance over object field".to_string(),
                )),
                _ => Ok(None),
            },
        }
    }

    fn compare_expressions(
        &self,
        op: ComparisonOp,
        left: Compiled,
        right: Compiled,
    ) -> DbResult<Compiled> {
        let sql = match (left, right) {
            (Compiled::Literal(l), Compiled::Literal(r)) => {
                return Ok(Compiled::Literal(TValue::Bool(compare(op, &l, &r))))
            }
            (Compiled::Literal(TValue::Null), other) | (other, Compiled::Literal(TValue::Null)) => {
                null_comparison(self.to_sql(other)?, op)
            }
            (Compiled::Number(l), Compiled::Number(r)) => self.comparison_sql(l, op, r),
            (Compiled::Text(l), Compiled::Text(r)) => self.comparison_sql(l, op, r),
            (Compiled::Boolean(l), Compiled::Boolean(r)) => self.comparison_sql(l, op, r),
            (Compiled::Date(l), Compiled::Date(r)) => self.comparison_sql(l, op, r),
            (Compiled::Json(l), Compiled::Json(r)) => self.comparison_sql(l, op, r),
            (left, Compiled::Literal(value)) => return self.compare_with_literal(op, left, value, false),
            (Compiled::Literal(value), right) => return self.compare_with_literal(op, right, value, true),
            (Compiled::Json(json), other) => {
                let (json, other) = self.align_json(json, other)?;
                self.comparison_sql(json, op, other)
            }
            (other, Compiled::Json(json)) => {
                let (json, other) = self.align_json(json, other)?;
                self.comparison_sql(other, op, json)
            }
            (left, right) => {
                let both_null = {
                    let mut sql = Sql::raw("(");
                    sql.push(null_comparison(self.to_sql(left)?, ComparisonOp::Eq))
                        .push_raw(" AND ")
                        .push(null_comparison(self.to_sql(right)?, ComparisonOp::Eq))
                        .push_raw(")");
                    sql
                };
                match op {
                    ComparisonOp::Eq => both_null,
                    ComparisonOp::Ne => not_null_false(both_null),
                    _ => Sql::raw("FALSE"),
                }
            }
        };
        Ok(Compiled::Boolean(sql))
    }

    /// Compare SQL of a known kind with a literal; incompatible literals
    /// compare like the evaluator does (never equal, never ordered).
    fn compare_with_literal(
        &self,
        op: ComparisonOp,
        sql: Compiled,
        value: TValue,
        literal_first: bool,
    ) -> DbResult<Compiled> {
        let compatible = match (&sql, &value) {
            (Compiled::Number(_), TValue::Number(_) | TValue::Decimal(_)) => true,
            (Compiled::Text(_), TValue::String(_)) => true,
            (Compiled::Boolean(_), TValue::Bool(_)) => true,
            (Compiled::Date(_), TValue::Date(_)) => true,
            (Compiled::Json(_), _) => true,
            (Compiled::Array { .. }, TValue::Array(_)) => {
                matches!(op, ComparisonOp::Eq | ComparisonOp::Ne)
            }
            _ => false,
        };
        if !compatible {
            return Ok(Compiled::Boolean(match op {
                ComparisonOp::Eq => Sql::raw("FALSE"),
                ComparisonOp::Ne => Sql::raw("TRUE"),
                _ => Sql::raw("FALSE"),
            }));
        }

        let (left, right) = match sql {
            Compiled::Json(json) => {
                let (json, other) = self.align_json(json, Compiled::Literal(value))?;
                (json, other)
            }
            Compiled::Array { sql, data_type } => (sql, encode_value(&data_type, &value)?),
            other => (self.to_sql(other)?, literal_param(&value)),
        };
        let sql = if literal_first {
            self.comparison_sql(right, op, left)
        } else {
            self.comparison_sql(left, op, right)
        };
        Ok(Compiled::Boolean(sql))
    }

    /// Bring a JSONB value and another operand to a common type
    fn align_json(&self, json: Sql, other: Compiled) -> DbResult<(Sql, Sql)> {
        let extract = |kind: &str, cast: &str| {
            let mut value = json.clone().wrap();
            value.push_raw(cast);
            when_json_type(&json, kind, value)
        };
        Ok(match other {
            Compiled::Number(sql) => (extract("number", "::DOUBLE PRECISION"), sql),
            Compiled::Text(sql) => (extract("string", " #>> '{}'"), sql),
            Compiled::Boolean(sql) => (extract("boolean", "::BOOLEAN"), sql),
            Compiled::Date(sql) => {
                let mut value = json.clone().wrap();
                value.push_raw(" ->> '$date'");
                let mut cast = value.wrap();
                cast.push_raw("::TIMESTAMPTZ");
                (when_json_type(&json, "object", cast), sql)
            }
            Compiled::Literal(value) => match value {
                TValue::Number(_) | TValue::Decimal(_) => {
                    (extract("number", "::DOUBLE PRECISION"), literal_param(&value))
                }
                TValue::String(_) => (extract("string", " #>> '{}'"), literal_param(&value)),
                TValue::Bool(_) => (extract("boolean", "::BOOLEAN"), literal_param(&value)),
                _ => (json, encode_json(&value)),
            },
            Compiled::Json(sql) => (json, sql),
            Compiled::Array { .. } => {
                return Err(DbError::UnsupportedOperation(
                    "comparing object and array fields".to_string(),
                ))
            }
        })
    }

    fn comparison_sql(&self, left: Sql, op: ComparisonOp, right: Sql) -> Sql {
        match op {
            ComparisonOp::Eq => self.dialect.null_safe_equal(left, right),
            ComparisonOp::Ne => self.dialect.null_safe_not_equal(left, right),
            _ => infix(left, op.sql_operator(), right),
        }
    }

    pub(super) fn to_sql(&self, compiled: Compiled) -> DbResult<Sql> {
        Ok(match compiled {
            Compiled::Literal(value) => literal_param(&value),
            Compiled::Number(sql)
            | Compiled::Text(sql)
            | Compiled::Boolean(sql)
            | Compiled::Date(sql)
            | Compiled::Json(sql)
            | Compiled::Array { sql, .. } => sql,
        })
    }

    /// Boolean view following the evaluator's truthiness
    pub(super) fn truthy(&self, compiled: Compiled) -> DbResult<Sql> {
        Ok(match compiled {
            Compiled::Literal(value) => Sql::raw(match value {
                TValue::Null => "FALSE",
                TValue::Bool(b) => {
                    if b {
                        "TRUE"
                    } else {
                        "FALSE"
                    }
                }
                TValue::Number(n) => {
                    if n != 0.0 && !n.is_nan() {
                        "TRUE"
                    } else {
                        "FALSE"
                    }
                }
                TValue::String(s) => {
                    if s.is_empty() {
                        "FALSE"
                    } else {
                        "TRUE"
                    }
                }
                _ => "TRUE",
            }),
            Compiled::Boolean(sql) => sql,
            Compiled::Number(sql) => {
                let mut check = Sql::raw("(");
                check
                    .push(sql.clone())
                    .push_raw(" <> 0 AND NOT (")
                    .push(sql)
                    .push_raw(" = 'NaN'::DOUBLE PRECISION))");
                check
            }
            Compiled::Text(sql) => {
                let mut check = sql.wrap();
                check.push_raw(" <> ''");
                check.wrap()
            }
            Compiled::Json(sql) => {
                let mut check = Sql::raw("(");
                check
                    .push(sql.clone())
                    .push_raw(" IS NOT NULL AND ")
                    .push(sql)
                    .push_raw(" NOT IN ('null'::jsonb, 'false'::jsonb, '0'::jsonb, '\"\"'::jsonb))");
                check
            }
            Compiled::Date(sql) | Compiled::Array { sql, .. } => {
                null_comparison(sql, ComparisonOp::Ne)
            }
        })
    }
}
