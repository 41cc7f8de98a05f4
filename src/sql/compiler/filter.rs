//! Selector compilation.
//!
//! Results follow the in-memory evaluator: a missing value never satisfies
//! an ordered comparison, and negations treat SQL `NULL` as false before
//! negating.

use selector_core::{
    ComparisonOp, ConditionalType, FieldExpression, MembershipOp, Pattern, QuerySelector, SetOp,
    TValue, ELEMENT_FIELD,
};

use super::populate::{strip_index, Populate};
use super::{Populates, QueryCompiler};
use crate::error::{DbError, DbResult};
use crate::schema::DataType;
use crate::sql::encode::{encode_json, encode_list, encode_value};
use crate::sql::{Sql, SqlParam};

/// A class row reachable under `alias`
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClassScope<'p> {
    pub class_name: &'p str,
    pub alias: &'p str,
    pub populates: &'p Populates,
}

impl<'p> ClassScope<'p> {
    /// Base table, aliased by its class name
    pub fn root(class_name: &'p str, populates: &'p Populates) -> Self {
        Self {
            class_name,
            alias: class_name,
            populates,
        }
    }

    fn populate(&self, column: &str) -> DbResult<&'p Populate> {
        self.populates
            .get(column)
            .ok_or_else(|| DbError::InvalidPath(format!("{}.{} is not populated", self.class_name, column)))
    }
}

/// What a selector's field names are resolved against
#[derive(Debug, Clone)]
pub(crate) enum Scope<'p> {
    Class(ClassScope<'p>),
    /// Inside `$every`/`$some` over an array; `"$"` names the element
    Element(Operand<'p>),
}

/// A resolved field reference
#[derive(Debug, Clone)]
pub(crate) enum Operand<'p> {
    Scalar { sql: Sql, data_type: DataType },
    Json(Sql),
    /// String, vector or JSONB array column
    Array { sql: Sql, data_type: DataType },
    Relation(&'p Populate),
    /// Sub-path of a relation: matches when any related object matches
    RelationPath { populate: &'p Populate, path: String },
}

fn unsupported(what: &str, expr: &FieldExpression) -> DbError {
    DbError::UnsupportedOperation(format!("{} on {} field", operator_name(expr), what))
}

fn operator_name(expr: &FieldExpression) -> &'static str {
    match expr {
        FieldExpression::Comparison { op, .. } => match op {
            ComparisonOp::Eq => "$eq",
            ComparisonOp::Ne => "$ne",
            ComparisonOp::Lt => "$lt",
            ComparisonOp::Lte => "$lte",
            ComparisonOp::Gt => "$gt",
            ComparisonOp::Gte => "$gte",
        },
        FieldExpression::Membership { op, .. } => match op {
            MembershipOp::In => "$in",
            MembershipOp::Nin => "$nin",
        },
        FieldExpression::Set { op, .. } => match op {
            SetOp::Subset => "$subset",
            SetOp::Superset => "$superset",
            SetOp::Intersect => "$intersect",
        },
        FieldExpression::Not(_) => "$not",
        FieldExpression::Type(_) => "$type",
        FieldExpression::Pattern(_) => "$pattern",
        FieldExpression::Size(_) => "$size",
        FieldExpression::Every(_) => "$every",
        FieldExpression::Some(_) => "$some",
    }
}

/// `'{a,b}'` path literal for `#>`
pub(super) fn json_path_literal(path: &str) -> Sql {
    let segments: Vec<String> = path
        .split('.')
        .map(|s| format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    Sql::literal(format!("{{{}}}", segments.join(",")))
}

fn json_path(sql: Sql, path: &str) -> Sql {
    let mut out = Sql::raw("(");
    out.push(sql).push_raw(" #> ").push(json_path_literal(path)).push_raw(")");
    out
}

/// `CASE WHEN jsonb_typeof(x) = 'kind' THEN then END`
pub(super) fn when_json_type(sql: &Sql, kind: &str, then: Sql) -> Sql {
    let mut out = Sql::raw("(CASE WHEN jsonb_typeof(");
    out.push(sql.clone())
        .push_raw(&format!(") = '{}' THEN ", kind))
        .push(then)
        .push_raw(" END)");
    out
}

pub(super) fn not_null_false(sql: Sql) -> Sql {
    let mut out = Sql::raw("(NOT COALESCE(");
    out.push(sql).push_raw(", FALSE))");
    out
}

fn binary(left: Sql, operator: &str, right: Sql) -> Sql {
    let mut sql = Sql::raw("(");
    sql.push(left)
        .push_raw(&format!(" {} ", operator))
        .push(right)
        .push_raw(")");
    sql
}

fn any_of(items: Vec<Sql>) -> Sql {
    if items.is_empty() {
        Sql::raw("FALSE")
    } else {
        Sql::join(items, " OR ").wrap()
    }
}

/// Comparison against a value known to be `null`
pub(super) fn null_comparison(sql: Sql, op: ComparisonOp) -> Sql {
    match op {
        ComparisonOp::Eq => {
            let mut out = sql.wrap();
            out.push_raw(" IS NULL");
            out.wrap()
        }
        ComparisonOp::Ne => {
            let mut out = sql.wrap();
            out.push_raw(" IS NOT NULL");
            out.wrap()
        }
        _ => Sql::raw("FALSE"),
    }
}

fn like_pattern(text: &str) -> String {
    let escaped = text
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// Embedded options reproducing the `m`/`s` flags of the selector regex
fn regex_options(flags: &str) -> &'static str {
    match (flags.contains('m'), flags.contains('s')) {
        (false, false) => "(?p)",
        (true, false) => "(?n)",
        (true, true) => "(?w)",
        (false, true) => "",
    }
}

impl<'a> QueryCompiler<'a> {
    pub(super) fn filter(&self, scope: &Scope<'_>, selector: &QuerySelector) -> DbResult<Sql> {
        match selector {
            QuerySelector::Conditional { kind, exprs } => {
                let parts = exprs
                    .iter()
                    .map(|e| self.filter(scope, e))
                    .collect::<DbResult<Vec<_>>>()?;
                Ok(match (kind, parts.is_empty()) {
                    (ConditionalType::And, true) | (ConditionalType::Nor, true) => Sql::raw("TRUE"),
                    (ConditionalType::Or, true) => Sql::raw("FALSE"),
                    (ConditionalType::And, false) => Sql::join(parts, " AND ").wrap(),
                    (ConditionalType::Or, false) => Sql::join(parts, " OR ").wrap(),
                    (ConditionalType::Nor, false) => not_null_false(Sql::join(parts, " OR ")),
                })
            }
            QuerySelector::Field { field, expr } => {
                let operand = self.resolve(scope, field)?;
                self.field_expression(&operand, expr)
            }
            QuerySelector::Expression(expr) => {
                let compiled = self.expression(scope, expr)?;
                let mut sql = Sql::raw("COALESCE(");
                sql.push(self.truthy(compiled)?).push_raw(", FALSE)");
                Ok(sql)
            }
        }
    }

    /// Resolve a field name in a scope
    pub(super) fn resolve<'p>(&self, scope: &Scope<'p>, field: &str) -> DbResult<Operand<'p>> {
        match scope {
            Scope::Class(class) => self.operand(*class, field),
            Scope::Element(element) if field == ELEMENT_FIELD => Ok(element.clone()),
            Scope::Element(Operand::Json(sql)) => Ok(Operand::Json(json_path(sql.clone(), field))),
            Scope::Element(_) => Err(DbError::InvalidPath(field.to_string())),
        }
    }

    /// Resolve a dotted path against a class row
    pub(super) fn operand<'p>(&self, scope: ClassScope<'p>, path: &str) -> DbResult<Operand<'p>> {
        let resolved = self.schema.resolve_column(scope.class_name, path)?;
        let column = Sql::column(scope.alias, &resolved.column);
        let invalid = || DbError::InvalidPath(format!("{}.{}", scope.class_name, path));

        match (resolved.data_type, resolved.remaining) {
            (DataType::Pointer { .. }, Some(rest)) => {
                let populate = scope.populate(&resolved.column)?;
                self.operand(populate.scope(), &rest)
            }
            (DataType::Relation { .. }, None) => {
                Ok(Operand::Relation(scope.populate(&resolved.column)?))
            }
            (DataType::Relation { .. }, Some(rest)) => {
                let populate = scope.populate(&resolved.column)?;
                let path = strip_index(&rest).ok_or_else(invalid)?;
                Ok(Operand::RelationPath { populate, path })
            }
            (DataType::Object, None) => Ok(Operand::Json(column)),
            (DataType::Object, Some(rest)) => Ok(Operand::Json(json_path(column, &rest))),
            (
                data_type @ (DataType::StringArray | DataType::Array | DataType::Vector { .. }),
                None,
            ) => Ok(Operand::Array {
                sql: column,
                data_type: data_type.clone(),
            }),
            (
                data_type @ (DataType::StringArray | DataType::Array | DataType::Vector { .. }),
                Some(rest),
            ) => {
                let (head, tail) = match rest.split_once('.') {
                    Some((head, tail)) => (head.to_string(), Some(tail.to_string())),
                    None => (rest.clone(), None),
                };
                let index: u64 = head.parse().map_err(|_| invalid())?;
                let mut element = column.wrap();
                element.push_raw(&format!("[{}]", index + 1));
                match (data_type, tail) {
                    (DataType::StringArray, None) => Ok(Operand::Scalar {
                        sql: element,
                        data_type: DataType::String,
                    }),
                    (DataType::Vector { .. }, None) => Ok(Operand::Scalar {
                        sql: element,
                        data_type: DataType::Number,
                    }),
                    (DataType::Array, None) => Ok(Operand::Json(element)),
                    (DataType::Array, Some(tail)) => Ok(Operand::Json(json_path(element, &tail))),
                    _ => Err(invalid()),
                }
            }
            (DataType::Shape(_), _) => Err(DbError::UnsupportedOperation(format!(
                "cannot compare shape '{}'",
                path
            ))),
            (_, Some(_)) => Err(invalid()),
            (data_type, None) => Ok(Operand::Scalar {
                sql: column,
                data_type: data_type.clone(),
            }),
        }
    }

    fn field_expression(&self, operand: &Operand<'_>, expr: &FieldExpression) -> DbResult<Sql> {
        if let FieldExpression::Not(inner) = expr {
            return Ok(not_null_false(self.field_expression(operand, inner)?));
        }
        match operand {
            Operand::Scalar { sql, data_type } => self.scalar_expression(sql, data_type, expr),
            Operand::Json(sql) => self.json_expression(sql, expr),
            Operand::Array { sql, data_type } => self.array_expression(sql, data_type, expr),
            Operand::Relation(populate) => self.relation_expression(populate, expr),
            Operand::RelationPath { populate, path } => {
                let inner = QuerySelector::Field {
                    field: path.clone(),
                    expr: expr.clone(),
                };
                self.relation_exists(populate, &inner, false)
            }
        }
    }

    fn comparison(&self, left: Sql, op: ComparisonOp, right: Sql) -> Sql {
        match op {
            ComparisonOp::Eq => self.dialect.null_safe_equal(left, right),
            ComparisonOp::Ne => self.dialect.null_safe_not_equal(left, right),
            _ => binary(left, op.sql_operator(), right),
        }
    }

    fn pattern(&self, sql: Sql, pattern: &Pattern) -> DbResult<Sql> {
        pattern.to_regex()?;
        Ok(match pattern {
            Pattern::Contains(text) => binary(
                sql,
                "LIKE",
                Sql::param(SqlParam::Text(like_pattern(text))),
            ),
            Pattern::Regex { source, flags } => {
                let operator = if flags.contains('i') { "~*" } else { "~" };
                let source = format!("{}{}", regex_options(flags), source);
                binary(sql, operator, Sql::param(SqlParam::Text(source)))
            }
        })
    }

    fn scalar_expression(
        &self,
        sql: &Sql,
        data_type: &DataType,
        expr: &FieldExpression,
    ) -> DbResult<Sql> {
        match expr {
            FieldExpression::Comparison { op, value } => {
                if value.is_null() {
                    return Ok(null_comparison(sql.clone(), *op));
                }
                if !value.is_scalar() {
                    return Err(DbError::InvalidValue(format!(
                        "cannot compare {} field with {}",
                        data_type,
                        value.type_name()
                    )));
                }
                let value = encode_value(data_type, value)?;
                Ok(self.comparison(sql.clone(), *op, value))
            }
            FieldExpression::Membership { op, values } => {
                let items = values
                    .iter()
                    .map(|v| self.scalar_expression(sql, data_type, &FieldExpression::Comparison {
                        op: ComparisonOp::Eq,
                        value: v.clone(),
                    }))
                    .collect::<DbResult<Vec<_>>>()?;
                let found = any_of(items);
                Ok(match op {
                    MembershipOp::In => found,
                    MembershipOp::Nin => not_null_false(found),
                })
            }
            FieldExpression::Type(names) => {
                let mut checks = Vec::new();
                if names.iter().any(|n| n == "null") {
                    checks.push(null_comparison(sql.clone(), ComparisonOp::Eq));
                }
                if names.iter().any(|n| n == data_type.value_type_name()) {
                    checks.push(null_comparison(sql.clone(), ComparisonOp::Ne));
                }
                Ok(any_of(checks))
            }
            FieldExpression::Pattern(pattern) if *data_type == DataType::String => {
                self.pattern(sql.clone(), pattern)
            }
            _ => Err(unsupported(&data_type.to_string(), expr)),
        }
    }

    fn json_comparison(&self, sql: &Sql, op: ComparisonOp, value: &TValue) -> DbResult<Sql> {
        if value.is_null() {
            let mut is_null = Sql::raw("(");
            is_null
                .push(sql.clone())
                .push_raw(" IS NULL OR ")
                .push(sql.clone())
                .push_raw(" = 'null'::jsonb)");
            return Ok(match op {
                ComparisonOp::Eq => is_null,
                ComparisonOp::Ne => not_null_false(is_null),
                _ => Sql::raw("FALSE"),
            });
        }
        if matches!(op, ComparisonOp::Eq | ComparisonOp::Ne) {
            return Ok(self.comparison(sql.clone(), op, encode_json(value)));
        }

        let (kind, extracted, param) = match value {
            TValue::Number(_) | TValue::Decimal(_) => {
                let mut cast = sql.clone().wrap();
                cast.push_raw("::DOUBLE PRECISION");
                let number = value.as_f64().ok_or_else(|| {
                    DbError::InvalidValue(format!("invalid number {:?}", value))
                })?;
                ("number", cast, SqlParam::Float(number))
            }
            TValue::String(s) => {
                let mut text = sql.clone().wrap();
                text.push_raw(" #>> '{}'");
                ("string", text, SqlParam::Text(s.clone()))
            }
            TValue::Bool(b) => {
                let mut cast = sql.clone().wrap();
                cast.push_raw("::BOOLEAN");
                ("boolean", cast, SqlParam::Bool(*b))
            }
            TValue::Date(d) => {
                let mut cast = sql.clone().wrap();
                cast.push_raw(" ->> '$date'");
                let mut cast = cast.wrap();
                cast.push_raw("::TIMESTAMPTZ");
                ("object", cast, SqlParam::Timestamp(*d))
            }
            other => {
                return Err(DbError::InvalidValue(format!(
                    "cannot order by {} value",
                    other.type_name()
                )))
            }
        };
        Ok(binary(
            when_json_type(sql, kind, extracted),
            op.sql_operator(),
            Sql::param(param),
        ))
    }

    fn json_type_check(&self, sql: &Sql, name: &str) -> Sql {
        let typeof_is = |kind: &str| {
            let mut check = Sql::raw("(jsonb_typeof(");
            check.push(sql.clone()).push_raw(&format!(") = '{}')", kind));
            check
        };
        let has_key = |key: &str| {
            let mut check = Sql::raw("(");
            check.push(sql.clone()).push_raw(&format!(" ? '{}')", key));
            check
        };
        match name {
            "null" => {
                let mut check = Sql::raw("(");
                check
                    .push(sql.clone())
                    .push_raw(" IS NULL OR ")
                    .push(typeof_is("null"))
                    .push_raw(")");
                check
            }
            "boolean" | "number" | "string" | "array" => typeof_is(name),
            "object" => {
                let mut check = Sql::raw("(");
                check
                    .push(typeof_is("object"))
                    .push_raw(" AND NOT ")
                    .push(has_key("$date"))
                    .push_raw(" AND NOT ")
                    .push(has_key("$decimal"))
                    .push_raw(")");
                check
            }
            "date" | "decimal" => {
                let mut check = Sql::raw("(");
                check
                    .push(typeof_is("object"))
                    .push_raw(" AND ")
                    .push(has_key(&format!("${}", name)))
                    .push_raw(")");
                check
            }
            _ => Sql::raw("FALSE"),
        }
    }

    fn json_expression(&self, sql: &Sql, expr: &FieldExpression) -> DbResult<Sql> {
        match expr {
            FieldExpression::Comparison { op, value } => self.json_comparison(sql, *op, value),
            FieldExpression::Membership { op, values } => {
                let items = values
                    .iter()
                    .map(|v| self.json_comparison(sql, ComparisonOp::Eq, v))
                    .collect::<DbResult<Vec<_>>>()?;
                let found = any_of(items);
                Ok(match op {
                    MembershipOp::In => found,
                    MembershipOp::Nin => not_null_false(found),
                })
            }
            FieldExpression::Set { op, values } => {
                let values = encode_json(&TValue::Array(values.clone()));
                let check = match op {
                    SetOp::Superset => binary(sql.clone(), "@>", values),
                    SetOp::Subset => binary(values, "@>", sql.clone()),
                    SetOp::Intersect => {
                        let alias = self.element_alias();
                        let mut exists = Sql::raw("EXISTS (SELECT 1 FROM jsonb_array_elements(");
                        exists
                            .push(sql.clone())
                            .push_raw(") AS ")
                            .push_ident(&alias)
                            .push_raw("(\"value\") WHERE ")
                            .push(values)
                            .push_raw(" @> jsonb_build_array(")
                            .push(Sql::column(&alias, "value"))
                            .push_raw("))");
                        exists
                    }
                };
                Ok(when_json_type(sql, "array", check))
            }
            FieldExpression::Type(names) => Ok(any_of(
                names.iter().map(|n| self.json_type_check(sql, n)).collect(),
            )),
            FieldExpression::Pattern(pattern) => {
                let mut text = sql.clone().wrap();
                text.push_raw(" #>> '{}'");
                self.pattern(when_json_type(sql, "string", text), pattern)
            }
            FieldExpression::Size(size) => {
                let mut length = Sql::raw("jsonb_array_length(");
                length.push(sql.clone()).push_raw(")");
                let mut check = when_json_type(sql, "array", length);
                check.push_raw(&format!(" = {}", size));
                Ok(check.wrap())
            }
            FieldExpression::Some(inner) | FieldExpression::Every(inner) => {
                let every = matches!(expr, FieldExpression::Every(_));
                let alias = self.element_alias();
                let mut source = Sql::raw("jsonb_array_elements(CASE WHEN jsonb_typeof(");
                source
                    .push(sql.clone())
                    .push_raw(") = 'array' THEN ")
                    .push(sql.clone())
                    .push_raw(" ELSE '[]'::jsonb END)");
                let element = Operand::Json(Sql::column(&alias, "value"));
                let quantified = self.quantify(source, &alias, element, inner, every)?;
                if every {
                    let mut check = Sql::raw("(");
                    check
                        .push(self.json_type_check(sql, "array"))
                        .push_raw(" AND ")
                        .push(quantified)
                        .push_raw(")");
                    Ok(check)
                } else {
                    Ok(quantified)
                }
            }
            FieldExpression::Not(inner) => Ok(not_null_false(self.json_expression(sql, inner)?)),
        }
    }

    fn array_expression(
        &self,
        sql: &Sql,
        data_type: &DataType,
        expr: &FieldExpression,
    ) -> DbResult<Sql> {
        match expr {
            FieldExpression::Comparison { op, value } if value.is_null() => {
                Ok(null_comparison(sql.clone(), *op))
            }
            FieldExpression::Comparison {
                op: op @ (ComparisonOp::Eq | ComparisonOp::Ne),
                value,
            } => Ok(self.comparison(sql.clone(), *op, encode_value(data_type, value)?)),
            FieldExpression::Membership { op, values } => {
                let items = values
                    .iter()
                    .map(|v| {
                        self.array_expression(sql, data_type, &FieldExpression::Comparison {
                            op: ComparisonOp::Eq,
                            value: v.clone(),
                        })
                    })
                    .collect::<DbResult<Vec<_>>>()?;
                let found = any_of(items);
                Ok(match op {
                    MembershipOp::In => found,
                    MembershipOp::Nin => not_null_false(found),
                })
            }
            FieldExpression::Set { op, values } => {
                let values = encode_list(data_type, values)?;
                Ok(match op {
                    SetOp::Subset => binary(sql.clone(), "<@", values),
                    SetOp::Superset => binary(sql.clone(), "@>", values),
                    SetOp::Intersect => binary(sql.clone(), "&&", values),
                })
            }
            FieldExpression::Type(names) => {
                let mut checks = Vec::new();
                if names.iter().any(|n| n == "null") {
                    checks.push(null_comparison(sql.clone(), ComparisonOp::Eq));
                }
                if names.iter().any(|n| n == "array") {
                    checks.push(null_comparison(sql.clone(), ComparisonOp::Ne));
                }
                Ok(any_of(checks))
            }
            FieldExpression::Size(size) => {
                let mut check = Sql::raw("(cardinality(");
                check.push(sql.clone()).push_raw(&format!(") = {})", size));
                Ok(check)
            }
            FieldExpression::Some(inner) | FieldExpression::Every(inner) => {
                let every = matches!(expr, FieldExpression::Every(_));
                let alias = self.element_alias();
                let mut source = Sql::raw("unnest(");
                source.push(sql.clone()).push_raw(")");
                let value = Sql::column(&alias, "value");
                let element = match data_type {
                    DataType::StringArray => Operand::Scalar {
                        sql: value,
                        data_type: DataType::String,
                    },
                    DataType::Vector { .. } => Operand::Scalar {
                        sql: value,
                        data_type: DataType::Number,
                    },
                    _ => Operand::Json(value),
                };
                let quantified = self.quantify(source, &alias, element, inner, every)?;
                if every {
                    let mut check = null_comparison(sql.clone(), ComparisonOp::Ne);
                    check.push_raw(" AND ").push(quantified);
                    Ok(check.wrap())
                } else {
                    Ok(quantified)
                }
            }
            _ => Err(unsupported(&data_type.to_string(), expr)),
        }
    }

    /// `EXISTS` (or `NOT EXISTS ... NOT` for `$every`) over unnested elements
    fn quantify(
        &self,
        source: Sql,
        alias: &str,
        element: Operand<'_>,
        inner: &QuerySelector,
        every: bool,
    ) -> DbResult<Sql> {
        let condition = self.filter(&Scope::Element(element), inner)?;
        let mut sql = Sql::raw(if every { "NOT EXISTS (SELECT 1 FROM " } else { "EXISTS (SELECT 1 FROM " });
        sql.push(source)
            .push_raw(" AS ")
            .push_ident(alias)
            .push_raw("(\"value\") WHERE ")
            .push(if every { not_null_false(condition) } else { condition })
            .push_raw(")");
        Ok(sql)
    }

    fn relation_expression(&self, populate: &Populate, expr: &FieldExpression) -> DbResult<Sql> {
        let relation = DataType::Relation {
            target: populate.class_name.clone(),
            foreign_field: None,
        };
        match expr {
            FieldExpression::Set { op, values } => {
                let keys = self.relation_keys(populate)?;
                let values = encode_list(&relation, values)?;
                Ok(match op {
                    SetOp::Subset => binary(keys, "<@", values),
                    SetOp::Superset => binary(keys, "@>", values),
                    SetOp::Intersect => binary(keys, "&&", values),
                })
            }
            FieldExpression::Size(size) => {
                let mut check = Sql::raw("(COALESCE(cardinality(");
                check
                    .push(self.relation_keys(populate)?)
                    .push_raw(&format!("), 0) = {})", size));
                Ok(check)
            }
            FieldExpression::Type(names) => Ok(Sql::raw(if names.iter().any(|n| n == "array") {
                "TRUE"
            } else {
                "FALSE"
            })),
            FieldExpression::Some(inner) => self.relation_exists(populate, inner, false),
            FieldExpression::Every(inner) => self.relation_exists(populate, inner, true),
            _ => Err(unsupported("relation", expr)),
        }
    }

    /// Related objects matching `inner` exist (or, for `every`, none fail it)
    pub(super) fn relation_exists(
        &self,
        populate: &Populate,
        inner: &QuerySelector,
        every: bool,
    ) -> DbResult<Sql> {
        let condition = self.filter(&Scope::Class(populate.scope()), inner)?;
        let mut sql = Sql::raw(if every { "NOT EXISTS (SELECT 1 FROM " } else { "EXISTS (SELECT 1 FROM " });
        sql.push(self.relation_source(populate)?)
            .push_raw(" AND ")
            .push(if every { not_null_false(condition) } else { condition })
            .push_raw(")");
        Ok(sql)
    }
}
