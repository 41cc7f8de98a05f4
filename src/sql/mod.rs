//! SQL generation
//!
//! Statements are assembled from [`Sql`] fragments made of raw text,
//! identifiers, string literals and bound parameters. A [`SqlDialect`]
//! renders the fragments into text plus positional values.

pub mod compiler;
pub mod decode;
pub mod encode;
pub mod postgres;

pub use compiler::{CompiledSelect, Populate, PopulateKind, QueryCompiler};
pub use decode::{ColumnDecoder, DecodeRecipe};
pub use postgres::PostgresDialect;

use chrono::{DateTime, Utc};
use selector_core::UpdateOp;
use serde_json::Value;

use crate::error::DbResult;
use crate::schema::DataType;

/// A bound parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Bool(bool),
    Float(f64),
    /// Arbitrary precision number in textual form
    Decimal(String),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(Value),
    TextArray(Vec<String>),
    FloatArray(Vec<f64>),
    JsonArray(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq)]
enum SqlPart {
    Raw(String),
    Ident(String),
    Literal(String),
    Param(SqlParam),
}

/// SQL fragment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sql {
    parts: Vec<SqlPart>,
}

impl Sql {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            parts: vec![SqlPart::Raw(text.into())],
        }
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Self {
            parts: vec![SqlPart::Ident(name.into())],
        }
    }

    /// `"alias"."column"`
    pub fn column(alias: &str, column: &str) -> Self {
        let mut sql = Sql::ident(alias);
        sql.push_raw(".").push_ident(column);
        sql
    }

    /// Quoted string literal
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            parts: vec![SqlPart::Literal(text.into())],
        }
    }

    pub fn param(value: SqlParam) -> Self {
        Self {
            parts: vec![SqlPart::Param(value)],
        }
    }

    pub fn null() -> Self {
        Sql::raw("NULL")
    }

    pub fn push(&mut self, other: Sql) -> &mut Self {
        self.parts.extend(other.parts);
        self
    }

    pub fn push_raw(&mut self, text: &str) -> &mut Self {
        match self.parts.last_mut() {
            Some(SqlPart::Raw(last)) => last.push_str(text),
            _ => self.parts.push(SqlPart::Raw(text.to_string())),
        }
        self
    }

    pub fn push_ident(&mut self, name: &str) -> &mut Self {
        self.parts.push(SqlPart::Ident(name.to_string()));
        self
    }

    pub fn push_param(&mut self, value: SqlParam) -> &mut Self {
        self.parts.push(SqlPart::Param(value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// `(self)`
    pub fn wrap(self) -> Sql {
        let mut sql = Sql::raw("(");
        sql.push(self).push_raw(")");
        sql
    }

    /// Join fragments with a separator
    pub fn join(items: impl IntoIterator<Item = Sql>, separator: &str) -> Sql {
        let mut sql = Sql::new();
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                sql.push_raw(separator);
            }
            sql.push(item);
        }
        sql
    }

    /// Render to text; parameters are numbered from 1 in order of appearance.
    pub fn render(&self, dialect: &dyn SqlDialect) -> CompiledSql {
        let mut text = String::new();
        let mut values = Vec::new();
        for part in &self.parts {
            match part {
                SqlPart::Raw(raw) => text.push_str(raw),
                SqlPart::Ident(name) => text.push_str(&dialect.identifier(name)),
                SqlPart::Literal(literal) => text.push_str(&dialect.quote(literal)),
                SqlPart::Param(value) => {
                    values.push(value.clone());
                    text.push_str(&dialect.placeholder(values.len(), value));
                }
            }
        }
        CompiledSql { text, values }
    }
}

impl From<&str> for Sql {
    fn from(text: &str) -> Self {
        Sql::raw(text)
    }
}

/// Rendered statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledSql {
    pub text: String,
    pub values: Vec<SqlParam>,
}

impl CompiledSql {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            values: Vec::new(),
        }
    }
}

/// Backend specific rendering rules
pub trait SqlDialect: Send + Sync {
    /// String literal
    fn quote(&self, text: &str) -> String;

    /// Quoted identifier
    fn identifier(&self, name: &str) -> String;

    /// Placeholder for the `index`-th parameter (1-based)
    fn placeholder(&self, index: usize, value: &SqlParam) -> String;

    fn null_safe_equal(&self, left: Sql, right: Sql) -> Sql;

    fn null_safe_not_equal(&self, left: Sql, right: Sql) -> Sql;

    /// Column type for a schema type; `None` when no column is stored
    fn encode_type(&self, data_type: &DataType) -> Option<&'static str>;

    /// How a projected column is turned back into a value
    fn decode_type(&self, data_type: &DataType) -> ColumnDecoder;

    /// Right-hand side of `SET column = ...` for an update operator.
    ///
    /// `value` is the already encoded operand; pop counts come from `op`.
    fn update_operation(
        &self,
        column: &str,
        data_type: &DataType,
        op: &UpdateOp,
        value: Sql,
    ) -> DbResult<Sql>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_numbers_params() {
        let dialect = PostgresDialect;
        let mut sql = Sql::raw("SELECT * FROM ");
        sql.push_ident("Post")
            .push_raw(" WHERE ")
            .push(Sql::column("Post", "title"))
            .push_raw(" = ")
            .push_param(SqlParam::Text("Hello".to_string()))
            .push_raw(" AND ")
            .push(Sql::column("Post", "views"))
            .push_raw(" > ")
            .push_param(SqlParam::Float(10.0));

        let compiled = sql.render(&dialect);
        assert_eq!(
            compiled.text,
            "SELECT * FROM \"Post\" WHERE \"Post\".\"title\" = $1::TEXT AND \"Post\".\"views\" > $2::DOUBLE PRECISION"
        );
        assert_eq!(compiled.values.len(), 2);
    }

    #[test]
    fn test_join_and_wrap() {
        let dialect = PostgresDialect;
        let sql = Sql::join(vec![Sql::raw("a"), Sql::raw("b"), Sql::raw("c")], " OR ").wrap();
        assert_eq!(sql.render(&dialect).text, "(a OR b OR c)");
        assert_eq!(Sql::join(Vec::new(), ", ").render(&dialect).text, "");
    }

    #[test]
    fn test_literal_and_identifier_escaping() {
        let dialect = PostgresDialect;
        let mut sql = Sql::literal("it's");
        sql.push_raw(" ").push_ident("we\"ird");
        assert_eq!(sql.render(&dialect).text, "'it''s' \"we\"\"ird\"");
    }
}
