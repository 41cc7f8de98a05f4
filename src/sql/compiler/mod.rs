//! Query compiler
//!
//! Turns a [`DecodedQuery`] into parameterized SQL. The base table is
//! aliased by its class name; every pointer or relation reached by the
//! query becomes a [`Populate`] aliased by its path (`Post.author`,
//! `Post.author.org`). Pointers are joined, relations are projected through
//! correlated sub-selects. Rows come back as a single JSONB object which a
//! [`DecodeRecipe`] turns into the domain object.

mod ddl;
mod expression;
mod filter;
mod mutation;
mod populate;
mod sort;

pub use populate::{Populate, PopulateKind};

use std::cell::Cell;
use std::collections::BTreeMap;

use tracing::debug;

use super::decode::{ColumnDecoder, DecodeRecipe};
use super::{CompiledSql, Sql, SqlDialect};
use crate::error::DbResult;
use crate::query::DecodedQuery;
use crate::schema::{DataType, SchemaMap};
use filter::{ClassScope, Scope};

/// `jsonb_build_object` takes at most 100 arguments
const OBJECT_PAIRS_PER_CALL: usize = 50;

/// Compiled select statement plus the recipe to decode its rows
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSelect {
    pub sql: CompiledSql,
    pub recipe: DecodeRecipe,
}

pub struct QueryCompiler<'a> {
    schema: &'a SchemaMap,
    dialect: &'a dyn SqlDialect,
    select_lock: bool,
    elements: Cell<usize>,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(schema: &'a SchemaMap, dialect: &'a dyn SqlDialect) -> Self {
        Self {
            schema,
            dialect,
            select_lock: false,
            elements: Cell::new(0),
        }
    }

    /// Lock target rows of single-object writes (`FOR UPDATE`)
    pub fn with_select_lock(mut self, select_lock: bool) -> Self {
        self.select_lock = select_lock;
        self
    }

    pub fn schema(&self) -> &SchemaMap {
        self.schema
    }

    /// Fresh alias for an unnested array element
    fn element_alias(&self) -> String {
        let n = self.elements.get();
        self.elements.set(n + 1);
        format!("$e{}", n)
    }

    fn render(&self, sql: Sql) -> CompiledSql {
        let compiled = sql.render(self.dialect);
        debug!(sql = %compiled.text, params = compiled.values.len(), "Compiled statement");
        compiled
    }

    pub fn select(&self, query: &DecodedQuery) -> DbResult<CompiledSelect> {
        let (sql, recipe) = self.select_sql(query)?;
        Ok(CompiledSelect {
            sql: self.render(sql),
            recipe,
        })
    }

    /// `SELECT COUNT(*)`; paging is ignored
    pub fn count(&self, query: &DecodedQuery) -> DbResult<CompiledSql> {
        let populates = self.populates(query)?;
        let scope = ClassScope::root(&query.class_name, &populates);

        let mut sql = Sql::raw("SELECT to_jsonb(COUNT(*)) FROM ");
        sql.push(self.from_clause(&scope)?);
        self.push_where(&mut sql, &scope, &query.filter)?;
        Ok(self.render(sql))
    }

    pub fn explain(&self, query: &DecodedQuery) -> DbResult<CompiledSql> {
        let (select, _) = self.select_sql(query)?;
        let mut sql = Sql::raw("EXPLAIN (FORMAT JSON) ");
        sql.push(select);
        Ok(self.render(sql))
    }

    fn select_sql(&self, query: &DecodedQuery) -> DbResult<(Sql, DecodeRecipe)> {
        let populates = self.populates(query)?;
        let scope = ClassScope::root(&query.class_name, &populates);
        let (object, recipe) = self.projection(&scope, &query.includes)?;

        let mut sql = Sql::raw("SELECT ");
        sql.push(object)
            .push_raw(" AS ")
            .push_ident("$")
            .push_raw(" FROM ")
            .push(self.from_clause(&scope)?);
        self.push_where(&mut sql, &scope, &query.filter)?;
        self.push_order(&mut sql, &scope, &query.sort)?;
        push_paging(&mut sql, query.skip, query.limit);
        Ok((sql, recipe))
    }

    /// `"Class" AS "alias"` followed by the pointer joins of the scope
    fn from_clause(&self, scope: &ClassScope<'_>) -> DbResult<Sql> {
        let mut sql = Sql::ident(scope.class_name);
        sql.push_raw(" AS ")
            .push_ident(scope.alias)
            .push(self.pointer_joins(scope.populates)?);
        Ok(sql)
    }

    fn push_where(
        &self,
        sql: &mut Sql,
        scope: &ClassScope<'_>,
        filter: &selector_core::QuerySelector,
    ) -> DbResult<()> {
        if !filter.is_empty() {
            sql.push_raw(" WHERE ")
                .push(self.filter(&Scope::Class(*scope), filter)?);
        }
        Ok(())
    }

    /// JSONB object holding every included column and populated reference
    fn projection(
        &self,
        scope: &ClassScope<'_>,
        includes: &[String],
    ) -> DbResult<(Sql, DecodeRecipe)> {
        let mut recipe = DecodeRecipe::default();
        let mut pairs = Vec::new();

        for (column, data_type) in self.projected_columns(scope.class_name, includes)? {
            let decoder = self.dialect.decode_type(data_type);
            let mut value = Sql::column(scope.alias, &column);
            if decoder == ColumnDecoder::Decimal {
                value.push_raw("::TEXT");
            }
            pairs.push((column.clone(), value));
            recipe.columns.push((column, decoder));
        }

        for (field, populate) in scope.populates {
            let (object, nested) = self.projection(&populate.scope(), &populate.includes())?;
            let value = match populate.kind {
                PopulateKind::Pointer => {
                    let mut sql = Sql::raw("CASE WHEN ");
                    sql.push(Sql::column(&populate.alias, "_id"))
                        .push_raw(" IS NULL THEN NULL ELSE ")
                        .push(object)
                        .push_raw(" END");
                    sql
                }
                PopulateKind::Relation { .. } => self.relation_projection(populate, object)?,
            };
            pairs.push((field.clone(), value));
            recipe
                .populates
                .push((field.clone(), populate.kind.is_many(), nested));
        }

        Ok((build_object(pairs), recipe))
    }

    /// Stored columns reached by `includes`, shapes expanded to their leaves
    fn projected_columns(
        &self,
        class_name: &str,
        includes: &[String],
    ) -> DbResult<Vec<(String, &'a DataType)>> {
        let schema = self.schema.get(class_name)?;
        let mut columns: Vec<(String, &'a DataType)> = Vec::new();
        let mut push = |column: String, data_type: &'a DataType| {
            if !data_type.is_reference() && !columns.iter().any(|(c, _)| *c == column) {
                columns.push((column, data_type));
            }
        };

        for include in includes {
            let resolved = self.schema.resolve_column(class_name, include)?;
            if resolved.data_type.is_shape() {
                let prefix = format!("{}.", resolved.column);
                for (column, data_type) in schema.columns() {
                    if column.starts_with(&prefix) {
                        push(column, data_type);
                    }
                }
            } else {
                push(resolved.column, resolved.data_type);
            }
        }
        Ok(columns)
    }
}

/// `jsonb_build_object(...) || jsonb_build_object(...)`
fn build_object(pairs: Vec<(String, Sql)>) -> Sql {
    if pairs.is_empty() {
        return Sql::raw("'{}'::jsonb");
    }
    let mut calls = Vec::new();
    let mut pairs = pairs.into_iter().peekable();
    while pairs.peek().is_some() {
        let chunk = pairs.by_ref().take(OBJECT_PAIRS_PER_CALL).map(|(key, value)| {
            let mut sql = Sql::literal(key);
            sql.push_raw(", ").push(value);
            sql
        });
        let mut call = Sql::raw("jsonb_build_object(");
        call.push(Sql::join(chunk.collect::<Vec<_>>(), ", "))
            .push_raw(")");
        calls.push(call);
    }
    Sql::join(calls, " || ")
}

fn push_paging(sql: &mut Sql, skip: Option<u64>, limit: Option<u64>) {
    if let Some(limit) = limit {
        sql.push_raw(&format!(" LIMIT {}", limit));
    }
    if let Some(skip) = skip.filter(|s| *s > 0) {
        sql.push_raw(&format!(" OFFSET {}", skip));
    }
}

/// Populates of a query keyed by column
type Populates = BTreeMap<String, Populate>;
