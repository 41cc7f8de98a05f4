//! Join planning for pointers and relations.

use std::collections::BTreeMap;

use selector_core::{QuerySelector, SortOption};

use super::filter::{ClassScope, Scope};
use super::{push_paging, Populates, QueryCompiler};
use crate::error::{DbError, DbResult};
use crate::query::{DecodedBaseQuery, DecodedQuery};
use crate::schema::{DataType, DEFAULT_KEYS};
use crate::sql::Sql;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopulateKind {
    Pointer,
    /// Stored id array, or resolved through `foreign_field` on the target
    Relation { foreign_field: Option<String> },
}

impl PopulateKind {
    pub fn is_many(&self) -> bool {
        matches!(self, PopulateKind::Relation { .. })
    }
}

/// A planned join of one pointer or relation column
#[derive(Debug, Clone, PartialEq)]
pub struct Populate {
    /// Correlation name, e.g. `Post.author`
    pub alias: String,
    /// Column on the parent class
    pub field: String,
    pub parent_alias: String,
    pub parent_class: String,
    pub class_name: String,
    pub kind: PopulateKind,
    /// Paths requested below this populate
    pub subpaths: Vec<String>,
    pub filter: QuerySelector,
    pub sort: SortOption,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub populates: BTreeMap<String, Populate>,
}

impl Populate {
    /// Projected paths: default keys then requested sub-paths
    pub fn includes(&self) -> Vec<String> {
        let mut includes: Vec<String> = DEFAULT_KEYS.iter().map(|k| k.to_string()).collect();
        for path in &self.subpaths {
            if !includes.contains(path) {
                includes.push(path.clone());
            }
        }
        includes
    }

    pub(super) fn scope(&self) -> ClassScope<'_> {
        ClassScope {
            class_name: &self.class_name,
            alias: &self.alias,
            populates: &self.populates,
        }
    }
}

/// `tags.0.name` addresses every element of a relation
pub(super) fn strip_index(path: &str) -> Option<String> {
    match path.split_once('.') {
        Some((head, rest)) if head.chars().all(|c| c.is_ascii_digit()) => Some(rest.to_string()),
        None if path.chars().all(|c| c.is_ascii_digit()) => None,
        _ => Some(path.to_string()),
    }
}

impl QueryCompiler<'_> {
    pub(super) fn populates(&self, query: &DecodedQuery) -> DbResult<Populates> {
        self.build_populates(
            &query.class_name,
            &query.class_name,
            &query.includes,
            &query.matches,
            "",
        )
    }

    pub(super) fn build_populates(
        &self,
        class_name: &str,
        alias: &str,
        includes: &[String],
        matches: &BTreeMap<String, DecodedBaseQuery>,
        prefix: &str,
    ) -> DbResult<Populates> {
        let mut planned: Vec<(String, &DataType, Vec<String>)> = Vec::new();
        for include in includes {
            let resolved = self.schema.resolve_column(class_name, include)?;
            if !resolved.data_type.is_reference() {
                continue;
            }
            let index = match planned.iter().position(|(c, _, _)| *c == resolved.column) {
                Some(index) => index,
                None => {
                    planned.push((resolved.column.clone(), resolved.data_type, Vec::new()));
                    planned.len() - 1
                }
            };
            let subpath = match (resolved.data_type, resolved.remaining) {
                (_, None) => None,
                (DataType::Relation { .. }, Some(rest)) => strip_index(&rest),
                (_, Some(rest)) => Some(rest),
            };
            if let Some(subpath) = subpath {
                let subpaths = &mut planned[index].2;
                if !subpaths.contains(&subpath) {
                    subpaths.push(subpath);
                }
            }
        }

        let mut populates = BTreeMap::new();
        for (column, data_type, subpaths) in planned {
            let (target, kind) = match data_type {
                DataType::Pointer { target } => (target, PopulateKind::Pointer),
                DataType::Relation {
                    target,
                    foreign_field,
                } => (
                    target,
                    PopulateKind::Relation {
                        foreign_field: foreign_field.clone(),
                    },
                ),
                _ => continue,
            };
            let path = format!("{}{}", prefix, column);
            let base = matches.get(&path).cloned().unwrap_or_default();
            let child_alias = format!("{}.{}", alias, column);

            let mut populate = Populate {
                alias: child_alias,
                field: column.clone(),
                parent_alias: alias.to_string(),
                parent_class: class_name.to_string(),
                class_name: target.clone(),
                kind,
                subpaths,
                filter: base.filter,
                sort: base.sort,
                skip: base.skip,
                limit: base.limit,
                populates: BTreeMap::new(),
            };
            populate.populates = self.build_populates(
                target,
                &populate.alias,
                &populate.includes(),
                matches,
                &format!("{}.", path),
            )?;
            populates.insert(column, populate);
        }
        Ok(populates)
    }

    /// Condition tying rows of the populate to its parent row
    pub(super) fn membership(&self, populate: &Populate) -> DbResult<Sql> {
        let key = reference_expr(&populate.class_name, &populate.alias);
        let parent_column = Sql::column(&populate.parent_alias, &populate.field);

        let mut sql = Sql::raw("(");
        match &populate.kind {
            PopulateKind::Pointer => {
                sql.push(key).push_raw(" = ").push(parent_column);
            }
            PopulateKind::Relation {
                foreign_field: None,
            } => {
                sql.push(key)
                    .push_raw(" = ANY(")
                    .push(parent_column)
                    .push_raw(")");
            }
            PopulateKind::Relation {
                foreign_field: Some(foreign_field),
            } => {
                let parent_key = reference_expr(&populate.parent_class, &populate.parent_alias);
                let foreign = Sql::column(&populate.alias, foreign_field);
                match self.schema.get(&populate.class_name)?.field(foreign_field) {
                    Some(DataType::Pointer { .. }) => {
                        sql.push(foreign).push_raw(" = ").push(parent_key);
                    }
                    Some(DataType::Relation {
                        foreign_field: None,
                        ..
                    }) => {
                        sql.push(parent_key)
                            .push_raw(" = ANY(")
                            .push(foreign)
                            .push_raw(")");
                    }
                    _ => {
                        return Err(DbError::InvalidPath(format!(
                            "{}.{}",
                            populate.class_name, foreign_field
                        )))
                    }
                }
            }
        }
        sql.push_raw(")");
        Ok(sql)
    }

    /// `LEFT JOIN` for every pointer populate, nested joins parenthesized
    pub(super) fn pointer_joins(&self, populates: &Populates) -> DbResult<Sql> {
        let mut sql = Sql::new();
        for populate in populates.values() {
            if populate.kind != PopulateKind::Pointer {
                continue;
            }
            let nested = self.pointer_joins(&populate.populates)?;
            sql.push_raw(" LEFT JOIN ");
            if nested.is_empty() {
                sql.push_ident(&populate.class_name)
                    .push_raw(" AS ")
                    .push_ident(&populate.alias);
            } else {
                sql.push_raw("(")
                    .push_ident(&populate.class_name)
                    .push_raw(" AS ")
                    .push_ident(&populate.alias)
                    .push(nested)
                    .push_raw(")");
            }
            sql.push_raw(" ON ").push(self.membership(populate)?);
            if !populate.filter.is_empty() {
                sql.push_raw(" AND ")
                    .push(self.filter(&Scope::Class(populate.scope()), &populate.filter)?);
            }
        }
        Ok(sql)
    }

    /// Rows of a relation populate: `FROM ... WHERE membership AND filter`
    pub(super) fn relation_source(&self, populate: &Populate) -> DbResult<Sql> {
        let scope = populate.scope();
        let mut sql = Sql::ident(&populate.class_name);
        sql.push_raw(" AS ")
            .push_ident(&populate.alias)
            .push(self.pointer_joins(&populate.populates)?)
            .push_raw(" WHERE ")
            .push(self.membership(populate)?);
        if !populate.filter.is_empty() {
            sql.push_raw(" AND ")
                .push(self.filter(&Scope::Class(scope), &populate.filter)?);
        }
        Ok(sql)
    }

    /// Ordering of a relation populate; stored relations keep array order
    pub(super) fn relation_order(&self, populate: &Populate) -> DbResult<Vec<Sql>> {
        let order = self.order_by(&populate.scope(), &populate.sort)?;
        if !order.is_empty() {
            return Ok(order);
        }
        match populate.kind {
            PopulateKind::Relation {
                foreign_field: None,
            } => {
                let mut sql = Sql::raw("array_position(");
                sql.push(Sql::column(&populate.parent_alias, &populate.field))
                    .push_raw(", ")
                    .push(reference_expr(&populate.class_name, &populate.alias))
                    .push_raw(")");
                Ok(vec![sql])
            }
            _ => Ok(Vec::new()),
        }
    }

    /// JSONB array of the related objects, in relation order
    pub(super) fn relation_projection(&self, populate: &Populate, object: Sql) -> DbResult<Sql> {
        let order = self.relation_order(populate)?;
        let order_clause = Sql::join(order, ", ");

        let mut sql = Sql::raw("(SELECT COALESCE(jsonb_agg(");
        sql.push(Sql::column("$r", "$value"))
            .push_raw(" ORDER BY ")
            .push(Sql::column("$r", "$index"))
            .push_raw("), '[]'::jsonb) FROM (SELECT ")
            .push(object)
            .push_raw(" AS ")
            .push_ident("$value")
            .push_raw(", ROW_NUMBER() OVER (");
        if !order_clause.is_empty() {
            sql.push_raw("ORDER BY ").push(order_clause.clone());
        }
        sql.push_raw(") AS ")
            .push_ident("$index")
            .push_raw(" FROM ")
            .push(self.relation_source(populate)?);
        if !order_clause.is_empty() {
            sql.push_raw(" ORDER BY ").push(order_clause);
        }
        push_paging(&mut sql, populate.skip, populate.limit);
        sql.push_raw(") AS ").push_ident("$r").push_raw(")");
        Ok(sql)
    }

    /// Stored keys of the related objects as a text array
    pub(super) fn relation_keys(&self, populate: &Populate) -> DbResult<Sql> {
        match populate.kind {
            PopulateKind::Relation {
                foreign_field: None,
            } => Ok(Sql::column(&populate.parent_alias, &populate.field)),
            _ => {
                let mut sql = Sql::raw("ARRAY(SELECT ");
                sql.push(reference_expr(&populate.class_name, &populate.alias))
                    .push_raw(" FROM ")
                    .push(self.relation_source(populate)?)
                    .push_raw(")");
                Ok(sql)
            }
        }
    }
}

/// `('Class$' || "alias"."_id")`
pub(super) fn reference_expr(class_name: &str, alias: &str) -> Sql {
    let mut sql = Sql::raw("(");
    sql.push(Sql::literal(format!("{}$", class_name)))
        .push_raw(" || ")
        .push(Sql::column(alias, "_id"))
        .push_raw(")");
    sql
}
