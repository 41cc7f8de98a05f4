//! Write statements.
//!
//! Every mutation is a single statement built around a `"_mutated"` CTE
//! holding the written rows; the outer select projects them through the
//! same populate machinery as [`QueryCompiler::select`]. Single-object
//! writes pick their row with a `"_target"` CTE: filtered, sorted and
//! limited to one row.

use std::collections::BTreeMap;

use selector_core::{TValue, UpdateOp};

use super::filter::{json_path_literal, ClassScope};
use super::{push_paging, CompiledSelect, QueryCompiler};
use crate::error::{DbError, DbResult};
use crate::query::{DecodedQuery, InsertOptions, InsertValues, UpdateSpec};
use crate::schema::{DataType, READ_ONLY_KEYS};
use crate::sql::encode::{encode_json, encode_list, encode_value};
use crate::sql::{CompiledSql, Sql, SqlParam};

const ID_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z',
];

/// Fresh alphanumeric object id
pub fn generate_object_id(size: usize) -> String {
    nanoid::nanoid!(size, &ID_ALPHABET)
}

/// One `SET` entry; object sub-path writes chain `jsonb_set` on one column
#[derive(Debug)]
struct Assignment {
    column: String,
    value: Sql,
    json_patch: bool,
}

fn read_only(key: &str) -> DbError {
    DbError::InvalidKey(format!("'{}' is read-only", key))
}

impl QueryCompiler<'_> {
    pub fn insert(&self, options: &InsertOptions, values: &[InsertValues]) -> DbResult<CompiledSelect> {
        let rows = values
            .iter()
            .map(|row| {
                let mut columns = self.insert_columns(&options.class_name, row)?;
                columns.insert(
                    "_id".to_string(),
                    Sql::param(SqlParam::Text(generate_object_id(options.object_id_size))),
                );
                Ok(columns)
            })
            .collect::<DbResult<Vec<_>>>()?;

        let mut ctes = Sql::ident("_mutated");
        ctes.push_raw(" AS (")
            .push(self.insert_statement(&options.class_name, rows)?)
            .push_raw(" RETURNING *)");
        self.returning(ctes, &options.as_query())
    }

    pub fn update_one(&self, query: &DecodedQuery, update: &UpdateSpec) -> DbResult<CompiledSelect> {
        let mut ctes = self.target(query)?;
        ctes.push_raw(", ")
            .push_ident("_mutated")
            .push_raw(" AS (")
            .push(self.update_statement(&query.class_name, update)?)
            .push_raw(")");
        self.returning(ctes, query)
    }

    /// Update the target row, or insert one when the filter matches nothing.
    ///
    /// The inserted row carries the plain `$set` values overlaid with
    /// `set_on_insert`.
    pub fn upsert_one(
        &self,
        query: &DecodedQuery,
        update: &UpdateSpec,
        set_on_insert: &InsertValues,
    ) -> DbResult<CompiledSelect> {
        let class_name = &query.class_name;
        let mut inserted: InsertValues = BTreeMap::new();
        for (path, op) in update {
            if let UpdateOp::Set(value) = op {
                if self.schema.resolve_column(class_name, path)?.remaining.is_none() {
                    inserted.insert(path.clone(), value.clone());
                }
            }
        }
        inserted.extend(set_on_insert.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut columns = self.insert_columns(class_name, &inserted)?;
        columns.insert(
            "_id".to_string(),
            Sql::param(SqlParam::Text(generate_object_id(query.object_id_size))),
        );
        let (names, values): (Vec<String>, Vec<Sql>) = columns.into_iter().unzip();

        let mut ctes = self.target(query)?;
        ctes.push_raw(", ")
            .push_ident("_updated")
            .push_raw(" AS (")
            .push(self.update_statement(class_name, update)?)
            .push_raw("), ")
            .push_ident("_inserted")
            .push_raw(" AS (INSERT INTO ")
            .push_ident(class_name)
            .push_raw(" (")
            .push(Sql::join(names.iter().map(|n| Sql::ident(n.as_str())), ", "))
            .push_raw(") SELECT ")
            .push(Sql::join(values, ", "))
            .push_raw(" WHERE NOT EXISTS (SELECT 1 FROM ")
            .push_ident("_target")
            .push_raw(") RETURNING *), ")
            .push_ident("_mutated")
            .push_raw(" AS (SELECT * FROM ")
            .push_ident("_updated")
            .push_raw(" UNION ALL SELECT * FROM ")
            .push_ident("_inserted")
            .push_raw(")");
        self.returning(ctes, query)
    }

    pub fn delete_one(&self, query: &DecodedQuery) -> DbResult<CompiledSelect> {
        let table = &query.class_name;
        let mut ctes = self.target(query)?;
        ctes.push_raw(", ")
            .push_ident("_mutated")
            .push_raw(" AS (DELETE FROM ")
            .push_ident(table)
            .push_raw(" USING ")
            .push_ident("_target")
            .push_raw(" WHERE ")
            .push(Sql::column(table, "_id"))
            .push_raw(" = ")
            .push(Sql::column("_target", "_id"))
            .push_raw(" RETURNING ")
            .push_ident(table)
            .push_raw(".*)");
        self.returning(ctes, query)
    }

    /// Delete every matching row; the statement yields the deleted count.
    pub fn delete_many(&self, query: &DecodedQuery) -> DbResult<CompiledSql> {
        let populates = self.populates(query)?;
        let scope = ClassScope::root(&query.class_name, &populates);

        let mut matching = Sql::raw("SELECT ");
        matching
            .push(Sql::column(scope.alias, "_id"))
            .push_raw(" FROM ")
            .push(self.from_clause(&scope)?);
        self.push_where(&mut matching, &scope, &query.filter)?;

        let mut sql = Sql::raw("WITH ");
        sql.push_ident("_mutated")
            .push_raw(" AS (DELETE FROM ")
            .push_ident(&query.class_name)
            .push_raw(" WHERE ")
            .push(Sql::column(&query.class_name, "_id"))
            .push_raw(" IN (")
            .push(matching)
            .push_raw(") RETURNING ")
            .push(Sql::column(&query.class_name, "_id"))
            .push_raw(") SELECT to_jsonb(COUNT(*)) FROM ")
            .push_ident("_mutated");
        Ok(self.render(sql))
    }

    /// `"_target" AS (SELECT "C"."_id" ... LIMIT 1 [FOR UPDATE OF "C"])`
    fn target(&self, query: &DecodedQuery) -> DbResult<Sql> {
        let populates = self.populates(query)?;
        let scope = ClassScope::root(&query.class_name, &populates);

        let mut sql = Sql::ident("_target");
        sql.push_raw(" AS (SELECT ")
            .push(Sql::column(scope.alias, "_id"))
            .push_raw(" FROM ")
            .push(self.from_clause(&scope)?);
        self.push_where(&mut sql, &scope, &query.filter)?;
        self.push_order(&mut sql, &scope, &query.sort)?;
        push_paging(&mut sql, query.skip, Some(1));
        if self.select_lock {
            sql.push_raw(" FOR UPDATE OF ").push_ident(scope.alias);
        }
        sql.push_raw(")");
        Ok(sql)
    }

    /// `WITH <ctes> SELECT <object> FROM "_mutated" AS "C" <joins>`
    fn returning(&self, ctes: Sql, query: &DecodedQuery) -> DbResult<CompiledSelect> {
        let populates = self.populates(query)?;
        let scope = ClassScope::root(&query.class_name, &populates);
        let (object, recipe) = self.projection(&scope, &query.includes)?;

        let mut sql = Sql::raw("WITH ");
        sql.push(ctes)
            .push_raw(" SELECT ")
            .push(object)
            .push_raw(" AS ")
            .push_ident("$")
            .push_raw(" FROM ")
            .push_ident("_mutated")
            .push_raw(" AS ")
            .push_ident(scope.alias)
            .push(self.pointer_joins(scope.populates)?);
        Ok(CompiledSelect {
            sql: self.render(sql),
            recipe,
        })
    }

    /// Encoded column values of one object; shape objects are flattened.
    fn insert_columns(&self, class_name: &str, values: &InsertValues) -> DbResult<BTreeMap<String, Sql>> {
        let mut columns = BTreeMap::new();
        for (key, value) in values {
            if READ_ONLY_KEYS.contains(&key.as_str()) {
                return Err(read_only(key));
            }
            let resolved = self.schema.resolve_column(class_name, key)?;
            if resolved.remaining.is_some() {
                return Err(DbError::InvalidKey(format!("cannot insert into sub-path '{}'", key)));
            }
            if resolved.data_type.is_virtual() {
                return Err(DbError::InvalidKey(format!(
                    "'{}' is resolved through a foreign field",
                    key
                )));
            }
            for (column, data_type, value) in flatten_value(resolved.column, resolved.data_type, value)? {
                if columns.insert(column.clone(), encode_value(data_type, &value)?).is_some() {
                    return Err(DbError::InvalidKey(format!("duplicate value for '{}'", column)));
                }
            }
        }
        Ok(columns)
    }

    /// `INSERT INTO "C" (cols) VALUES (...), (...)`; absent columns are `DEFAULT`
    fn insert_statement(&self, class_name: &str, rows: Vec<BTreeMap<String, Sql>>) -> DbResult<Sql> {
        let mut names: Vec<String> = Vec::new();
        for row in &rows {
            for column in row.keys() {
                if !names.contains(column) {
                    names.push(column.clone());
                }
            }
        }

        let tuples = rows.into_iter().map(|mut row| {
            let values = names
                .iter()
                .map(|name| row.remove(name).unwrap_or_else(|| Sql::raw("DEFAULT")));
            Sql::join(values.collect::<Vec<_>>(), ", ").wrap()
        });

        let mut sql = Sql::raw("INSERT INTO ");
        sql.push_ident(class_name)
            .push_raw(" (")
            .push(Sql::join(names.iter().map(|n| Sql::ident(n.as_str())), ", "))
            .push_raw(") VALUES ")
            .push(Sql::join(tuples.collect::<Vec<_>>(), ", "));
        Ok(sql)
    }

    /// `UPDATE "C" SET ... FROM "_target" WHERE ... RETURNING "C".*`
    fn update_statement(&self, class_name: &str, update: &UpdateSpec) -> DbResult<Sql> {
        let mut assignments = vec![
            Assignment {
                column: "__v".to_string(),
                value: Sql::raw("\"__v\" + 1"),
                json_patch: false,
            },
            Assignment {
                column: "_updated_at".to_string(),
                value: Sql::raw("NOW()"),
                json_patch: false,
            },
        ];
        for (path, op) in update {
            self.assign(class_name, path, op, &mut assignments)?;
        }

        let mut sql = Sql::raw("UPDATE ");
        sql.push_ident(class_name)
            .push_raw(" SET ")
            .push(Sql::join(
                assignments.into_iter().map(|a| {
                    let mut sql = Sql::ident(a.column);
                    sql.push_raw(" = ").push(a.value);
                    sql
                }),
                ", ",
            ))
            .push_raw(" FROM ")
            .push_ident("_target")
            .push_raw(" WHERE ")
            .push(Sql::column(class_name, "_id"))
            .push_raw(" = ")
            .push(Sql::column("_target", "_id"))
            .push_raw(" RETURNING ")
            .push_ident(class_name)
            .push_raw(".*");
        Ok(sql)
    }

    fn assign(
        &self,
        class_name: &str,
        path: &str,
        op: &UpdateOp,
        assignments: &mut Vec<Assignment>,
    ) -> DbResult<()> {
        if READ_ONLY_KEYS.contains(&path) {
            return Err(read_only(path));
        }
        let resolved = self.schema.resolve_column(class_name, path)?;
        let conflict = || DbError::InvalidKey(format!("conflicting updates on '{}'", path));

        match (&resolved.remaining, resolved.data_type) {
            (Some(rest), DataType::Object) => {
                let UpdateOp::Set(value) = op else {
                    return Err(DbError::UnsupportedOperation(format!(
                        "{} on object sub-path '{}'",
                        op.name(),
                        path
                    )));
                };
                let existing = assignments.iter_mut().find(|a| a.column == resolved.column);
                let base = match existing {
                    Some(a) if a.json_patch => std::mem::take(&mut a.value),
                    Some(_) => return Err(conflict()),
                    None => {
                        let mut sql = Sql::raw("COALESCE(");
                        sql.push_ident(&resolved.column).push_raw(", '{}'::jsonb)");
                        sql
                    }
                };
                let mut patched = Sql::raw("jsonb_set(");
                patched
                    .push(base)
                    .push_raw(", ")
                    .push(json_path_literal(rest))
                    .push_raw(", ")
                    .push(encode_json(value))
                    .push_raw(", true)");
                match assignments.iter_mut().find(|a| a.column == resolved.column) {
                    Some(a) => a.value = patched,
                    None => assignments.push(Assignment {
                        column: resolved.column.clone(),
                        value: patched,
                        json_patch: true,
                    }),
                }
                return Ok(());
            }
            (Some(_), _) => return Err(DbError::InvalidKey(format!("cannot update sub-path '{}'", path))),
            (None, _) => {}
        }

        if resolved.data_type.is_shape() {
            let UpdateOp::Set(value) = op else {
                return Err(DbError::UnsupportedOperation(format!(
                    "{} on shape '{}'",
                    op.name(),
                    path
                )));
            };
            for (column, data_type, value) in
                flatten_value(resolved.column.clone(), resolved.data_type, value)?
            {
                push_assignment(assignments, column, encode_value(data_type, &value)?, &conflict)?;
            }
            return Ok(());
        }

        let operand = match op {
            UpdateOp::Set(v)
            | UpdateOp::Increment(v)
            | UpdateOp::Decrement(v)
            | UpdateOp::Multiply(v)
            | UpdateOp::Divide(v)
            | UpdateOp::Max(v)
            | UpdateOp::Min(v) => encode_value(resolved.data_type, v)?,
            UpdateOp::AddToSet(items) | UpdateOp::Push(items) | UpdateOp::RemoveAll(items) => {
                encode_list(resolved.data_type, items).map_err(|_| {
                    DbError::UnsupportedOperation(format!(
                        "{} on {} column '{}'",
                        op.name(),
                        resolved.data_type,
                        resolved.column
                    ))
                })?
            }
            UpdateOp::PopFirst(_) | UpdateOp::PopLast(_) => Sql::new(),
        };
        let value = self
            .dialect
            .update_operation(&resolved.column, resolved.data_type, op, operand)?;
        push_assignment(assignments, resolved.column, value, &conflict)
    }
}

fn push_assignment(
    assignments: &mut Vec<Assignment>,
    column: String,
    value: Sql,
    conflict: &dyn Fn() -> DbError,
) -> DbResult<()> {
    if assignments.iter().any(|a| a.column == column) {
        return Err(conflict());
    }
    assignments.push(Assignment {
        column,
        value,
        json_patch: false,
    });
    Ok(())
}

/// Leaf columns of a value written to `column`; shapes are flattened and
/// their missing leaves become null.
fn flatten_value<'t>(
    column: String,
    data_type: &'t DataType,
    value: &TValue,
) -> DbResult<Vec<(String, &'t DataType, TValue)>> {
    let DataType::Shape(fields) = data_type else {
        return Ok(vec![(column, data_type, value.clone())]);
    };
    let empty = BTreeMap::new();
    let object = match value {
        TValue::Object(map) => map,
        TValue::Null => &empty,
        other => {
            return Err(DbError::InvalidValue(format!(
                "expected object for shape '{}', got {}",
                column,
                other.type_name()
            )))
        }
    };
    if let Some(unknown) = object.keys().find(|k| !fields.contains_key(*k)) {
        return Err(DbError::InvalidKey(format!("{}.{}", column, unknown)));
    }

    let mut leaves = Vec::new();
    for (name, sub_type) in fields {
        let sub_value = object.get(name).cloned().unwrap_or(TValue::Null);
        leaves.extend(flatten_value(format!("{}.{}", column, name), sub_type, &sub_value)?);
    }
    Ok(leaves)
}
