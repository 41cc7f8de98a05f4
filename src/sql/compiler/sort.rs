//! `ORDER BY` resolution, including keys on joined classes.

use selector_core::{SortOption, SortOrder};

use super::filter::{ClassScope, Operand, Scope};
use super::populate::PopulateKind;
use super::QueryCompiler;
use crate::error::{DbError, DbResult};
use crate::sql::Sql;

impl QueryCompiler<'_> {
    pub(super) fn order_by(&self, scope: &ClassScope<'_>, sort: &SortOption) -> DbResult<Vec<Sql>> {
        let with_order = |mut sql: Sql, order: &SortOrder| {
            sql.push_raw(&format!(" {}", order.as_sql()));
            sql
        };
        match sort {
            SortOption::Keys(keys) => keys
                .iter()
                .map(|(path, order)| Ok(with_order(self.resolve_sorting_name(scope, path)?, order)))
                .collect(),
            SortOption::Expressions(sorts) => sorts
                .iter()
                .map(|sort| {
                    let compiled = self.expression(&Scope::Class(*scope), &sort.expr)?;
                    Ok(with_order(self.to_sql(compiled)?, &sort.order))
                })
                .collect(),
        }
    }

    pub(super) fn push_order(
        &self,
        sql: &mut Sql,
        scope: &ClassScope<'_>,
        sort: &SortOption,
    ) -> DbResult<()> {
        let order = self.order_by(scope, sort)?;
        if !order.is_empty() {
            sql.push_raw(" ORDER BY ").push(Sql::join(order, ", "));
        }
        Ok(())
    }

    /// Column expression for a dotted sort key.
    ///
    /// A prefix naming a pointer continues inside the pointer's join; one
    /// naming a relation sorts by the first related row in relation order.
    pub(super) fn resolve_sorting_name(&self, scope: &ClassScope<'_>, path: &str) -> DbResult<Sql> {
        let resolved = self.schema.resolve_column(scope.class_name, path)?;
        let Some(rest) = resolved.remaining.as_deref() else {
            return match self.operand(*scope, path)? {
                Operand::Scalar { sql, .. } | Operand::Json(sql) | Operand::Array { sql, .. } => {
                    Ok(sql)
                }
                _ => Err(DbError::InvalidPath(format!("cannot sort by relation '{}'", path))),
            };
        };
        if !resolved.data_type.is_reference() {
            return match self.operand(*scope, path)? {
                Operand::Scalar { sql, .. } | Operand::Json(sql) => Ok(sql),
                _ => Err(DbError::InvalidPath(path.to_string())),
            };
        }

        let populate = scope.populates.get(&resolved.column).ok_or_else(|| {
            DbError::InvalidPath(format!("{}.{} is not populated", scope.class_name, resolved.column))
        })?;
        match populate.kind {
            PopulateKind::Pointer => self.resolve_sorting_name(&populate.scope(), rest),
            PopulateKind::Relation { .. } => {
                let rest = super::populate::strip_index(rest)
                    .ok_or_else(|| DbError::InvalidPath(path.to_string()))?;
                let value = self.resolve_sorting_name(&populate.scope(), &rest)?;
                let order = self.relation_order(populate)?;

                let mut sql = Sql::raw("(SELECT ");
                sql.push(value)
                    .push_raw(" FROM ")
                    .push(self.relation_source(populate)?);
                if !order.is_empty() {
                    sql.push_raw(" ORDER BY ").push(Sql::join(order, ", "));
                }
                sql.push_raw(" LIMIT 1)");
                Ok(sql)
            }
        }
    }
}
