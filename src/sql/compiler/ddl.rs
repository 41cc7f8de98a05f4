//! Table, column and index creation, plus the `_Config` key/value table.

use serde_json::Value;
use tracing::debug;

use super::QueryCompiler;
use crate::error::{DbError, DbResult};
use crate::schema::{DataType, IndexKind, IndexSpec, Schema};
use crate::sql::{CompiledSql, Sql, SqlParam};

const CONFIG_TABLE: &str = "_Config";

/// Default key columns shared by every class table
const DEFAULT_COLUMNS: &[(&str, &str)] = &[
    ("_id", "TEXT PRIMARY KEY"),
    ("__v", "DOUBLE PRECISION NOT NULL DEFAULT 0"),
    ("_created_at", "TIMESTAMPTZ NOT NULL DEFAULT NOW()"),
    ("_updated_at", "TIMESTAMPTZ NOT NULL DEFAULT NOW()"),
    ("_expired_at", "TIMESTAMPTZ"),
    ("_rperm", "TEXT[] NOT NULL DEFAULT ARRAY['*']::TEXT[]"),
    ("_wperm", "TEXT[] NOT NULL DEFAULT ARRAY['*']::TEXT[]"),
];

impl QueryCompiler<'_> {
    /// Every statement needed to bring one class table up to its schema
    pub fn migrate(&self, class_name: &str) -> DbResult<Vec<CompiledSql>> {
        let schema = self.schema.get(class_name)?;
        let mut statements = Vec::new();
        if schema
            .indexes
            .iter()
            .any(|index| index.kind == IndexKind::Vector)
        {
            statements.push(CompiledSql::new("CREATE EXTENSION IF NOT EXISTS vector"));
        }
        statements.push(self.create_table(class_name)?);
        statements.extend(self.add_columns(class_name)?);
        statements.extend(self.create_indexes(class_name)?);
        debug!(class = class_name, statements = statements.len(), "Planned migration");
        Ok(statements)
    }

    /// `CREATE TABLE IF NOT EXISTS` with the default key columns only
    pub fn create_table(&self, class_name: &str) -> DbResult<CompiledSql> {
        self.schema.get(class_name)?;
        let columns = DEFAULT_COLUMNS.iter().map(|(name, ddl)| {
            let mut sql = Sql::ident(*name);
            sql.push_raw(" ").push_raw(ddl);
            sql
        });

        let mut sql = Sql::raw("CREATE TABLE IF NOT EXISTS ");
        sql.push_ident(class_name)
            .push_raw(" (")
            .push(Sql::join(columns, ", "))
            .push_raw(")");
        Ok(self.render(sql))
    }

    /// One `ADD COLUMN IF NOT EXISTS` per stored field column
    pub fn add_columns(&self, class_name: &str) -> DbResult<Vec<CompiledSql>> {
        let schema = self.schema.get(class_name)?;
        Ok(schema
            .columns()
            .into_iter()
            .filter(|(column, _)| !DEFAULT_COLUMNS.iter().any(|(name, _)| *name == column.as_str()))
            .filter_map(|(column, data_type)| {
                let column_type = self.dialect.encode_type(data_type)?;
                let mut sql = Sql::raw("ALTER TABLE ");
                sql.push_ident(class_name)
                    .push_raw(" ADD COLUMN IF NOT EXISTS ")
                    .push_ident(&column)
                    .push_raw(" ")
                    .push_raw(column_type);
                Some(self.render(sql))
            })
            .collect())
    }

    pub fn create_indexes(&self, class_name: &str) -> DbResult<Vec<CompiledSql>> {
        let schema = self.schema.get(class_name)?;
        schema
            .indexes
            .iter()
            .map(|index| {
                let sql = match index.kind {
                    IndexKind::Basic => self.basic_index(class_name, schema, index)?,
                    IndexKind::Vector => self.vector_index(class_name, schema, index)?,
                };
                Ok(self.render(sql))
            })
            .collect()
    }

    fn index_column<'s>(&self, class_name: &str, schema: &'s Schema, key: &str) -> DbResult<(String, &'s DataType)> {
        schema
            .columns()
            .into_iter()
            .find(|(column, _)| column == key)
            .filter(|(_, data_type)| self.dialect.encode_type(data_type).is_some())
            .ok_or_else(|| DbError::InvalidValue(format!("cannot index {}.{}", class_name, key)))
    }

    fn basic_index(&self, class_name: &str, schema: &Schema, index: &IndexSpec) -> DbResult<Sql> {
        let keys = index.key_orders()?;
        let mut columns = Vec::new();
        let mut name = class_name.to_string();
        for (key, order) in &keys {
            let (column, _) = self.index_column(class_name, schema, key)?;
            name.push('_');
            name.push_str(&column.replace('.', "_"));
            let mut sql = Sql::ident(column);
            sql.push_raw(" ").push_raw(order.as_sql());
            columns.push(sql);
        }
        name.push_str(if index.unique { "_unique" } else { "_idx" });

        let mut sql = Sql::raw(if index.unique {
            "CREATE UNIQUE INDEX IF NOT EXISTS "
        } else {
            "CREATE INDEX IF NOT EXISTS "
        });
        sql.push_ident(&name)
            .push_raw(" ON ")
            .push_ident(class_name)
            .push_raw(" (")
            .push(Sql::join(columns, ", "))
            .push_raw(")");
        Ok(sql)
    }

    /// Index over `CAST(... AS vector(d))`, a vector column or an array of
    /// number columns.
    fn vector_index(&self, class_name: &str, schema: &Schema, index: &IndexSpec) -> DbResult<Sql> {
        let keys = index.key_orders()?;
        let mut name = class_name.to_string();
        let mut columns = Vec::new();
        for (key, _) in &keys {
            let (column, data_type) = self.index_column(class_name, schema, key)?;
            name.push('_');
            name.push_str(&column.replace('.', "_"));
            columns.push((column, data_type));
        }
        name.push_str("_vector_idx");

        let (vector, dimension) = match columns.as_slice() {
            [(column, DataType::Vector { dimension })] => (Sql::ident(column.as_str()), *dimension),
            axes if axes.iter().all(|(_, t)| matches!(t, DataType::Number)) => {
                let mut sql = Sql::raw("ARRAY[");
                sql.push(Sql::join(axes.iter().map(|(c, _)| Sql::ident(c.as_str())), ", "))
                    .push_raw("]");
                (sql, axes.len())
            }
            _ => {
                return Err(DbError::InvalidValue(format!(
                    "vector index on {} needs one vector column or number columns",
                    class_name
                )))
            }
        };

        let mut sql = Sql::raw("CREATE INDEX IF NOT EXISTS ");
        sql.push_ident(&name)
            .push_raw(" ON ")
            .push_ident(class_name)
            .push_raw(&format!(" USING {} ((CAST(", index.method.as_str()))
            .push(vector)
            .push_raw(&format!(" AS vector({}))) vector_l2_ops)", dimension));
        Ok(sql)
    }

    /// Table names in the current schema
    pub fn list_tables(&self) -> CompiledSql {
        self.render(Sql::raw(
            "SELECT to_jsonb(table_name::TEXT) FROM information_schema.tables \
             WHERE table_schema = current_schema() ORDER BY table_name",
        ))
    }

    pub fn create_config_table(&self) -> CompiledSql {
        let mut sql = Sql::raw("CREATE TABLE IF NOT EXISTS ");
        sql.push_ident(CONFIG_TABLE)
            .push_raw(" (")
            .push_ident("_id")
            .push_raw(" TEXT PRIMARY KEY, ")
            .push_ident("value")
            .push_raw(" JSONB)");
        self.render(sql)
    }

    /// Single JSONB object of every config entry
    pub fn read_config(&self) -> CompiledSql {
        let mut sql = Sql::raw("SELECT COALESCE(jsonb_object_agg(");
        sql.push_ident("_id")
            .push_raw(", ")
            .push_ident("value")
            .push_raw("), '{}'::jsonb) FROM ")
            .push_ident(CONFIG_TABLE);
        self.render(sql)
    }

    /// Upsert one config entry; `null` removes it.
    pub fn write_config(&self, key: &str, value: &Value) -> CompiledSql {
        let id = SqlParam::Text(key.to_string());
        let sql = if value.is_null() {
            let mut sql = Sql::raw("DELETE FROM ");
            sql.push_ident(CONFIG_TABLE)
                .push_raw(" WHERE ")
                .push_ident("_id")
                .push_raw(" = ")
                .push_param(id);
            sql
        } else {
            let mut sql = Sql::raw("INSERT INTO ");
            sql.push_ident(CONFIG_TABLE)
                .push_raw(" (")
                .push_ident("_id")
                .push_raw(", ")
                .push_ident("value")
                .push_raw(") VALUES (")
                .push_param(id)
                .push_raw(", ")
                .push_param(SqlParam::Json(value.clone()))
                .push_raw(") ON CONFLICT (")
                .push_ident("_id")
                .push_raw(") DO UPDATE SET ")
                .push_ident("value")
                .push_raw(" = EXCLUDED.")
                .push_ident("value");
            sql
        };
        self.render(sql)
    }
}
