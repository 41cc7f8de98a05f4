//! PostgreSQL dialect.

use selector_core::UpdateOp;

use super::{ColumnDecoder, Sql, SqlDialect, SqlParam};
use crate::error::{DbError, DbResult};
use crate::schema::DataType;

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    fn array_type(data_type: &DataType) -> Option<&'static str> {
        match data_type {
            DataType::StringArray
            | DataType::Relation {
                foreign_field: None,
                ..
            } => Some("TEXT[]"),
            DataType::Array => Some("JSONB[]"),
            _ => None,
        }
    }
}

impl SqlDialect for PostgresDialect {
    fn quote(&self, text: &str) -> String {
        format!("'{}'", text.replace('\'', "''"))
    }

    fn identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize, value: &SqlParam) -> String {
        let cast = match value {
            SqlParam::Bool(_) => "BOOLEAN",
            SqlParam::Float(_) => "DOUBLE PRECISION",
            SqlParam::Decimal(_) => "TEXT::DECIMAL",
            SqlParam::Text(_) => "TEXT",
            SqlParam::Timestamp(_) => "TIMESTAMPTZ",
            SqlParam::Json(_) => "JSONB",
            SqlParam::TextArray(_) => "TEXT[]",
            SqlParam::FloatArray(_) => "DOUBLE PRECISION[]",
            SqlParam::JsonArray(_) => "JSONB[]",
        };
        format!("${}::{}", index, cast)
    }

    fn null_safe_equal(&self, left: Sql, right: Sql) -> Sql {
        let mut sql = Sql::raw("(");
        sql.push(left).push_raw(" IS NOT DISTINCT FROM ").push(right).push_raw(")");
        sql
    }

    fn null_safe_not_equal(&self, left: Sql, right: Sql) -> Sql {
        let mut sql = Sql::raw("(");
        sql.push(left).push_raw(" IS DISTINCT FROM ").push(right).push_raw(")");
        sql
    }

    fn encode_type(&self, data_type: &DataType) -> Option<&'static str> {
        match data_type {
            DataType::Boolean => Some("BOOLEAN"),
            DataType::Number => Some("DOUBLE PRECISION"),
            DataType::Decimal => Some("DECIMAL"),
            DataType::String | DataType::Pointer { .. } => Some("TEXT"),
            DataType::StringArray => Some("TEXT[]"),
            DataType::Date => Some("TIMESTAMPTZ"),
            DataType::Object => Some("JSONB"),
            DataType::Array => Some("JSONB[]"),
            DataType::Vector { .. } => Some("DOUBLE PRECISION[]"),
            DataType::Relation {
                foreign_field: None,
                ..
            } => Some("TEXT[]"),
            DataType::Relation { .. } | DataType::Shape(_) => None,
        }
    }

    fn decode_type(&self, data_type: &DataType) -> ColumnDecoder {
        match data_type {
            DataType::Date => ColumnDecoder::Date,
            DataType::Decimal => ColumnDecoder::Decimal,
            _ => ColumnDecoder::Plain,
        }
    }

    fn update_operation(
        &self,
        column: &str,
        data_type: &DataType,
        op: &UpdateOp,
        value: Sql,
    ) -> DbResult<Sql> {
        let col = Sql::ident(column);
        let unsupported = || {
            DbError::UnsupportedOperation(format!(
                "{} on {} column '{}'",
                op.name(),
                data_type,
                column
            ))
        };

        if op.is_array_mutation() {
            let array_type = Self::array_type(data_type).ok_or_else(unsupported)?;
            let mut current = Sql::raw("COALESCE(");
            current.push(col.clone()).push_raw(&format!(", '{{}}'::{})", array_type));

            let sql = match op {
                UpdateOp::Push(_) => {
                    let mut sql = current;
                    sql.push_raw(" || ").push(value);
                    sql
                }
                UpdateOp::AddToSet(_) => {
                    let mut sql = current.clone();
                    sql.push_raw(" || ARRAY(SELECT DISTINCT \"$u\".\"$v\" FROM unnest(")
                        .push(value)
                        .push_raw(") AS \"$u\"(\"$v\") WHERE NOT (\"$u\".\"$v\" = ANY(")
                        .push(current)
                        .push_raw(")))");
                    sql
                }
                UpdateOp::RemoveAll(_) => {
                    let mut sql = Sql::raw("ARRAY(SELECT \"$u\".\"$v\" FROM unnest(");
                    sql.push(current)
                        .push_raw(") WITH ORDINALITY AS \"$u\"(\"$v\", \"$i\") WHERE NOT (\"$u\".\"$v\" = ANY(")
                        .push(value)
                        .push_raw(")) ORDER BY \"$u\".\"$i\")");
                    sql
                }
                UpdateOp::PopFirst(count) => {
                    let mut sql = Sql::raw("(");
                    sql.push(current).push_raw(&format!(")[{}:]", count + 1));
                    sql
                }
                UpdateOp::PopLast(count) => {
                    let mut sql = Sql::raw("(");
                    sql.push(current)
                        .push_raw(")[:COALESCE(cardinality(")
                        .push(col)
                        .push_raw(&format!("), 0) - {}]", count));
                    sql
                }
                _ => return Err(unsupported()),
            };
            return Ok(sql);
        }

        let symbol = match op {
            UpdateOp::Set(_) => return Ok(value),
            UpdateOp::Increment(_) => Some("+"),
            UpdateOp::Decrement(_) => Some("-"),
            UpdateOp::Multiply(_) => Some("*"),
            UpdateOp::Divide(_) => Some("/"),
            _ => None,
        };
        if let Some(symbol) = symbol {
            if !matches!(data_type, DataType::Number | DataType::Decimal) {
                return Err(unsupported());
            }
            let mut sql = Sql::raw("(");
            sql.push(col)
                .push_raw(&format!(" {} ", symbol))
                .push(value)
                .push_raw(")");
            return Ok(sql);
        }

        match op {
            UpdateOp::Max(_) | UpdateOp::Min(_) => {
                if !matches!(
                    data_type,
                    DataType::Number | DataType::Decimal | DataType::String | DataType::Date
                ) {
                    return Err(unsupported());
                }
                let function = if matches!(op, UpdateOp::Max(_)) { "GREATEST" } else { "LEAST" };
                let mut sql = Sql::raw(&format!("{}(", function));
                sql.push(col).push_raw(", ").push(value).push_raw(")");
                Ok(sql)
            }
            _ => Err(unsupported()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selector_core::TValue;

    fn render(sql: Sql) -> String {
        sql.render(&PostgresDialect).text
    }

    #[test]
    fn test_placeholder_casts() {
        let dialect = PostgresDialect;
        assert_eq!(
            dialect.placeholder(3, &SqlParam::Decimal("1.5".to_string())),
            "$3::TEXT::DECIMAL"
        );
        assert_eq!(dialect.placeholder(1, &SqlParam::JsonArray(Vec::new())), "$1::JSONB[]");
    }

    #[test]
    fn test_type_mapping() {
        let dialect = PostgresDialect;
        assert_eq!(dialect.encode_type(&DataType::Decimal), Some("DECIMAL"));
        assert_eq!(dialect.encode_type(&DataType::StringArray), Some("TEXT[]"));
        assert_eq!(
            dialect.encode_type(&DataType::Vector { dimension: 3 }),
            Some("DOUBLE PRECISION[]")
        );
        assert_eq!(
            dialect.encode_type(&DataType::Relation {
                target: "Comment".to_string(),
                foreign_field: Some("post".to_string()),
            }),
            None
        );
    }

    #[test]
    fn test_arithmetic_updates() {
        let dialect = PostgresDialect;
        let value = Sql::param(SqlParam::Float(2.0));
        let sql = dialect
            .update_operation("views", &DataType::Number, &UpdateOp::Increment(TValue::Number(2.0)), value.clone())
            .unwrap();
        assert_eq!(render(sql), "(\"views\" + $1::DOUBLE PRECISION)");

        let sql = dialect
            .update_operation("views", &DataType::Number, &UpdateOp::Max(TValue::Number(2.0)), value.clone())
            .unwrap();
        assert_eq!(render(sql), "GREATEST(\"views\", $1::DOUBLE PRECISION)");

        let err = dialect
            .update_operation("title", &DataType::String, &UpdateOp::Increment(TValue::Number(2.0)), value)
            .unwrap_err();
        assert!(matches!(err, DbError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_array_updates() {
        let dialect = PostgresDialect;
        let value = Sql::param(SqlParam::TextArray(vec!["x".to_string()]));

        let sql = dialect
            .update_operation("tags", &DataType::StringArray, &UpdateOp::Push(Vec::new()), value.clone())
            .unwrap();
        assert_eq!(render(sql), "COALESCE(\"tags\", '{}'::TEXT[]) || $1::TEXT[]");

        let sql = dialect
            .update_operation("tags", &DataType::StringArray, &UpdateOp::PopFirst(2), Sql::new())
            .unwrap();
        assert_eq!(render(sql), "(COALESCE(\"tags\", '{}'::TEXT[]))[3:]");

        let sql = dialect
            .update_operation("tags", &DataType::StringArray, &UpdateOp::PopLast(1), Sql::new())
            .unwrap();
        assert_eq!(
            render(sql),
            "(COALESCE(\"tags\", '{}'::TEXT[]))[:COALESCE(cardinality(\"tags\"), 0) - 1]"
        );
    }

    #[test]
    fn test_array_updates_rejected_on_scalar_columns() {
        let dialect = PostgresDialect;
        for op in [
            UpdateOp::Push(Vec::new()),
            UpdateOp::AddToSet(Vec::new()),
            UpdateOp::RemoveAll(Vec::new()),
            UpdateOp::PopFirst(1),
            UpdateOp::PopLast(1),
        ] {
            let err = dialect
                .update_operation("title", &DataType::String, &op, Sql::new())
                .unwrap_err();
            assert!(matches!(err, DbError::UnsupportedOperation(_)));
        }
        let err = dialect
            .update_operation(
                "embedding",
                &DataType::Vector { dimension: 3 },
                &UpdateOp::Push(Vec::new()),
                Sql::new(),
            )
            .unwrap_err();
        assert!(matches!(err, DbError::UnsupportedOperation(_)));
    }
}
