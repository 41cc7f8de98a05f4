pub mod config;
pub mod error;
pub mod query;
pub mod schema;
pub mod sql;
pub mod storage;
pub mod transaction;
pub mod validator;

pub use config::Settings;
pub use error::{DbError, DbResult, ErrorKind};
pub use query::{DecodedBaseQuery, DecodedQuery, InsertOptions, InsertValues, UpdateSpec};
pub use schema::{DataType, Schema, SchemaMap};
pub use sql::{CompiledSql, PostgresDialect, QueryCompiler, SqlDialect};
pub use storage::{ConnectionPool, PgPool, SqlStorage, Storage};
pub use transaction::{IsolationLevel, TransactionOptions};
pub use validator::{CallerIdentity, QueryDecoder, QueryValidator};
