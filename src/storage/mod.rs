pub mod engine;
pub mod pool;
pub mod postgres;

pub use engine::SqlStorage;
pub use pool::{Connection, ConnectionHome, ConnectionPool, PooledConnection};
pub use postgres::{PgConnection, PgPool, PgPoolOptions};

use futures::stream::BoxStream;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::DbResult;
use crate::query::{DecodedQuery, InsertOptions, InsertValues, UpdateSpec};
use crate::schema::SchemaMap;

/// Backend executing decoded queries.
///
/// Every method takes a query that already passed permission checks.
/// Returned objects are decoded domain objects (`$date`/`$decimal`
/// wrappers, populated pointers and relations nested in place).
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Schema map installed by the last [`Storage::prepare`]
    fn schema(&self) -> Arc<SchemaMap>;

    /// Install a schema map and bring the backing tables up to date
    async fn prepare(&self, schema: SchemaMap) -> DbResult<()>;

    /// Class tables present in the database
    async fn classes(&self) -> DbResult<Vec<String>>;

    async fn config(&self) -> DbResult<Map<String, Value>>;

    /// Merge entries into the stored config; `null` removes a key.
    async fn set_config(&self, values: Map<String, Value>) -> DbResult<()>;

    async fn explain(&self, query: &DecodedQuery) -> DbResult<Value>;

    async fn count(&self, query: &DecodedQuery) -> DbResult<u64>;

    /// Lazily stream matching objects. Dropping the stream releases the
    /// connection.
    fn find<'a>(&'a self, query: &'a DecodedQuery) -> BoxStream<'a, DbResult<Value>>;

    async fn insert(&self, options: &InsertOptions, values: &[InsertValues]) -> DbResult<Vec<Value>>;

    async fn update_one(&self, query: &DecodedQuery, update: &UpdateSpec) -> DbResult<Option<Value>>;

    async fn upsert_one(
        &self,
        query: &DecodedQuery,
        update: &UpdateSpec,
        set_on_insert: &InsertValues,
    ) -> DbResult<Value>;

    async fn delete_one(&self, query: &DecodedQuery) -> DbResult<Option<Value>>;

    async fn delete_many(&self, query: &DecodedQuery) -> DbResult<u64>;
}
