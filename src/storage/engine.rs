use async_stream::try_stream;
use futures::stream::{BoxStream, Stream, TryStreamExt};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::pool::{Connection, ConnectionPool, PooledConnection};
use super::Storage;
use crate::error::{DbError, DbResult};
use crate::query::{DecodedQuery, InsertOptions, InsertValues, UpdateSpec};
use crate::schema::SchemaMap;
use crate::sql::{CompiledSql, QueryCompiler, SqlDialect};
use crate::transaction::{IsolationLevel, Session, TransactionOptions};

struct Shared {
    pool: Arc<dyn ConnectionPool>,
    dialect: Arc<dyn SqlDialect>,
    schema: RwLock<Arc<SchemaMap>>,
    default_retry: u32,
    default_mode: IsolationLevel,
}

/// SQL backed [`Storage`].
///
/// Cloning is cheap. A handle returned to a `with_transaction` callback is
/// bound to that transaction's session: every statement it runs goes
/// through the same connection, one statement at a time.
#[derive(Clone)]
pub struct SqlStorage {
    shared: Arc<Shared>,
    session: Option<Arc<Mutex<Session>>>,
}

impl std::fmt::Debug for SqlStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlStorage")
            .field("bound", &self.session.is_some())
            .field("default_retry", &self.shared.default_retry)
            .finish()
    }
}

/// Connection used by one operation
enum Handle {
    Pooled(PooledConnection),
    Session(OwnedMutexGuard<Session>),
}

impl Handle {
    fn conn(&mut self) -> &mut PooledConnection {
        match self {
            Handle::Pooled(conn) => conn,
            Handle::Session(session) => session.connection(),
        }
    }

    fn select_lock(&self) -> bool {
        match self {
            Handle::Pooled(_) => false,
            Handle::Session(session) => session.select_lock(),
        }
    }
}

impl SqlStorage {
    pub fn new(pool: Arc<dyn ConnectionPool>, dialect: Arc<dyn SqlDialect>) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                dialect,
                schema: RwLock::new(Arc::new(SchemaMap::default())),
                default_retry: 0,
                default_mode: IsolationLevel::Default,
            }),
            session: None,
        }
    }

    /// Retry budget and isolation used when `with_transaction` gets none.
    ///
    /// Must be called before the storage is cloned.
    pub fn with_transaction_defaults(mut self, retry: u32, mode: IsolationLevel) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.default_retry = retry;
            shared.default_mode = mode;
        }
        self
    }

    /// True inside a top-level `repeatable-read` transaction
    pub async fn select_lock(&self) -> bool {
        match &self.session {
            Some(session) => session.lock().await.select_lock(),
            None => false,
        }
    }

    pub async fn in_transaction(&self) -> bool {
        match &self.session {
            Some(session) => session.lock().await.in_transaction(),
            None => false,
        }
    }

    fn bound(&self, session: Arc<Mutex<Session>>) -> SqlStorage {
        SqlStorage {
            shared: self.shared.clone(),
            session: Some(session),
        }
    }

    async fn handle(&self) -> DbResult<Handle> {
        match &self.session {
            Some(session) => Ok(Handle::Session(session.clone().lock_owned().await)),
            None => Ok(Handle::Pooled(self.shared.pool.acquire().await?)),
        }
    }

    fn compile<T>(
        &self,
        select_lock: bool,
        build: impl FnOnce(&QueryCompiler<'_>) -> DbResult<T>,
    ) -> DbResult<T> {
        let schema = self.schema();
        let compiler = QueryCompiler::new(&schema, self.shared.dialect.as_ref()).with_select_lock(select_lock);
        build(&compiler)
    }

    /// Run `callback` in a transaction.
    ///
    /// Inside a running transaction this takes a savepoint and never
    /// retries. At the top level a serialization conflict restarts the whole
    /// transaction on a fresh connection, up to `retry` more times.
    pub async fn with_transaction<F, Fut, T>(&self, options: TransactionOptions, callback: F) -> DbResult<T>
    where
        F: Fn(SqlStorage) -> Fut + Send + Sync,
        Fut: Future<Output = DbResult<T>> + Send,
        T: Send,
    {
        let mode = options.mode.unwrap_or(self.shared.default_mode);
        if let Some(session) = &self.session {
            if session.lock().await.in_transaction() {
                return self.run_in(session.clone(), mode, &callback).await;
            }
        }

        let retry = options.retry.unwrap_or(self.shared.default_retry);
        let mut attempt = 0;
        loop {
            let session = match &self.session {
                Some(session) => session.clone(),
                None => Arc::new(Mutex::new(Session::new(self.shared.pool.acquire().await?))),
            };
            match self.run_in(session.clone(), mode, &callback).await {
                Err(err) if err.is_retryable() && attempt < retry => {
                    // a pinned connection cannot be swapped for a fresh one
                    if self.session.is_some() && session.lock().await.is_discarded() {
                        warn!(error = %err, "Connection discarded, not retrying transaction");
                        return Err(err);
                    }
                    attempt += 1;
                    warn!(attempt, retry, error = %err, "Retrying transaction after conflict");
                }
                result => return result,
            }
        }
    }

    async fn run_in<F, Fut, T>(&self, session: Arc<Mutex<Session>>, mode: IsolationLevel, callback: &F) -> DbResult<T>
    where
        F: Fn(SqlStorage) -> Fut + Send + Sync,
        Fut: Future<Output = DbResult<T>> + Send,
        T: Send,
    {
        let frame = session.lock().await.begin(mode).await?;
        match callback(self.bound(session.clone())).await {
            Ok(value) => {
                session.lock().await.commit(frame).await?;
                Ok(value)
            }
            Err(err) => {
                // a failed rollback is logged and the connection discarded by the session
                let _ = session.lock().await.rollback(frame).await;
                Err(err)
            }
        }
    }

    /// Run `callback` on the current transaction, or in a new default one.
    pub async fn atomic<F, Fut, T>(&self, callback: F) -> DbResult<T>
    where
        F: Fn(SqlStorage) -> Fut + Send + Sync,
        Fut: Future<Output = DbResult<T>> + Send,
        T: Send,
    {
        if self.in_transaction().await {
            return callback(self.clone()).await;
        }
        self.with_transaction(TransactionOptions::default(), callback).await
    }

    /// Pin every statement run by `callback` to one connection.
    pub async fn with_connection<F, Fut, T>(&self, callback: F) -> DbResult<T>
    where
        F: FnOnce(SqlStorage) -> Fut + Send,
        Fut: Future<Output = DbResult<T>> + Send,
        T: Send,
    {
        if self.session.is_some() {
            return callback(self.clone()).await;
        }
        let conn = self.shared.pool.acquire().await?;
        callback(self.bound(Arc::new(Mutex::new(Session::new(conn))))).await
    }

    async fn execute_all(&self, statements: &[CompiledSql]) -> DbResult<()> {
        let mut handle = self.handle().await?;
        for statement in statements {
            handle.conn().execute(statement).await?;
        }
        Ok(())
    }

    fn find_rows<'a>(&'a self, query: &'a DecodedQuery) -> impl Stream<Item = DbResult<Value>> + Send + 'a {
        try_stream! {
            let mut handle = self.handle().await?;
            let select = self.compile(handle.select_lock(), |c| c.select(query))?;
            let mut rows = handle.conn().query_stream(&select.sql);
            while let Some(row) = rows.try_next().await? {
                let object = select.recipe.decode(&row)?;
                yield object;
            }
        }
    }
}

fn first_row(rows: Vec<Value>, what: &str) -> DbResult<Value> {
    rows.into_iter()
        .next()
        .ok_or_else(|| DbError::InternalError(format!("{} returned no row", what)))
}

#[async_trait::async_trait]
impl Storage for SqlStorage {
    fn schema(&self) -> Arc<SchemaMap> {
        self.shared.schema.read().clone()
    }

    async fn prepare(&self, schema: SchemaMap) -> DbResult<()> {
        let schema = Arc::new(schema.prepare()?);
        let statements = {
            let compiler = QueryCompiler::new(&schema, self.shared.dialect.as_ref());
            let mut statements = vec![compiler.create_config_table()];
            for class_name in schema.classes() {
                statements.extend(compiler.migrate(&class_name)?);
            }
            statements
        };
        self.execute_all(&statements).await?;

        let classes = schema.classes().len();
        *self.shared.schema.write() = schema;
        info!(classes, statements = statements.len(), "Schema prepared");
        Ok(())
    }

    async fn classes(&self) -> DbResult<Vec<String>> {
        let mut handle = self.handle().await?;
        let sql = self.compile(false, |c| Ok(c.list_tables()))?;
        let rows = handle.conn().query(&sql).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.as_str().map(str::to_string))
            .filter(|name| !name.starts_with('_'))
            .collect())
    }

    async fn config(&self) -> DbResult<Map<String, Value>> {
        let mut handle = self.handle().await?;
        let sql = self.compile(false, |c| Ok(c.read_config()))?;
        match first_row(handle.conn().query(&sql).await?, "config")? {
            Value::Object(map) => Ok(map),
            other => Err(DbError::InternalError(format!("unexpected config row {}", other))),
        }
    }

    async fn set_config(&self, values: Map<String, Value>) -> DbResult<()> {
        let statements = self.compile(false, |c| {
            Ok(values
                .iter()
                .map(|(key, value)| c.write_config(key, value))
                .collect::<Vec<_>>())
        })?;
        self.execute_all(&statements).await?;
        debug!(keys = values.len(), "Config updated");
        Ok(())
    }

    async fn explain(&self, query: &DecodedQuery) -> DbResult<Value> {
        let mut handle = self.handle().await?;
        let sql = self.compile(handle.select_lock(), |c| c.explain(query))?;
        first_row(handle.conn().query(&sql).await?, "explain")
    }

    async fn count(&self, query: &DecodedQuery) -> DbResult<u64> {
        let mut handle = self.handle().await?;
        let sql = self.compile(handle.select_lock(), |c| c.count(query))?;
        let row = first_row(handle.conn().query(&sql).await?, "count")?;
        row.as_u64()
            .ok_or_else(|| DbError::InternalError(format!("unexpected count {}", row)))
    }

    fn find<'a>(&'a self, query: &'a DecodedQuery) -> BoxStream<'a, DbResult<Value>> {
        Box::pin(self.find_rows(query))
    }

    async fn insert(&self, options: &InsertOptions, values: &[InsertValues]) -> DbResult<Vec<Value>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let mut handle = self.handle().await?;
        let select = self.compile(handle.select_lock(), |c| c.insert(options, values))?;
        let rows = handle.conn().query(&select.sql).await?;
        rows.iter().map(|row| select.recipe.decode(row)).collect()
    }

    async fn update_one(&self, query: &DecodedQuery, update: &UpdateSpec) -> DbResult<Option<Value>> {
        let mut handle = self.handle().await?;
        let select = self.compile(handle.select_lock(), |c| c.update_one(query, update))?;
        let rows = handle.conn().query(&select.sql).await?;
        rows.first().map(|row| select.recipe.decode(row)).transpose()
    }

    async fn upsert_one(
        &self,
        query: &DecodedQuery,
        update: &UpdateSpec,
        set_on_insert: &InsertValues,
    ) -> DbResult<Value> {
        let mut handle = self.handle().await?;
        let select = self.compile(handle.select_lock(), |c| c.upsert_one(query, update, set_on_insert))?;
        let row = first_row(handle.conn().query(&select.sql).await?, "upsert")?;
        select.recipe.decode(&row)
    }

    async fn delete_one(&self, query: &DecodedQuery) -> DbResult<Option<Value>> {
        let mut handle = self.handle().await?;
        let select = self.compile(handle.select_lock(), |c| c.delete_one(query))?;
        let rows = handle.conn().query(&select.sql).await?;
        rows.first().map(|row| select.recipe.decode(row)).transpose()
    }

    async fn delete_many(&self, query: &DecodedQuery) -> DbResult<u64> {
        let mut handle = self.handle().await?;
        let sql = self.compile(handle.select_lock(), |c| c.delete_many(query))?;
        let row = first_row(handle.conn().query(&sql).await?, "delete")?;
        row.as_u64()
            .ok_or_else(|| DbError::InternalError(format!("unexpected delete count {}", row)))
    }
}
