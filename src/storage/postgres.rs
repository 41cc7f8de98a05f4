//! tokio-postgres connection pool.

use async_stream::try_stream;
use futures::stream::{BoxStream, Stream, TryStreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use super::pool::{Connection, ConnectionHome, ConnectionPool, PooledConnection};
use crate::error::{DbError, DbResult};
use crate::sql::{CompiledSql, SqlParam};

#[derive(Debug, Clone)]
pub struct PgPoolOptions {
    pub size: usize,
    pub acquire_timeout: Duration,
    pub statement_timeout: Option<Duration>,
}

impl Default for PgPoolOptions {
    fn default() -> Self {
        Self {
            size: 10,
            acquire_timeout: Duration::from_millis(5000),
            statement_timeout: None,
        }
    }
}

struct PoolShared {
    config: tokio_postgres::Config,
    options: PgPoolOptions,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Connection>>>,
}

impl ConnectionHome for PoolShared {
    fn release(&self, conn: Box<dyn Connection>) {
        self.idle.lock().push(conn);
    }
}

/// Bounded pool of PostgreSQL connections.
///
/// At most `size` connections are checked out at once; idle ones are kept
/// for reuse. Waiting longer than `acquire_timeout` fails with
/// `ConnectionError`.
#[derive(Clone)]
pub struct PgPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for PgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPool")
            .field("size", &self.shared.options.size)
            .field("idle", &self.shared.idle.lock().len())
            .finish()
    }
}

impl PgPool {
    pub fn new(database_url: &str, options: PgPoolOptions) -> DbResult<Self> {
        let config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e: tokio_postgres::Error| DbError::ConnectionError(e.to_string()))?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                semaphore: Arc::new(Semaphore::new(options.size.max(1))),
                idle: Mutex::new(Vec::new()),
                options,
            }),
        })
    }

    async fn connect(&self) -> DbResult<PgConnection> {
        let (client, connection) = self.shared.config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL connection error: {}", e);
            }
        });
        if let Some(timeout) = self.shared.options.statement_timeout {
            client
                .batch_execute(&format!("SET statement_timeout = {}", timeout.as_millis()))
                .await?;
        }
        debug!("Opened PostgreSQL connection");
        Ok(PgConnection { client })
    }
}

#[async_trait::async_trait]
impl ConnectionPool for PgPool {
    async fn acquire(&self) -> DbResult<PooledConnection> {
        let permit = tokio::time::timeout(
            self.shared.options.acquire_timeout,
            self.shared.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            warn!(
                timeout_ms = self.shared.options.acquire_timeout.as_millis() as u64,
                "Timed out waiting for a pooled connection"
            );
            DbError::ConnectionError("pool exhausted".to_string())
        })?
        .map_err(|_| DbError::ConnectionError("pool closed".to_string()))?;

        let reused = self.shared.idle.lock().pop();
        let conn: Box<dyn Connection> = match reused {
            Some(conn) => conn,
            None => Box::new(self.connect().await?),
        };
        Ok(PooledConnection::new(conn)
            .returning_to(self.shared.clone())
            .with_permit(permit))
    }
}

pub struct PgConnection {
    client: Client,
}

type BoxedParam = Box<dyn ToSql + Sync + Send>;

fn encode_params(values: &[SqlParam]) -> Vec<BoxedParam> {
    values
        .iter()
        .map(|value| -> BoxedParam {
            match value {
                SqlParam::Bool(b) => Box::new(*b),
                SqlParam::Float(n) => Box::new(*n),
                SqlParam::Decimal(s) | SqlParam::Text(s) => Box::new(s.clone()),
                SqlParam::Timestamp(t) => Box::new(*t),
                SqlParam::Json(v) => Box::new(v.clone()),
                SqlParam::TextArray(items) => Box::new(items.clone()),
                SqlParam::FloatArray(items) => Box::new(items.clone()),
                SqlParam::JsonArray(items) => Box::new(items.clone()),
            }
        })
        .collect()
}

fn param_refs(params: &[BoxedParam]) -> impl ExactSizeIterator<Item = &(dyn ToSql + Sync)> {
    params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync))
}

impl PgConnection {
    fn rows<'a>(&'a mut self, sql: &'a CompiledSql) -> impl Stream<Item = DbResult<Value>> + Send + 'a {
        try_stream! {
            let params = encode_params(&sql.values);
            let rows = self.client.query_raw(sql.text.as_str(), param_refs(&params)).await?;
            let mut rows = Box::pin(rows);
            while let Some(row) = rows.try_next().await? {
                let value: Value = row.try_get(0)?;
                yield value;
            }
        }
    }
}

#[async_trait::async_trait]
impl Connection for PgConnection {
    async fn execute(&mut self, sql: &CompiledSql) -> DbResult<u64> {
        if sql.values.is_empty() {
            self.client.batch_execute(&sql.text).await?;
            return Ok(0);
        }
        let params = encode_params(&sql.values);
        Ok(self
            .client
            .execute_raw(sql.text.as_str(), param_refs(&params))
            .await?)
    }

    fn query_stream<'a>(&'a mut self, sql: &'a CompiledSql) -> BoxStream<'a, DbResult<Value>> {
        Box::pin(self.rows(sql))
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_rejects_bad_url() {
        let err = PgPool::new("postgres://user@host:notaport/db", PgPoolOptions::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectionError);
    }

    #[test]
    fn test_encode_params_keeps_order() {
        let params = encode_params(&[
            SqlParam::Text("a".to_string()),
            SqlParam::Float(1.5),
            SqlParam::TextArray(vec!["*".to_string()]),
        ]);
        assert_eq!(params.len(), 3);
        assert_eq!(param_refs(&params).len(), 3);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let options = PgPoolOptions {
            size: 1,
            acquire_timeout: Duration::from_millis(10),
            statement_timeout: None,
        };
        let pool = PgPool::new("postgres://localhost/schemadb", options).unwrap();
        let _held = pool.shared.semaphore.clone().acquire_owned().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.to_string(), "Connection error: pool exhausted");
    }
}
