//! Connection and pool abstractions.
//!
//! The engine only sees [`Connection`] and [`ConnectionPool`]; the
//! tokio-postgres adapter lives in [`super::postgres`]. A [`PooledConnection`]
//! goes back to its pool when dropped, so every exit path releases it.

use futures::stream::{BoxStream, TryStreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

use crate::error::{DbError, DbResult};
use crate::sql::CompiledSql;

/// One database connection.
///
/// Every statement that returns rows projects exactly one JSONB column.
#[async_trait::async_trait]
pub trait Connection: Send {
    /// Run a statement, returning the number of affected rows
    async fn execute(&mut self, sql: &CompiledSql) -> DbResult<u64>;

    /// Run a statement and collect the first column of every row
    async fn query(&mut self, sql: &CompiledSql) -> DbResult<Vec<Value>> {
        self.query_stream(sql).try_collect().await
    }

    /// Lazily stream the first column of every row
    fn query_stream<'a>(&'a mut self, sql: &'a CompiledSql) -> BoxStream<'a, DbResult<Value>>;

    /// Broken connections are never handed out again
    fn is_closed(&self) -> bool {
        false
    }
}

#[async_trait::async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn acquire(&self) -> DbResult<PooledConnection>;
}

/// Where a [`PooledConnection`] goes when it is dropped
pub trait ConnectionHome: Send + Sync {
    fn release(&self, conn: Box<dyn Connection>);
}

/// Connection checked out of a pool
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    home: Option<Arc<dyn ConnectionHome>>,
    permit: Option<OwnedSemaphorePermit>,
    discarded: bool,
}

impl PooledConnection {
    pub fn new(conn: Box<dyn Connection>) -> Self {
        Self {
            conn: Some(conn),
            home: None,
            permit: None,
            discarded: false,
        }
    }

    pub fn returning_to(mut self, home: Arc<dyn ConnectionHome>) -> Self {
        self.home = Some(home);
        self
    }

    /// Pool slot held until the connection is dropped
    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    /// Close the connection instead of returning it to the pool
    pub fn discard(&mut self) {
        self.discarded = true;
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    fn inner(&mut self) -> DbResult<&mut Box<dyn Connection>> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::ConnectionError("connection already released".to_string()))
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pooled", &self.home.is_some())
            .field("discarded", &self.discarded)
            .finish()
    }
}

#[async_trait::async_trait]
impl Connection for PooledConnection {
    async fn execute(&mut self, sql: &CompiledSql) -> DbResult<u64> {
        self.inner()?.execute(sql).await
    }

    async fn query(&mut self, sql: &CompiledSql) -> DbResult<Vec<Value>> {
        self.inner()?.query(sql).await
    }

    fn query_stream<'a>(&'a mut self, sql: &'a CompiledSql) -> BoxStream<'a, DbResult<Value>> {
        match self.inner() {
            Ok(conn) => conn.query_stream(sql),
            Err(err) => Box::pin(futures::stream::once(async move { Err(err) })),
        }
    }

    fn is_closed(&self) -> bool {
        self.conn.as_ref().map(|c| c.is_closed()).unwrap_or(true)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.discarded || conn.is_closed() {
            return;
        }
        if let Some(home) = &self.home {
            home.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Echo {
        closed: bool,
    }

    #[async_trait::async_trait]
    impl Connection for Echo {
        async fn execute(&mut self, _sql: &CompiledSql) -> DbResult<u64> {
            Ok(1)
        }

        fn query_stream<'a>(&'a mut self, sql: &'a CompiledSql) -> BoxStream<'a, DbResult<Value>> {
            Box::pin(futures::stream::iter(vec![Ok(Value::String(sql.text.clone()))]))
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    #[derive(Default)]
    struct Idle(Mutex<Vec<Box<dyn Connection>>>);

    impl ConnectionHome for Idle {
        fn release(&self, conn: Box<dyn Connection>) {
            self.0.lock().push(conn);
        }
    }

    #[tokio::test]
    async fn test_query_collects_stream() {
        let mut conn = PooledConnection::new(Box::new(Echo { closed: false }));
        let rows = conn.query(&CompiledSql::new("SELECT 1")).await.unwrap();
        assert_eq!(rows, vec![Value::String("SELECT 1".to_string())]);
        assert_eq!(conn.execute(&CompiledSql::new("SET x = 1")).await.unwrap(), 1);
    }

    #[test]
    fn test_drop_returns_connection() {
        let home = Arc::new(Idle::default());
        drop(PooledConnection::new(Box::new(Echo { closed: false })).returning_to(home.clone()));
        assert_eq!(home.0.lock().len(), 1);
    }

    #[test]
    fn test_discarded_and_closed_connections_are_dropped() {
        let home = Arc::new(Idle::default());

        let mut conn = PooledConnection::new(Box::new(Echo { closed: false })).returning_to(home.clone());
        conn.discard();
        drop(conn);

        drop(PooledConnection::new(Box::new(Echo { closed: true })).returning_to(home.clone()));
        assert!(home.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let conn = PooledConnection::new(Box::new(Echo { closed: false })).with_permit(permit);
        assert_eq!(semaphore.available_permits(), 0);
        drop(conn);
        assert_eq!(semaphore.available_permits(), 1);
    }
}
