//! Per-transaction handle.
//!
//! A [`Session`] owns one pooled connection for the lifetime of a
//! (possibly nested) transaction. The outermost `with_transaction` opens it
//! with `BEGIN`; every nested call takes a savepoint on the same session.

use tracing::{debug, warn};

use super::IsolationLevel;
use crate::error::DbResult;
use crate::sql::CompiledSql;
use crate::storage::pool::{Connection, PooledConnection};

/// State of the transaction running on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionState {
    pub mode: IsolationLevel,
    /// Number of savepoints taken so far; names the next one
    pub savepoint_counter: u32,
    pub select_lock: bool,
}

/// Level of the transaction opened by one `begin`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Top,
    Savepoint(String),
}

pub struct Session {
    conn: PooledConnection,
    state: Option<TransactionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("state", &self.state).finish()
    }
}

impl Session {
    pub fn new(conn: PooledConnection) -> Self {
        Self { conn, state: None }
    }

    pub fn connection(&mut self) -> &mut PooledConnection {
        &mut self.conn
    }

    pub fn state(&self) -> Option<&TransactionState> {
        self.state.as_ref()
    }

    pub fn in_transaction(&self) -> bool {
        self.state.is_some()
    }

    /// True once the connection is marked to be closed instead of reused
    pub fn is_discarded(&self) -> bool {
        self.conn.is_discarded()
    }

    /// True only inside a top-level `repeatable-read` transaction; nested
    /// savepoints inherit it.
    pub fn select_lock(&self) -> bool {
        self.state.map(|s| s.select_lock).unwrap_or(false)
    }

    /// Open a transaction, or a savepoint when one is already running.
    ///
    /// `mode` only applies to the top level.
    pub async fn begin(&mut self, mode: IsolationLevel) -> DbResult<Frame> {
        match self.state.as_mut() {
            None => {
                self.conn
                    .execute(&CompiledSql::new(mode.begin_statement()))
                    .await?;
                self.state = Some(TransactionState {
                    mode,
                    savepoint_counter: 0,
                    select_lock: mode == IsolationLevel::RepeatableRead,
                });
                debug!(?mode, "Transaction started");
                Ok(Frame::Top)
            }
            Some(state) => {
                let name = format!("savepoint_{}", state.savepoint_counter);
                state.savepoint_counter += 1;
                self.conn
                    .execute(&CompiledSql::new(format!("SAVEPOINT {}", name)))
                    .await?;
                debug!(savepoint = %name, "Savepoint created");
                Ok(Frame::Savepoint(name))
            }
        }
    }

    pub async fn commit(&mut self, frame: Frame) -> DbResult<()> {
        match frame {
            Frame::Top => {
                // the server ends the transaction even when COMMIT fails
                self.state = None;
                self.conn.execute(&CompiledSql::new("COMMIT")).await?;
                debug!("Transaction committed");
            }
            Frame::Savepoint(name) => {
                self.conn
                    .execute(&CompiledSql::new(format!("RELEASE SAVEPOINT {}", name)))
                    .await?;
                debug!(savepoint = %name, "Savepoint released");
            }
        }
        Ok(())
    }

    /// Undo the frame. A connection that cannot roll back is not reused.
    pub async fn rollback(&mut self, frame: Frame) -> DbResult<()> {
        let statement = match &frame {
            Frame::Top => {
                self.state = None;
                CompiledSql::new("ROLLBACK")
            }
            Frame::Savepoint(name) => CompiledSql::new(format!("ROLLBACK TO SAVEPOINT {}", name)),
        };
        if let Err(err) = self.conn.execute(&statement).await {
            warn!(error = %err, "Rollback failed, discarding connection");
            self.conn.discard();
            return Err(err);
        }
        match frame {
            Frame::Top => debug!("Transaction rolled back"),
            Frame::Savepoint(name) => debug!(savepoint = %name, "Rolled back to savepoint"),
        }
        Ok(())
    }
}

/// Dropped mid-transaction: the open transaction must not reach the next
/// borrower of the connection.
impl Drop for Session {
    fn drop(&mut self) {
        if self.state.is_some() && !self.conn.is_discarded() {
            warn!("Session dropped inside a transaction, discarding connection");
            self.conn.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::BoxStream;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::Arc;

    use crate::error::DbError;

    #[derive(Clone, Default)]
    struct Log {
        statements: Arc<Mutex<Vec<String>>>,
        fail_rollback: bool,
    }

    #[async_trait::async_trait]
    impl Connection for Log {
        async fn execute(&mut self, sql: &CompiledSql) -> DbResult<u64> {
            self.statements.lock().push(sql.text.clone());
            if self.fail_rollback && sql.text.starts_with("ROLLBACK") {
                return Err(DbError::ConnectionError("closed".to_string()));
            }
            Ok(0)
        }

        fn query_stream<'a>(&'a mut self, _sql: &'a CompiledSql) -> BoxStream<'a, DbResult<Value>> {
            Box::pin(futures::stream::empty())
        }
    }

    fn session(log: &Log) -> Session {
        Session::new(PooledConnection::new(Box::new(log.clone())))
    }

    #[test]
    fn test_savepoints_are_numbered_per_session() {
        let log = Log::default();
        let mut session = session(&log);
        tokio_test::block_on(async {
            let top = session.begin(IsolationLevel::RepeatableRead).await.unwrap();
            let first = session.begin(IsolationLevel::Serializable).await.unwrap();
            assert_eq!(first, Frame::Savepoint("savepoint_0".to_string()));
            session.commit(first).await.unwrap();
            let second = session.begin(IsolationLevel::Default).await.unwrap();
            assert!(session.select_lock());
            session.rollback(second).await.unwrap();
            session.commit(top).await.unwrap();
        });

        assert!(!session.in_transaction());
        assert_eq!(
            *log.statements.lock(),
            vec![
                "BEGIN ISOLATION LEVEL REPEATABLE READ",
                "SAVEPOINT savepoint_0",
                "RELEASE SAVEPOINT savepoint_0",
                "SAVEPOINT savepoint_1",
                "ROLLBACK TO SAVEPOINT savepoint_1",
                "COMMIT",
            ]
        );
    }

    #[test]
    fn test_failed_rollback_discards_connection() {
        let log = Log {
            fail_rollback: true,
            ..Default::default()
        };
        let mut session = session(&log);
        tokio_test::block_on(async {
            let top = session.begin(IsolationLevel::Default).await.unwrap();
            assert!(session.rollback(top).await.is_err());
        });
        assert!(!session.in_transaction());
        assert!(format!("{:?}", session.connection()).contains("discarded: true"));
    }

    #[derive(Default)]
    struct Returned(Mutex<usize>);

    impl crate::storage::pool::ConnectionHome for Returned {
        fn release(&self, _conn: Box<dyn Connection>) {
            *self.0.lock() += 1;
        }
    }

    #[test]
    fn test_dropped_open_session_is_not_returned() {
        let home = Arc::new(Returned::default());
        let log = Log::default();

        let mut open = Session::new(PooledConnection::new(Box::new(log.clone())).returning_to(home.clone()));
        tokio_test::block_on(async {
            open.begin(IsolationLevel::Default).await.unwrap();
        });
        drop(open);
        assert_eq!(*home.0.lock(), 0);

        let mut done = Session::new(PooledConnection::new(Box::new(log)).returning_to(home.clone()));
        tokio_test::block_on(async {
            let top = done.begin(IsolationLevel::Default).await.unwrap();
            done.commit(top).await.unwrap();
        });
        drop(done);
        assert_eq!(*home.0.lock(), 1);
    }
}
