//! Common test utilities
//!
//! Provides a recording in-memory connection pool: every statement a test
//! runs is logged, and rows come from a scripted responder. No database is
//! needed.

#![allow(dead_code)]

use futures::stream::BoxStream;
use parking_lot::Mutex;
use schemadb::sql::CompiledSql;
use schemadb::storage::{Connection, ConnectionHome, ConnectionPool, PooledConnection};
use schemadb::{DbResult, PostgresDialect, SchemaMap, SqlStorage};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub type Responder = Arc<dyn Fn(&str) -> DbResult<Vec<Value>> + Send + Sync>;

/// Statements seen by every connection of a [`RecordingPool`]
#[derive(Clone, Default)]
pub struct StatementLog(Arc<Mutex<Vec<String>>>);

impl StatementLog {
    pub fn push(&self, statement: &str) {
        self.0.lock().push(statement.to_string());
    }

    pub fn statements(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Statements whose text starts with one of the transaction keywords
    pub fn transaction_statements(&self) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| {
                ["BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "RELEASE"]
                    .iter()
                    .any(|keyword| s.starts_with(keyword))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

pub struct RecordingConnection {
    log: StatementLog,
    responder: Responder,
}

#[async_trait::async_trait]
impl Connection for RecordingConnection {
    async fn execute(&mut self, sql: &CompiledSql) -> DbResult<u64> {
        self.log.push(&sql.text);
        Ok((self.responder)(&sql.text)?.len() as u64)
    }

    fn query_stream<'a>(&'a mut self, sql: &'a CompiledSql) -> BoxStream<'a, DbResult<Value>> {
        self.log.push(&sql.text);
        match (self.responder)(&sql.text) {
            Ok(rows) => Box::pin(futures::stream::iter(rows.into_iter().map(Ok))),
            Err(err) => Box::pin(futures::stream::once(async move { Err(err) })),
        }
    }
}

/// Counts connections handed back to the pool
#[derive(Default)]
pub struct ReturnCounter(AtomicUsize);

impl ConnectionHome for ReturnCounter {
    fn release(&self, _conn: Box<dyn Connection>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct RecordingPool {
    pub log: StatementLog,
    responder: Responder,
    acquired: AtomicUsize,
    returned: Arc<ReturnCounter>,
}

impl RecordingPool {
    pub fn new(responder: impl Fn(&str) -> DbResult<Vec<Value>> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            log: StatementLog::default(),
            responder: Arc::new(responder),
            acquired: AtomicUsize::new(0),
            returned: Arc::new(ReturnCounter::default()),
        })
    }

    /// Answers every statement with no rows
    pub fn empty() -> Arc<Self> {
        Self::new(|_| Ok(Vec::new()))
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Connections that went back to the pool after use
    pub fn returned(&self) -> usize {
        self.returned.0.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ConnectionPool for RecordingPool {
    async fn acquire(&self) -> DbResult<PooledConnection> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection::new(Box::new(RecordingConnection {
            log: self.log.clone(),
            responder: self.responder.clone(),
        }))
        .returning_to(self.returned.clone()))
    }
}

/// Storage over a recording pool, using the PostgreSQL dialect
pub fn recording_storage(pool: Arc<RecordingPool>) -> SqlStorage {
    SqlStorage::new(pool, Arc::new(PostgresDialect))
}

/// Post, Comment, Invite and Secret classes on top of the built-in User and Role
pub fn blog_schema_json() -> Value {
    json!({
        "Post": {
            "fields": {
                "title": "string",
                "body": "string",
                "views": "number",
                "tags": "string[]",
                "author": {"type": "pointer", "target": "User"},
                "comments": {"type": "relation", "target": "Comment", "foreignField": "post"}
            },
            "classLevelPermissions": {
                "find": ["*"],
                "get": ["*"],
                "count": ["*"],
                "create": ["role:editor"],
                "update": ["role:editor"],
                "delete": ["role:admin"]
            },
            "fieldLevelPermissions": {
                "body": {"create": ["role:admin"], "update": ["role:admin"]}
            }
        },
        "Comment": {
            "fields": {
                "text": "string",
                "post": {"type": "pointer", "target": "Post"}
            }
        },
        "Invite": {
            "fields": {
                "email": "string"
            },
            "classLevelPermissions": {
                "get": ["*"],
                "find": ["role:admin"]
            }
        },
        "Secret": {
            "fields": {
                "code": "string"
            },
            "classLevelPermissions": {
                "find": ["role:admin"],
                "get": ["role:admin"],
                "count": ["role:admin"],
                "create": [],
                "update": [],
                "delete": []
            }
        }
    })
}

pub fn blog_schema() -> SchemaMap {
    SchemaMap::from_json(&blog_schema_json())
        .and_then(SchemaMap::prepare)
        .expect("blog schema is valid")
}

/// Storage whose schema is the blog schema, with the migration statements
/// cleared from the log.
pub async fn prepared_storage(pool: Arc<RecordingPool>) -> SqlStorage {
    use schemadb::Storage;

    let storage = recording_storage(pool.clone());
    let schema = SchemaMap::from_json(&blog_schema_json()).expect("blog schema parses");
    storage.prepare(schema).await.expect("prepare succeeds");
    pool.log.0.lock().clear();
    storage
}
