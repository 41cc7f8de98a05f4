//! Transaction tests
//!
//! Tests for `with_transaction` over a recording pool, covering:
//! - Top-level begin/commit/rollback
//! - Savepoint nesting
//! - Retry after serialization conflicts
//! - Select locking under repeatable read

mod common;

use common::{prepared_storage, RecordingPool};
use schemadb::query::DecodedQuery;
use schemadb::{DbError, DbResult, IsolationLevel, SqlStorage, Storage, TransactionOptions};
use selector_core::UpdateOp;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn conflict_on_count(text: &str) -> DbResult<Vec<Value>> {
    if text.starts_with("SELECT to_jsonb(COUNT(*))") {
        Err(DbError::from_sqlstate("40001", "could not serialize access"))
    } else {
        Ok(Vec::new())
    }
}

async fn count_posts(tx: SqlStorage) -> DbResult<u64> {
    let query = DecodedQuery::new("Post");
    tx.count(&query).await
}

async fn touch_post(tx: SqlStorage) -> DbResult<Option<Value>> {
    let query = DecodedQuery::new("Post");
    let update = UpdateOp::decode_map(&json!({"title": {"$set": "x"}}))?;
    tx.update_one(&query, &update).await
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_commit_on_success() {
    let pool = RecordingPool::empty();
    let storage = prepared_storage(pool.clone()).await;

    let value = storage
        .with_transaction(TransactionOptions::new(), |tx| async move {
            assert!(tx.in_transaction().await);
            Ok(7)
        })
        .await
        .unwrap();

    assert_eq!(value, 7);
    assert_eq!(pool.log.transaction_statements(), vec!["BEGIN", "COMMIT"]);
    assert!(!storage.in_transaction().await);
}

#[tokio::test]
async fn test_rollback_on_error() {
    let pool = RecordingPool::empty();
    let storage = prepared_storage(pool.clone()).await;

    let err = storage
        .with_transaction(TransactionOptions::new().retry(3), |_| async {
            Err::<(), _>(DbError::InvalidValue("boom".to_string()))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::InvalidValue(_)));
    assert_eq!(pool.log.transaction_statements(), vec!["BEGIN", "ROLLBACK"]);
}

#[tokio::test]
async fn test_failed_rollback_keeps_callback_error() {
    let pool = RecordingPool::new(|text| {
        if text == "ROLLBACK" {
            Err(DbError::ConnectionError("gone".to_string()))
        } else {
            Ok(Vec::new())
        }
    });
    let storage = prepared_storage(pool.clone()).await;

    let err = storage
        .with_transaction(TransactionOptions::new(), |_| async {
            Err::<(), _>(DbError::InvalidValue("boom".to_string()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidValue(_)));
}

#[tokio::test]
async fn test_cancelled_transaction_does_not_return_connection() {
    let pool = RecordingPool::empty();
    let storage = prepared_storage(pool.clone()).await;
    let before = pool.returned();

    let result = tokio::time::timeout(
        Duration::from_millis(20),
        storage.with_transaction(TransactionOptions::new(), |_| {
            futures::future::pending::<DbResult<()>>()
        }),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(pool.log.transaction_statements(), vec!["BEGIN"]);
    assert_eq!(pool.returned(), before);

    // a finished transaction hands its connection back
    storage
        .with_transaction(TransactionOptions::new(), |_| async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(pool.returned(), before + 1);
}

#[tokio::test]
async fn test_isolation_level_begin_statement() {
    let pool = RecordingPool::empty();
    let storage = prepared_storage(pool.clone()).await;

    storage
        .with_transaction(
            TransactionOptions::new().mode(IsolationLevel::Serializable),
            |_| async { Ok(()) },
        )
        .await
        .unwrap();

    assert_eq!(
        pool.log.transaction_statements(),
        vec!["BEGIN ISOLATION LEVEL SERIALIZABLE", "COMMIT"]
    );
}

// ============================================================================
// Savepoint Tests
// ============================================================================

#[tokio::test]
async fn test_nested_transactions_use_savepoints() {
    let pool = RecordingPool::empty();
    let storage = prepared_storage(pool.clone()).await;

    storage
        .with_transaction(TransactionOptions::new(), |tx| async move {
            tx.with_transaction(TransactionOptions::new(), |inner| async move {
                inner
                    .with_transaction(TransactionOptions::new(), |_| async { Ok(()) })
                    .await
            })
            .await
        })
        .await
        .unwrap();

    assert_eq!(
        pool.log.transaction_statements(),
        vec![
            "BEGIN",
            "SAVEPOINT savepoint_0",
            "SAVEPOINT savepoint_1",
            "RELEASE SAVEPOINT savepoint_1",
            "RELEASE SAVEPOINT savepoint_0",
            "COMMIT",
        ]
    );
    // one connection for the migration, one for the whole transaction
    assert_eq!(pool.acquired(), 2);
}

#[tokio::test]
async fn test_inner_error_rolls_back_its_own_savepoint() {
    let pool = RecordingPool::empty();
    let storage = prepared_storage(pool.clone()).await;

    storage
        .with_transaction(TransactionOptions::new(), |tx| async move {
            tx.with_transaction(TransactionOptions::new(), |_| async { Ok(()) })
                .await?;
            let inner = tx
                .with_transaction(TransactionOptions::new(), |_| async {
                    Err::<(), _>(DbError::InvalidValue("boom".to_string()))
                })
                .await;
            assert!(inner.is_err());
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(
        pool.log.transaction_statements(),
        vec![
            "BEGIN",
            "SAVEPOINT savepoint_0",
            "RELEASE SAVEPOINT savepoint_0",
            "SAVEPOINT savepoint_1",
            "ROLLBACK TO SAVEPOINT savepoint_1",
            "COMMIT",
        ]
    );
}

#[tokio::test]
async fn test_atomic_joins_running_transaction() {
    let pool = RecordingPool::empty();
    let storage = prepared_storage(pool.clone()).await;

    storage.atomic(|_| async { Ok(()) }).await.unwrap();
    assert_eq!(pool.log.transaction_statements(), vec!["BEGIN", "COMMIT"]);

    storage
        .with_transaction(TransactionOptions::new(), |tx| async move {
            tx.atomic(|_| async { Ok(()) }).await
        })
        .await
        .unwrap();
    assert_eq!(
        pool.log.transaction_statements(),
        vec!["BEGIN", "COMMIT", "BEGIN", "COMMIT"]
    );
}

// ============================================================================
// Retry Tests
// ============================================================================

#[tokio::test]
async fn test_conflict_retries_whole_transaction() {
    let pool = RecordingPool::new(conflict_on_count);
    let storage = prepared_storage(pool.clone()).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let err = storage
        .with_transaction(TransactionOptions::new().retry(3), |tx| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                count_posts(tx).await
            }
        })
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    let statements = pool.log.transaction_statements();
    assert_eq!(statements.iter().filter(|s| *s == "BEGIN").count(), 4);
    assert_eq!(statements.iter().filter(|s| *s == "ROLLBACK").count(), 4);
    assert!(!statements.iter().any(|s| s.starts_with("SAVEPOINT")));
}

#[tokio::test]
async fn test_pinned_connection_lost_on_rollback_is_not_retried() {
    let pool = RecordingPool::new(|text| {
        if text == "ROLLBACK" {
            Err(DbError::ConnectionError("gone".to_string()))
        } else {
            conflict_on_count(text)
        }
    });
    let storage = prepared_storage(pool.clone()).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let err = storage
        .with_connection(|conn| {
            let attempts = attempts.clone();
            async move {
                conn.with_transaction(TransactionOptions::new().retry(3), |tx| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        count_posts(tx).await
                    }
                })
                .await
            }
        })
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let statements = pool.log.transaction_statements();
    assert_eq!(statements.iter().filter(|s| *s == "BEGIN").count(), 1);
}

#[tokio::test]
async fn test_no_retry_by_default() {
    let pool = RecordingPool::new(conflict_on_count);
    let storage = prepared_storage(pool.clone()).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let err = storage
        .with_transaction(TransactionOptions::new(), |tx| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                count_posts(tx).await
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::SerializationConflict(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_other_errors_are_not_retried() {
    let pool = RecordingPool::new(|text| {
        if text.starts_with("SELECT to_jsonb(COUNT(*))") {
            Err(DbError::from_sqlstate("23505", "duplicate key"))
        } else {
            Ok(Vec::new())
        }
    });
    let storage = prepared_storage(pool.clone()).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let err = storage
        .with_transaction(TransactionOptions::new().retry(5), |tx| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                count_posts(tx).await
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Database { .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_nested_conflict_is_not_retried() {
    let pool = RecordingPool::new(conflict_on_count);
    let storage = prepared_storage(pool.clone()).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let err = storage
        .with_transaction(TransactionOptions::new(), |tx| {
            let attempts = attempts.clone();
            async move {
                tx.with_transaction(TransactionOptions::new().retry(3), |inner| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        count_posts(inner).await
                    }
                })
                .await
            }
        })
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(
        pool.log.transaction_statements(),
        vec![
            "BEGIN",
            "SAVEPOINT savepoint_0",
            "ROLLBACK TO SAVEPOINT savepoint_0",
            "ROLLBACK",
        ]
    );
}

// ============================================================================
// Select Lock Tests
// ============================================================================

#[tokio::test]
async fn test_repeatable_read_locks_selected_rows() {
    let pool = RecordingPool::empty();
    let storage = prepared_storage(pool.clone()).await;

    touch_post(storage.clone()).await.unwrap();
    storage
        .with_transaction(
            TransactionOptions::new().mode(IsolationLevel::RepeatableRead),
            |tx| async move {
                assert!(tx.select_lock().await);
                tx.with_transaction(
                    TransactionOptions::new().mode(IsolationLevel::ReadCommitted),
                    |inner| async move {
                        assert!(inner.select_lock().await);
                        touch_post(inner).await
                    },
                )
                .await
            },
        )
        .await
        .unwrap();

    let updates: Vec<String> = pool
        .log
        .statements()
        .into_iter()
        .filter(|s| s.contains("UPDATE \"Post\""))
        .collect();
    assert_eq!(updates.len(), 2);
    assert!(!updates[0].contains("FOR UPDATE"));
    assert!(updates[1].contains("FOR UPDATE OF \"Post\""));
    assert_eq!(
        pool.log.transaction_statements()[0],
        "BEGIN ISOLATION LEVEL REPEATABLE READ"
    );
}

#[tokio::test]
async fn test_with_connection_pins_one_connection() {
    let pool = RecordingPool::empty();
    let storage = prepared_storage(pool.clone()).await;

    storage
        .with_connection(|conn| async move {
            assert!(!conn.in_transaction().await);
            touch_post(conn.clone()).await?;
            touch_post(conn).await
        })
        .await
        .unwrap();

    assert_eq!(pool.acquired(), 2);
    assert!(pool.log.transaction_statements().is_empty());
}
