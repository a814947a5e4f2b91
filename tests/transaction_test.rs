//! Integration tests for the transaction scope protocol.

mod common;

use common::{Mock, MockTransport};
use pgtemplate::{Connection, DbError, QueryAssembler, TransactionStatus, sql};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn connection(mock: &Mock) -> Connection<MockTransport> {
    Connection::new(mock.transport(), Arc::new(QueryAssembler::new()))
}

#[derive(Debug)]
enum AppError {
    #[allow(dead_code)]
    Db(DbError),
    Business(String),
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        AppError::Db(e)
    }
}

#[derive(Debug, Deserialize, PartialEq)]
struct Student {
    id: i64,
    full_name: String,
}

#[tokio::test]
async fn test_transaction_commits_on_success() {
    let mock = Mock::new();
    let mut conn = connection(&mock);

    let gpa = 3.5;
    let id = 7;
    conn.transaction(async |tx| {
        tx.execute(sql!("UPDATE students SET gpa = " {gpa} " WHERE id = " {id}))
            .await?;
        Ok::<_, DbError>(())
    })
    .await
    .unwrap();

    assert_eq!(
        mock.log(),
        vec!["BEGIN", "UPDATE students SET gpa = $1 WHERE id = $2", "COMMIT"]
    );
}

#[tokio::test]
async fn test_transaction_returns_closure_value() {
    let mock = Mock::new();
    mock.push_rows(vec![json!({"id": 1, "full_name": "Ada"})]);
    let mut conn = connection(&mock);

    let students: Vec<Student> = conn
        .transaction(async |tx| tx.fetch(sql!("SELECT id, full_name FROM students")).await)
        .await
        .unwrap();

    assert_eq!(
        students,
        vec![Student {
            id: 1,
            full_name: "Ada".to_string()
        }]
    );
    assert_eq!(mock.log().last().map(String::as_str), Some("COMMIT"));
}

#[tokio::test]
async fn test_marked_transaction_rolls_back_and_rejects_queries() {
    let mock = Mock::new();
    let mut conn = connection(&mock);

    conn.transaction(async |tx| {
        tx.mark_for_rollback()?;
        assert_eq!(tx.status(), TransactionStatus::MarkedForRollback);

        let result = tx.execute(sql!("DELETE FROM students")).await;
        assert!(matches!(
            result,
            Err(DbError::TransactionClosed {
                status: TransactionStatus::MarkedForRollback
            })
        ));
        Ok::<_, DbError>(())
    })
    .await
    .unwrap();

    assert_eq!(mock.log(), vec!["BEGIN", "ROLLBACK"]);
}

#[tokio::test]
async fn test_error_rolls_back_and_returns_original_error() {
    let mock = Mock::new();
    let mut conn = connection(&mock);

    let result: Result<(), AppError> = conn
        .transaction(async |tx| {
            tx.execute(sql!("INSERT INTO students (full_name) VALUES (" {"Bob"} ")"))
                .await?;
            Err(AppError::Business("grade out of range".to_string()))
        })
        .await;

    match result {
        Err(AppError::Business(message)) => assert_eq!(message, "grade out of range"),
        other => panic!("expected the closure's error, got {other:?}"),
    }
    assert_eq!(
        mock.log(),
        vec!["BEGIN", "INSERT INTO students (full_name) VALUES ($1)", "ROLLBACK"]
    );
}

#[tokio::test]
async fn test_failed_rollback_keeps_original_error() {
    let mock = Mock::new();
    mock.fail_on("ROLLBACK");
    let mut conn = connection(&mock);

    let result: Result<(), AppError> = conn
        .transaction(async |_tx| Err(AppError::Business("boom".to_string())))
        .await;

    assert!(matches!(result, Err(AppError::Business(_))));
    assert_eq!(mock.log(), vec!["BEGIN", "ROLLBACK"]);
}

#[tokio::test]
async fn test_commit_failure_is_reported() {
    let mock = Mock::new();
    mock.fail_on("COMMIT");
    let mut conn = connection(&mock);

    let result = conn
        .transaction(async |_tx| Ok::<_, DbError>(()))
        .await;

    assert!(matches!(result, Err(DbError::Database { .. })));
}

#[tokio::test]
async fn test_explicit_commit_closes_transaction() {
    let mock = Mock::new();
    let mut conn = connection(&mock);

    let mut tx = conn.begin().await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Started);
    tx.commit().await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Committed);

    let result = tx.fetchval::<i64>(sql!("SELECT 1")).await;
    assert!(matches!(
        result,
        Err(DbError::TransactionClosed {
            status: TransactionStatus::Committed
        })
    ));
    assert!(matches!(
        tx.rollback().await,
        Err(DbError::TransactionClosed { .. })
    ));
    assert!(matches!(
        tx.mark_for_rollback(),
        Err(DbError::TransactionClosed { .. })
    ));

    // Closing an already committed transaction sends nothing.
    assert_eq!(tx.close().await.unwrap(), TransactionStatus::Committed);
    assert_eq!(mock.log(), vec!["BEGIN", "COMMIT"]);
}

#[tokio::test]
async fn test_close_after_mark_rolls_back() {
    let mock = Mock::new();
    let mut conn = connection(&mock);

    let mut tx = conn.begin().await.unwrap();
    tx.mark_for_rollback().unwrap();
    assert_eq!(tx.close().await.unwrap(), TransactionStatus::RolledBack);
    assert_eq!(mock.log(), vec!["BEGIN", "ROLLBACK"]);
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back_before_next_operation() {
    let mock = Mock::new();
    let mut conn = connection(&mock);

    {
        let mut tx = conn.begin().await.unwrap();
        tx.execute(sql!("DELETE FROM students WHERE id = " {1}))
            .await
            .unwrap();
    }

    conn.execute(sql!("SELECT 1")).await.unwrap();

    assert_eq!(
        mock.log(),
        vec!["BEGIN", "DELETE FROM students WHERE id = $1", "ROLLBACK", "SELECT 1"]
    );
}

#[tokio::test]
async fn test_cancelled_fetch_leaves_transaction_started() {
    let mock = Mock::new();
    mock.hang_on("SELECT");
    let mut conn = connection(&mock);

    let mut tx = conn.begin().await.unwrap();
    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        tx.fetch::<Student>(sql!("SELECT * FROM students")),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(tx.status(), TransactionStatus::Started);

    assert_eq!(tx.close().await.unwrap(), TransactionStatus::Committed);
    assert_eq!(
        mock.log(),
        vec!["BEGIN", "SELECT * FROM students", "COMMIT"]
    );
}

#[tokio::test]
async fn test_cancelled_cursor_fetch_leaves_transaction_started() {
    let mock = Mock::new();
    mock.hang_on("FETCH");
    let mut conn = connection(&mock);

    let mut tx = conn.begin().await.unwrap();
    {
        let mut cursor = tx
            .cursor::<Student>(sql!("SELECT * FROM students"))
            .await
            .unwrap();
        tokio::select! {
            _ = cursor.fetch(10) => panic!("fetch should not complete"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
    }
    assert_eq!(tx.status(), TransactionStatus::Started);

    tx.mark_for_rollback().unwrap();
    assert_eq!(tx.close().await.unwrap(), TransactionStatus::RolledBack);
    assert_eq!(mock.log().last().map(String::as_str), Some("ROLLBACK"));
}

#[tokio::test]
async fn test_plain_string_rejected_before_transport() {
    let mock = Mock::new();
    let mut conn = connection(&mock);

    let result = conn.execute("DELETE FROM students").await;
    assert!(matches!(result, Err(DbError::UnsupportedInput { .. })));

    let result = conn
        .fetch::<Student>(String::from("SELECT * FROM students"))
        .await;
    assert!(matches!(result, Err(DbError::UnsupportedInput { .. })));

    assert!(mock.log().is_empty());
}

#[tokio::test]
async fn test_plain_string_in_transaction_keeps_it_open() {
    let mock = Mock::new();
    let mut conn = connection(&mock);

    let mut tx = conn.begin().await.unwrap();
    let result = tx.execute("UPDATE students SET gpa = 4").await;
    assert!(matches!(result, Err(DbError::UnsupportedInput { .. })));
    assert_eq!(tx.status(), TransactionStatus::Started);

    assert_eq!(tx.close().await.unwrap(), TransactionStatus::Committed);
    assert_eq!(mock.log(), vec!["BEGIN", "COMMIT"]);
}

#[tokio::test]
async fn test_cursor_on_closed_transaction_fails() {
    let mock = Mock::new();
    let mut conn = connection(&mock);

    let mut tx = conn.begin().await.unwrap();
    tx.mark_for_rollback().unwrap();

    let result = tx.cursor::<Student>(sql!("SELECT * FROM students")).await;
    assert!(matches!(result, Err(DbError::TransactionClosed { .. })));

    tx.close().await.unwrap();
    assert_eq!(mock.log(), vec!["BEGIN", "ROLLBACK"]);
}

#[tokio::test]
async fn test_fetchrow_and_fetchval_through_transaction() {
    let mock = Mock::new();
    mock.push_rows(vec![json!({"id": 3, "full_name": "Grace"})]);
    mock.push_rows(vec![json!({"count": "12"})]);
    mock.push_rows(vec![]);
    let mut conn = connection(&mock);

    let mut tx = conn.begin().await.unwrap();
    let student: Option<Student> = tx
        .fetchrow(sql!("SELECT id, full_name FROM students WHERE id = " {3}))
        .await
        .unwrap();
    let count: i64 = tx
        .fetchval(sql!("SELECT count(*)::text FROM students"))
        .await
        .unwrap();
    let missing: Option<Student> = tx
        .fetchrow(sql!("SELECT id, full_name FROM students WHERE id = " {99}))
        .await
        .unwrap();
    tx.close().await.unwrap();

    assert_eq!(student.map(|s| s.full_name), Some("Grace".to_string()));
    assert_eq!(count, 12);
    assert!(missing.is_none());
}
