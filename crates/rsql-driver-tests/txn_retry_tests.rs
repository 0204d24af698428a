//! Transaction Retry Tests
//!
//! `Conn::exec_txn` against a real server: forced and genuine serialization
//! failures, the attempt ceiling, and errors that must not be retried.

use crate::fixtures::{backend_pid, terminate_backend, test_conn, test_conn_with};
use crate::test_containers::PostgresServer;
use anyhow::{Context, Result};
use pretty_assertions::assert_eq;
use rsql_connection::{Conn, ConnConfig, SqlError, TxnRetryConfig};
use rsql_core::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Barrier;

/// Aborts the current transaction the way a serialization conflict does
const FORCE_RETRY: &str =
    "DO $$ BEGIN RAISE EXCEPTION 'forced retry' USING ERRCODE = '40001'; END $$";

async fn count(conn: &Conn, sql: &str) -> Result<i64> {
    conn.query_row(sql, &[])
        .await?
        .get(0)
        .and_then(Value::as_i64)
        .context("count is not an integer")
}

async fn create_transfers(conn: &Conn) -> Result<()> {
    conn.exec("CREATE TABLE transfers (id serial PRIMARY KEY, note text UNIQUE)", &[])
        .await
        .context("failed to create transfers table")?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_forced_retries_rerun_body() -> Result<()> {
    let server = PostgresServer::start().await?;
    let conn = test_conn(&server)?;
    create_transfers(&conn).await?;

    let tries = Arc::new(AtomicU32::new(0));
    let attempt = conn
        .exec_txn(|tx| {
            let tries = Arc::clone(&tries);
            Box::pin(async move {
                let n = tries.fetch_add(1, Ordering::SeqCst) + 1;
                tx.exec(
                    "INSERT INTO transfers (note) VALUES ($1)",
                    &[Value::String(format!("attempt {}", n))],
                )
                .await?;
                if n <= 2 {
                    tx.exec(FORCE_RETRY, &[]).await?;
                }
                Ok(n)
            })
        })
        .await
        .context("transaction should commit on the third attempt")?;

    assert_eq!(attempt, 3);
    assert!(tries.load(Ordering::SeqCst) > 2);
    // Only the committed attempt's row survives
    assert_eq!(count(&conn, "SELECT count(*) FROM transfers").await?, 1);
    assert_eq!(
        count(&conn, "SELECT count(*) FROM transfers WHERE note = 'attempt 3'").await?,
        1
    );
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_attempt_ceiling_ends_retries() -> Result<()> {
    let server = PostgresServer::start().await?;
    let config = ConnConfig::default().with_txn(TxnRetryConfig::default().with_max_attempts(2));
    let conn = test_conn_with(&server, config)?;
    create_transfers(&conn).await?;

    let tries = Arc::new(AtomicU32::new(0));
    let result = conn
        .exec_txn(|tx| {
            let tries = Arc::clone(&tries);
            Box::pin(async move {
                tries.fetch_add(1, Ordering::SeqCst);
                tx.exec("INSERT INTO transfers (note) VALUES ('never')", &[]).await?;
                tx.exec(FORCE_RETRY, &[]).await
            })
        })
        .await;

    match result {
        Err(SqlError::RetriesExhausted { attempts, last }) => {
            assert_eq!(attempts, 2);
            assert_eq!(last.server_code(), Some("40001"));
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    assert_eq!(tries.load(Ordering::SeqCst), 2);
    assert_eq!(count(&conn, "SELECT count(*) FROM transfers").await?, 0);
    Ok(())
}

/// Two SERIALIZABLE transactions that read each other's writes: the server
/// aborts one of them, which then re-runs and sees the other's commit.
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_write_skew_conflict_is_retried() -> Result<()> {
    let server = PostgresServer::start().await?;
    let setup = test_conn(&server)?;
    setup
        .exec("CREATE TABLE doctors (name text PRIMARY KEY, on_call bool NOT NULL)", &[])
        .await?;
    setup
        .exec("INSERT INTO doctors VALUES ('alice', true), ('bob', true)", &[])
        .await?;

    let barrier = Arc::new(Barrier::new(2));
    let tries = Arc::new(AtomicU32::new(0));

    let go_off_call = |name: &'static str| {
        let conn = test_conn(&server);
        let barrier = Arc::clone(&barrier);
        let tries = Arc::clone(&tries);
        async move {
            let conn = conn?;
            let first = Arc::new(AtomicU32::new(0));
            let went_off = conn
                .exec_txn(|tx| {
                    let barrier = Arc::clone(&barrier);
                    let tries = Arc::clone(&tries);
                    let first = Arc::clone(&first);
                    Box::pin(async move {
                        tries.fetch_add(1, Ordering::SeqCst);
                        tx.exec("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE", &[]).await?;
                        let on_call = tx
                            .query_row("SELECT count(*) FROM doctors WHERE on_call", &[])
                            .await?
                            .get(0)
                            .and_then(Value::as_i64)
                            .unwrap_or(0);
                        // Both first attempts read before either writes
                        if first.fetch_add(1, Ordering::SeqCst) == 0 {
                            barrier.wait().await;
                        }
                        if on_call < 2 {
                            return Ok(false);
                        }
                        tx.exec(
                            "UPDATE doctors SET on_call = false WHERE name = $1",
                            &[Value::String(name.to_string())],
                        )
                        .await?;
                        Ok(true)
                    })
                })
                .await?;
            anyhow::Ok(went_off)
        }
    };

    let (alice, bob) = tokio::try_join!(go_off_call("alice"), go_off_call("bob"))?;

    assert!(alice ^ bob, "exactly one doctor may go off call");
    assert!(tries.load(Ordering::SeqCst) >= 3, "the loser must have retried");
    assert_eq!(count(&setup, "SELECT count(*) FROM doctors WHERE on_call").await?, 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_constraint_violation_is_not_retried() -> Result<()> {
    let server = PostgresServer::start().await?;
    let conn = test_conn(&server)?;
    create_transfers(&conn).await?;
    conn.exec("INSERT INTO transfers (note) VALUES ('taken')", &[]).await?;

    let tries = Arc::new(AtomicU32::new(0));
    let result = conn
        .exec_txn(|tx| {
            let tries = Arc::clone(&tries);
            Box::pin(async move {
                tries.fetch_add(1, Ordering::SeqCst);
                tx.exec("INSERT INTO transfers (note) VALUES ('fresh')", &[]).await?;
                tx.exec("INSERT INTO transfers (note) VALUES ('taken')", &[]).await
            })
        })
        .await;

    let err = result.err().context("duplicate insert should fail")?;
    assert_eq!(err.server_code(), Some("23505"));
    assert_eq!(tries.load(Ordering::SeqCst), 1);
    // Rolled back, and the session is out of the failed transaction
    assert_eq!(count(&conn, "SELECT count(*) FROM transfers").await?, 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_lost_connection_is_not_retried() -> Result<()> {
    let server = PostgresServer::start().await?;
    let conn = test_conn(&server)?;
    create_transfers(&conn).await?;
    let pid = backend_pid(&conn).await?;
    let info = server.info().clone();

    let tries = Arc::new(AtomicU32::new(0));
    let result = conn
        .exec_txn(|tx| {
            let tries = Arc::clone(&tries);
            let info = info.clone();
            Box::pin(async move {
                tries.fetch_add(1, Ordering::SeqCst);
                tx.exec("INSERT INTO transfers (note) VALUES ('lost')", &[]).await?;
                terminate_backend(&info, pid)
                    .await
                    .map_err(|e| SqlError::Query(e.to_string()))?;
                tx.exec("INSERT INTO transfers (note) VALUES ('after')", &[]).await
            })
        })
        .await;

    let err = result.err().context("transaction on a killed session should fail")?;
    assert!(err.is_connection_closed(), "got {:?}", err);
    assert_eq!(tries.load(Ordering::SeqCst), 1);

    // The next call reconnects; nothing from the interrupted attempt committed
    assert_eq!(count(&conn, "SELECT count(*) FROM transfers").await?, 0);
    Ok(())
}
