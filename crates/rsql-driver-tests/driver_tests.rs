//! PostgreSQL driver tests
//!
//! Exercise `PostgresDriver` directly: value decoding, parameter coercion,
//! TLS negotiation and the error shapes the connection layer classifies.

use crate::fixtures::terminate_backend;
use crate::test_containers::PostgresServer;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use rsql_connection::{ErrorClass, classify};
use rsql_core::{Driver, SqlError, Value};
use rsql_driver_postgres::PostgresDriver;
use rstest::rstest;
use std::time::Duration;

/// Values come back as the matching `Value` variant, numerics keep their scale
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_decodes_server_types() -> Result<()> {
    let server = PostgresServer::start().await?;
    let conn = PostgresDriver::new().connect(&server.info().endpoint()?).await?;

    let result = conn
        .query(
            "SELECT 7::int2, 42::int4, 9000000000::int8, 12.50::numeric, -0.000012::numeric, \
             'hello'::text, true, DATE '2024-02-29', NULL::text",
            &[],
        )
        .await
        .context("failed to select literals")?;
    let row = result.rows.first().context("no row returned")?;

    assert_eq!(
        row.values,
        vec![
            Value::Int16(7),
            Value::Int32(42),
            Value::Int64(9_000_000_000),
            Value::Decimal("12.50".to_string()),
            Value::Decimal("-0.000012".to_string()),
            Value::String("hello".to_string()),
            Value::Bool(true),
            Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).context("bad date")?),
            Value::Null,
        ]
    );
    conn.close().await?;
    Ok(())
}

/// Parameters are coerced to the types the server inferred for the statement
#[rstest]
#[case::int_narrowing(Value::Int64(41), "SELECT $1::int4 + 1", Value::Int32(42))]
#[case::text_to_int(Value::String("41".into()), "SELECT $1::int8 + 1", Value::Int64(42))]
#[case::text_to_bool(Value::String("true".into()), "SELECT NOT $1::bool", Value::Bool(false))]
#[case::null(Value::Null, "SELECT $1::text IS NULL", Value::Bool(true))]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_coerces_parameters(
    #[case] param: Value,
    #[case] sql: &str,
    #[case] expected: Value,
) -> Result<()> {
    let server = PostgresServer::start().await?;
    let conn = PostgresDriver::new().connect(&server.info().endpoint()?).await?;

    let result = conn.query(sql, &[param]).await.context("parameterized query failed")?;
    let value = result.rows.first().and_then(|row| row.get(0)).cloned();
    assert_eq!(value, Some(expected));
    Ok(())
}

/// `prefer` falls back to plaintext against a server without TLS
#[rstest]
#[case::disable("disable")]
#[case::allow("allow")]
#[case::prefer("prefer")]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_connects_without_server_tls(#[case] sslmode: &str) -> Result<()> {
    let server = PostgresServer::start().await?;
    let endpoint = server.info().endpoint_with_sslmode(sslmode)?;

    let conn = PostgresDriver::new()
        .connect(&endpoint)
        .await
        .with_context(|| format!("connect with sslmode={} failed", sslmode))?;
    conn.query("SELECT 1", &[]).await?;
    Ok(())
}

#[rstest]
#[case::require("require")]
#[case::verify_full("verify-full")]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_required_tls_is_refused(#[case] sslmode: &str) -> Result<()> {
    let server = PostgresServer::start().await?;
    let endpoint = server.info().endpoint_with_sslmode(sslmode)?;

    let result = PostgresDriver::new().connect(&endpoint).await;
    assert!(result.is_err(), "sslmode={} must not fall back to plaintext", sslmode);
    Ok(())
}

/// Statement errors carry their SQLSTATE and leave the session usable
#[rstest]
#[case::syntax("SELEC 1", "42601")]
#[case::undefined_table("SELECT * FROM no_such_table", "42P01")]
#[case::division_by_zero("SELECT 1 / 0", "22012")]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_statement_errors_are_server_errors(#[case] sql: &str, #[case] code: &str) -> Result<()> {
    let server = PostgresServer::start().await?;
    let conn = PostgresDriver::new().connect(&server.info().endpoint()?).await?;

    let err = conn.query(sql, &[]).await.err().context("statement should fail")?;
    assert_eq!(err.server_code(), Some(code));
    assert_eq!(classify(&err), ErrorClass::Other);

    assert!(!conn.is_closed());
    conn.query("SELECT 1", &[]).await.context("session unusable after error")?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_terminated_backend_classifies_as_closed() -> Result<()> {
    let server = PostgresServer::start().await?;
    let conn = PostgresDriver::new().connect(&server.info().endpoint()?).await?;

    let pid = conn
        .query("SELECT pg_backend_pid()", &[])
        .await?
        .rows
        .first()
        .and_then(|row| row.get(0))
        .and_then(Value::as_i64)
        .context("no backend pid")?;
    terminate_backend(server.info(), pid).await?;

    let err = conn
        .query("SELECT 1", &[])
        .await
        .err()
        .context("query on a terminated session should fail")?;
    assert_eq!(classify(&err), ErrorClass::ConnectionClosed, "got {:?}", err);
    Ok(())
}

/// The cancel request negotiates TLS the way its session did
#[rstest]
#[case::plaintext("disable")]
#[case::tls_connector("prefer")]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_cancel_handle_interrupts_query(#[case] sslmode: &str) -> Result<()> {
    let server = PostgresServer::start().await?;
    let endpoint = server.info().endpoint_with_sslmode(sslmode)?;
    let conn = PostgresDriver::new().connect(&endpoint).await?;
    let cancel = conn.cancel_handle().context("postgres supports cancellation")?;

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let err = conn
        .query("SELECT pg_sleep(30)", &[])
        .await
        .err()
        .context("cancelled query should fail")?;
    canceller.await?;

    assert!(matches!(&err, SqlError::Server(e) if e.code == "57014"), "got {:?}", err);
    conn.query("SELECT 1", &[]).await.context("session unusable after cancel")?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_close_marks_connection_closed() -> Result<()> {
    let server = PostgresServer::start().await?;
    let conn = PostgresDriver::new().connect(&server.info().endpoint()?).await?;

    conn.close().await?;
    assert!(conn.is_closed());

    let err = conn.query("SELECT 1", &[]).await.err().context("query after close")?;
    assert_eq!(classify(&err), ErrorClass::ConnectionClosed);
    Ok(())
}
