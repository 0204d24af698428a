//! Shared helpers for the integration tests: logging, connection builders
//! and a retry helper for conditions that only become true eventually.
//!
//! # Usage
//!
//! ```rust,ignore
//! use rsql_driver_tests::fixtures::{succeeds_soon, test_conn};
//! use rsql_driver_tests::test_containers::PostgresServer;
//!
//! let server = PostgresServer::start().await?;
//! let conn = test_conn(&server)?;
//! succeeds_soon("server answers", || async { Ok(conn.query("SELECT 1", &[]).await?) }).await?;
//! ```

use anyhow::{Context, Result};
use rsql_connection::{Conn, ConnConfig};
use rsql_core::{Driver, Value};
use rsql_driver_postgres::PostgresDriver;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::test_containers::{ContainerInfo, PostgresServer};

/// How long `succeeds_soon` keeps trying
pub const SUCCEEDS_SOON: Duration = Duration::from_secs(45);

/// A `Conn` to `server` with the default configuration.
///
/// Nothing is connected until the first operation.
pub fn test_conn(server: &PostgresServer) -> Result<Conn> {
    test_conn_with(server, ConnConfig::default())
}

/// A `Conn` to `server` with `config`
pub fn test_conn_with(server: &PostgresServer, config: ConnConfig) -> Result<Conn> {
    initialize_logging();
    let driver = PostgresDriver::new().with_application_name("rsql-driver-tests");
    Ok(Conn::with_config(driver, server.info().endpoint()?, config))
}

/// Run `f` until it succeeds, sleeping between attempts, and fail with the
/// last error once `SUCCEEDS_SOON` has passed.
pub async fn succeeds_soon<T, F, Fut>(what: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + SUCCEEDS_SOON;
    let mut tries = 0u32;
    loop {
        tries += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if Instant::now() < deadline => {
                tracing::debug!(what, tries, error = %e, "not yet");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => return Err(e.context(format!("{} did not succeed after {} tries", what, tries))),
        }
    }
}

/// Server process id of the session behind `conn`
pub async fn backend_pid(conn: &Conn) -> Result<i64> {
    let value = conn
        .server_value("backend pid", "SELECT pg_backend_pid()")
        .await
        .context("failed to query backend pid")?;
    value.as_i64().context("backend pid is not an integer")
}

/// Kill the session `pid` from a separate admin connection, the way an
/// operator (or a failover) would.
pub async fn terminate_backend(info: &ContainerInfo, pid: i64) -> Result<()> {
    let admin = PostgresDriver::new()
        .connect(&info.endpoint()?)
        .await
        .context("failed to open admin connection")?;

    let result = admin
        .query("SELECT pg_terminate_backend($1)", &[Value::Int64(pid)])
        .await
        .context("pg_terminate_backend failed")?;
    let terminated = result
        .rows
        .first()
        .and_then(|row| row.get(0))
        .and_then(Value::as_bool);
    admin.close().await.ok();

    anyhow::ensure!(terminated == Some(true), "backend {} was not terminated", pid);
    tracing::info!(pid, "backend terminated");
    Ok(())
}

/// Initialize test logging
fn initialize_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "rsql_connection=debug,rsql_driver_postgres=debug,rsql_driver_tests=debug".into()),
            )
            .with_test_writer()
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
