//! Resilient connection with lazy reconnect
//!
//! Every operation takes the slot lock, makes sure a live driver connection
//! exists (connecting or reconnecting if needed) and runs its statement. A
//! failure that means the connection is gone marks the handle dead and is
//! reported as `SqlError::ConnectionClosed`; the next operation reconnects.
//! Statements that fail mid-flight are never re-sent.

mod handle;
mod txn;


use parking_lot::RwLock;
use rsql_core::{Driver, DriverConnection, Endpoint, QueryResult, Result, Row, SqlError, Value};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::MutexGuard;

use crate::ConnConfig;
use crate::classify::{ErrorClass, classify};
use handle::{CancelSlot, HandleSlot};

pub use txn::TxBoundConn;

/// A client connection that survives server restarts.
///
/// Created without connecting; the first operation connects. Operations are
/// serialized: each holds the connection for its whole duration, and
/// `exec_txn` holds it across all attempts.
///
/// # Example
///
/// ```ignore
/// let conn = Conn::new(PostgresDriver::new(), url.parse()?);
///
/// match conn.query("SELECT 1", &[]).await {
///     Err(e) if e.is_connection_closed() => { /* next call reconnects */ }
///     other => { other?; }
/// }
/// ```
pub struct Conn {
    driver: Arc<dyn Driver>,
    endpoint: RwLock<Endpoint>,
    slot: tokio::sync::Mutex<HandleSlot>,
    cancel: CancelSlot,
    closed: AtomicBool,
    config: ConnConfig,
}

impl Conn {
    pub fn new(driver: impl Driver, endpoint: Endpoint) -> Self {
        Self::with_config(driver, endpoint, ConnConfig::default())
    }

    pub fn with_config(driver: impl Driver, endpoint: Endpoint, config: ConnConfig) -> Self {
        let cancel = CancelSlot::default();
        Self {
            driver: Arc::new(driver),
            endpoint: RwLock::new(endpoint),
            slot: tokio::sync::Mutex::new(HandleSlot::new(Arc::clone(&cancel))),
            cancel,
            closed: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// The endpoint the next (re)connect will use
    pub fn url(&self) -> Endpoint {
        self.endpoint.read().clone()
    }

    /// Replace the endpoint. An open connection is kept; the new endpoint
    /// is used at the next reconnect. Never waits for a running operation.
    pub fn set_url(&self, endpoint: Endpoint) {
        tracing::debug!(endpoint = %endpoint, "connection URL updated");
        *self.endpoint.write() = endpoint;
    }

    /// Point the next reconnect at another database
    pub fn set_current_database(&self, database: &str) {
        let mut endpoint = self.endpoint.write();
        *endpoint = endpoint.with_database(database);
    }

    /// Use `password` unless the URL already carries one
    pub fn set_missing_password(&self, password: &str) -> Result<()> {
        let mut endpoint = self.endpoint.write();
        if !endpoint.has_password() {
            *endpoint = endpoint.with_password(password)?;
        }
        Ok(())
    }

    /// Connect now if not already connected
    pub async fn ensure_conn(&self) -> Result<()> {
        let mut slot = self.lock_slot().await?;
        self.live(&mut slot).await.map(|_| ())
    }

    /// Run a statement that returns rows
    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let mut slot = self.lock_slot().await?;
        let conn = self.live(&mut slot).await?;
        let result = bounded(&conn, self.config.statement_timeout(), conn.query(sql, params)).await;
        note_failure(&mut slot, result)
    }

    /// Run a statement and return the number of affected rows
    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    pub async fn exec(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut slot = self.lock_slot().await?;
        let conn = self.live(&mut slot).await?;
        let result = bounded(&conn, self.config.statement_timeout(), conn.execute(sql, params)).await;
        note_failure(&mut slot, result)
    }

    /// First row of a query, or `SqlError::NoRows`
    pub async fn query_row(&self, sql: &str, params: &[Value]) -> Result<Row> {
        self.query(sql, params)
            .await?
            .into_first_row()
            .ok_or(SqlError::NoRows)
    }

    /// A single value from the server; `what` names it in logs
    pub async fn server_value(&self, what: &str, sql: &str) -> Result<Value> {
        let row = self.query_row(sql, &[]).await.inspect_err(|e| {
            tracing::warn!(what, error = %e, "unable to retrieve server value");
        })?;
        let value = row.values.into_iter().next().ok_or_else(|| {
            SqlError::Query(format!("{} query returned no columns", what))
        })?;
        tracing::debug!(what, value = %value, "retrieved server value");
        Ok(value)
    }

    pub async fn server_version(&self) -> Result<String> {
        match self.server_value("version", "SHOW server_version").await? {
            Value::String(version) => Ok(version),
            other => Ok(other.to_string()),
        }
    }

    /// Ask the server to cancel the statement running on this connection.
    ///
    /// Returns `false` when there is no live connection to cancel on.
    pub fn cancel(&self) -> bool {
        let handle = self.cancel.lock().clone();
        match handle {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Close the connection for good. Later operations fail with
    /// `SqlError::Closed`; closing again is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!("closing connection");
        self.slot.lock().await.teardown().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn lock_slot(&self) -> Result<MutexGuard<'_, HandleSlot>> {
        let slot = self.slot.lock().await;
        if self.is_closed() {
            return Err(SqlError::Closed);
        }
        Ok(slot)
    }

    async fn live(&self, slot: &mut HandleSlot) -> Result<Arc<dyn DriverConnection>> {
        let endpoint = self.url();
        slot.ensure_live(self.driver.as_ref(), &endpoint).await
    }
}

/// Turn a connection-level failure into `ConnectionClosed`, marking the
/// handle dead. Other errors pass through unchanged.
fn note_failure<T>(slot: &mut HandleSlot, result: Result<T>) -> Result<T> {
    result.map_err(|err| match classify(&err) {
        ErrorClass::ConnectionClosed => {
            slot.mark_dead();
            SqlError::connection_closed(err)
        }
        ErrorClass::SerializationRetry | ErrorClass::Other => err,
    })
}

/// Run one statement, bounded by `timeout` if set.
///
/// On expiry the statement future is dropped, the server is asked to cancel
/// it and `SqlError::Timeout` is returned. The connection stays usable.
async fn bounded<T>(
    conn: &Arc<dyn DriverConnection>,
    timeout: Option<Duration>,
    statement: impl Future<Output = Result<T>>,
) -> Result<T> {
    let Some(limit) = timeout else {
        return statement.await;
    };
    match tokio::time::timeout(limit, statement).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(timeout_ms = limit.as_millis() as u64, "statement timed out");
            if let Some(handle) = conn.cancel_handle() {
                handle.cancel();
            }
            Err(SqlError::Timeout(format!(
                "statement exceeded {}ms",
                limit.as_millis()
            )))
        }
    }
}
