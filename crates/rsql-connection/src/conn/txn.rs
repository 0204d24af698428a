//! Transactions re-run on serialization failures

use futures::future::BoxFuture;
use rsql_core::{DriverConnection, QueryResult, Result, Row, SqlError, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::handle::HandleSlot;
use super::{Conn, bounded};
use crate::classify::{ErrorClass, classify};

/// Connection handed to an `exec_txn` body for one attempt.
///
/// Statements run inside that attempt's transaction. Once the attempt is
/// over, every call fails with `SqlError::TxnDone`.
#[derive(Clone)]
pub struct TxBoundConn {
    conn: Arc<dyn DriverConnection>,
    active: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl TxBoundConn {
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.ensure_active()?;
        bounded(&self.conn, self.timeout, self.conn.query(sql, params)).await
    }

    pub async fn query_row(&self, sql: &str, params: &[Value]) -> Result<Row> {
        self.query(sql, params)
            .await?
            .into_first_row()
            .ok_or(SqlError::NoRows)
    }

    pub async fn exec(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_active()?;
        bounded(&self.conn, self.timeout, self.conn.execute(sql, params)).await
    }

    fn ensure_active(&self) -> Result<()> {
        if self.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SqlError::TxnDone)
        }
    }
}

impl Conn {
    /// Run `body` in a transaction, re-running it from the start each time
    /// the server aborts the transaction with a serialization failure.
    ///
    /// `body` may run many times and must not have side effects outside the
    /// transaction. A lost connection is returned as
    /// `SqlError::ConnectionClosed` without retrying, since the outcome of
    /// an interrupted commit is unknown. Any other error rolls the
    /// transaction back and is returned unchanged.
    ///
    /// Dropping the returned future abandons the open transaction. Nothing
    /// more is sent on that connection: the next operation replaces it.
    ///
    /// Attempts are unlimited unless `TxnRetryConfig::max_attempts` is set,
    /// in which case `SqlError::RetriesExhausted` ends the loop.
    #[tracing::instrument(skip_all)]
    pub async fn exec_txn<'a, T, F>(&self, mut body: F) -> Result<T>
    where
        F: FnMut(TxBoundConn) -> BoxFuture<'a, Result<T>>,
    {
        let mut slot = self.lock_slot().await?;
        let retry = &self.config.txn;
        let backoff = retry.backoff();
        let timeout = self.config.statement_timeout();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let conn = self.live(&mut slot).await?;
            tracing::debug!(attempt, "starting transaction attempt");

            // Stays set if this future is dropped mid-attempt, so the next
            // operation rebuilds the connection instead of joining the
            // abandoned transaction.
            slot.begin_txn();
            let err = match self.run_attempt(&conn, &mut body).await {
                Ok(value) => {
                    slot.end_txn();
                    tracing::debug!(attempt, "transaction committed");
                    return Ok(value);
                }
                Err(err) => err,
            };

            match classify(&err) {
                ErrorClass::ConnectionClosed => {
                    slot.mark_dead();
                    return Err(SqlError::connection_closed(err));
                }
                ErrorClass::Other => {
                    rollback(&mut slot, &conn, timeout).await;
                    return Err(err);
                }
                ErrorClass::SerializationRetry => {
                    tracing::debug!(attempt, error = %err, "transaction needs retry");
                    rollback(&mut slot, &conn, timeout).await;
                    if !retry.allows(attempt + 1) {
                        tracing::warn!(attempts = attempt, "giving up on transaction");
                        return Err(SqlError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }
                    if let Some(backoff) = &backoff {
                        tokio::time::sleep(backoff.delay_for(attempt - 1)).await;
                    }
                }
            }
        }
    }

    /// BEGIN, the body, COMMIT
    async fn run_attempt<'a, T, F>(&self, conn: &Arc<dyn DriverConnection>, body: &mut F) -> Result<T>
    where
        F: FnMut(TxBoundConn) -> BoxFuture<'a, Result<T>>,
    {
        let timeout = self.config.statement_timeout();
        bounded(conn, timeout, conn.execute("BEGIN", &[])).await?;

        let active = AttemptGuard(Arc::new(AtomicBool::new(true)));
        let tx = TxBoundConn {
            conn: Arc::clone(conn),
            active: Arc::clone(&active.0),
            timeout,
        };
        let outcome = body(tx).await;
        drop(active);
        let value = outcome?;

        bounded(conn, timeout, conn.execute("COMMIT", &[])).await?;
        Ok(value)
    }
}

/// Deactivates the attempt's `TxBoundConn`s when the attempt ends, including
/// when the `exec_txn` future is dropped mid-body
struct AttemptGuard(Arc<AtomicBool>);

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Best-effort ROLLBACK, bounded by the statement timeout. A connection
/// whose rollback fails is left in an unknown transaction state and is
/// marked dead.
async fn rollback(slot: &mut HandleSlot, conn: &Arc<dyn DriverConnection>, timeout: Option<Duration>) {
    match bounded(conn, timeout, conn.execute("ROLLBACK", &[])).await {
        Ok(_) => {
            slot.end_txn();
            tracing::debug!("transaction rolled back");
        }
        Err(err) => {
            tracing::debug!(error = %err, "rollback failed");
            slot.mark_dead();
        }
    }
}
