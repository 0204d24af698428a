//! rsql Connection - resilient client connection to a SQL server
//!
//! `Conn` owns at most one driver connection and rebuilds it lazily after
//! the server goes away. A lost connection is reported exactly once as
//! `SqlError::ConnectionClosed`; the next call reconnects, to the endpoint
//! most recently set with `Conn::set_url`. `Conn::exec_txn` re-runs a
//! transaction body whenever the server aborts it with a serialization
//! failure (SQLSTATE `40001`).
//!
//! # Example
//!
//! ```ignore
//! use rsql_connection::Conn;
//! use rsql_driver_postgres::PostgresDriver;
//!
//! let conn = Conn::new(PostgresDriver::new(), "postgresql://root@localhost:26257/bank".parse()?);
//!
//! let n = conn
//!     .exec_txn(|tx| Box::pin(async move {
//!         tx.exec("UPDATE accounts SET balance = balance - 10 WHERE id = 1", &[]).await?;
//!         tx.exec("UPDATE accounts SET balance = balance + 10 WHERE id = 2", &[]).await
//!     }))
//!     .await?;
//! ```

mod backoff;
mod classify;
mod config;
mod conn;

pub use backoff::BackoffStrategy;
pub use classify::{ErrorClass, classify};
pub use config::{ConfigError, ConnConfig, TxnRetryConfig};
pub use conn::{Conn, TxBoundConn};
pub use rsql_core::{Endpoint, Result, SqlError};
