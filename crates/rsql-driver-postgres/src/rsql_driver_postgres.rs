//! PostgreSQL driver implementation
//!
//! Wraps `tokio-postgres` behind the `rsql_core::Driver` seam. Driver errors
//! are mapped into the `SqlError` shapes the connection layer classifies:
//! server error responses keep their SQLSTATE, a closed client becomes the
//! bad-connection sentinel, and socket failures surface as I/O errors.

mod connection;
mod driver;
mod error;
mod tls;
mod values;

pub use connection::{PostgresCancelHandle, PostgresConnection};
pub use driver::PostgresDriver;
pub use error::map_postgres_error;
pub use tls::{TlsError, TlsMode, TlsSettings};
