//! Mapping of `tokio_postgres::Error` into `SqlError` shapes

use rsql_core::{ServerError, SqlError};
use std::error::Error as StdError;
use std::io;

/// Convert a driver error into the shape the connection layer classifies.
///
/// - server error responses keep their SQLSTATE, message, detail and hint
/// - a client whose connection task has ended maps to `SqlError::BadConnection`
/// - a socket failure anywhere in the source chain maps to `SqlError::Io`
/// - anything else is kept as an opaque `SqlError::Driver`
pub fn map_postgres_error(err: tokio_postgres::Error) -> SqlError {
    if let Some(db_error) = err.as_db_error() {
        return SqlError::Server(ServerError {
            code: db_error.code().code().to_string(),
            message: db_error.message().to_string(),
            severity: Some(db_error.severity().to_string()),
            detail: db_error.detail().map(str::to_string),
            hint: db_error.hint().map(str::to_string),
        });
    }

    if err.is_closed() {
        tracing::debug!(error = %err, "postgres client reports closed connection");
        return SqlError::BadConnection;
    }

    if let Some(kind) = io_error_kind(&err) {
        return SqlError::Io(io::Error::new(kind, err.to_string()));
    }

    SqlError::Driver(Box::new(err))
}

/// Find the first `io::Error` in the source chain and return its kind
fn io_error_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current = err.source();
    while let Some(cause) = current {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        current = cause.source();
    }
    None
}
