//! Classification of driver errors by what the caller should do next

use rsql_core::SqlError;
use std::error::Error as StdError;
use std::io;

/// SQLSTATE for `serialization_failure` ("restart transaction")
pub(crate) const SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE codes for an administrator or crash shutdown in progress
const SHUTDOWN_CODES: [&str; 3] = ["57P01", "57P02", "57P03"];

/// What an error means for the connection it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The connection is unusable and must be rebuilt
    ConnectionClosed,
    /// The server aborted the transaction; re-running it may succeed
    SerializationRetry,
    /// Anything else; passed to the caller unchanged
    Other,
}

/// Classify `error`. Pure: no side effects on the error or the connection.
pub fn classify(error: &SqlError) -> ErrorClass {
    match error {
        SqlError::ConnectionClosed(_) | SqlError::BadConnection => ErrorClass::ConnectionClosed,
        SqlError::Io(e) if is_severed(e.kind()) => ErrorClass::ConnectionClosed,
        SqlError::Server(e) if e.code == SERIALIZATION_FAILURE => ErrorClass::SerializationRetry,
        SqlError::Server(e) if e.class() == "08" || SHUTDOWN_CODES.contains(&e.code.as_str()) => {
            ErrorClass::ConnectionClosed
        }
        SqlError::Driver(e) if source_chain_severed(e.as_ref()) => ErrorClass::ConnectionClosed,
        _ => ErrorClass::Other,
    }
}

fn is_severed(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

fn source_chain_severed(error: &(dyn StdError + Send + Sync + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if is_severed(io_err.kind()) {
                return true;
            }
        }
        if let Some(SqlError::BadConnection) = err.downcast_ref::<SqlError>() {
            return true;
        }
        current = err.source();
    }
    false
}
