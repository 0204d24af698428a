//! Error types for rsql

use std::fmt;
use thiserror::Error;

/// An error reported by the database server in its error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Five-character SQLSTATE code (e.g. `40001`)
    pub code: String,
    /// Primary human-readable message
    pub message: String,
    /// Severity as reported by the server (`ERROR`, `FATAL`, ...)
    pub severity: Option<String>,
    /// Optional secondary message
    pub detail: Option<String>,
    /// Optional suggestion from the server
    pub hint: Option<String>,
}

impl ServerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity: None,
            detail: None,
            hint: None,
        }
    }

    /// SQLSTATE class, i.e. the first two characters of the code
    pub fn class(&self) -> &str {
        self.code.get(..2).unwrap_or(&self.code)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (SQLSTATE {})", self.message, self.code)?;
        if let Some(detail) = self.detail.as_deref().filter(|d| !d.trim().is_empty()) {
            write!(f, " (detail: {})", detail)?;
        }
        if let Some(hint) = self.hint.as_deref().filter(|h| !h.trim().is_empty()) {
            write!(f, " (hint: {})", hint)?;
        }
        Ok(())
    }
}

/// Core error type for rsql operations
#[derive(Error, Debug)]
pub enum SqlError {
    /// The connection to the server was lost.
    ///
    /// Returned once per loss by `query`/`exec`; the next call reconnects.
    /// Wraps the error that revealed the loss.
    #[error("connection closed: {0}")]
    ConnectionClosed(#[source] Box<SqlError>),

    /// Driver sentinel: the underlying connection can no longer be used
    #[error("driver: bad connection")]
    BadConnection,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error response from the server
    #[error("{0}")]
    Server(ServerError),

    /// Failure to establish a connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Client-side query failure (encoding, decoding, ...)
    #[error("Query error: {0}")]
    Query(String),

    /// Opaque driver error; its `source()` chain is still inspected
    #[error("Driver error: {0}")]
    Driver(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The connection was closed by the caller and cannot be used again
    #[error("connection is closed")]
    Closed,

    /// A transaction-bound handle was used after its attempt ended
    #[error("transaction attempt has already finished")]
    TxnDone,

    /// The transaction kept hitting serialization conflicts
    #[error("transaction gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<SqlError>,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("no rows in result set")]
    NoRows,
}

impl SqlError {
    /// Wrap `cause` as a connection-closed error unless it already is one.
    pub fn connection_closed(cause: SqlError) -> Self {
        match cause {
            SqlError::ConnectionClosed(_) => cause,
            other => SqlError::ConnectionClosed(Box::new(other)),
        }
    }

    /// Check whether this is the stable connection-closed signal
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, SqlError::ConnectionClosed(_))
    }

    /// SQLSTATE code if the server reported this error
    pub fn server_code(&self) -> Option<&str> {
        match self {
            SqlError::Server(e) => Some(&e.code),
            _ => None,
        }
    }
}

impl From<ServerError> for SqlError {
    fn from(err: ServerError) -> Self {
        SqlError::Server(err)
    }
}

/// Result type alias for rsql operations
pub type Result<T> = std::result::Result<T, SqlError>;
