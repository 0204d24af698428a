//! Driver and connection traits
//!
//! These traits are the seam between the connection layer and the wire
//! driver. A driver reports failures using the `SqlError` shapes the
//! connection layer knows how to classify.

use crate::{Endpoint, QueryResult, Result, Value};
use async_trait::async_trait;
use std::sync::Arc;

/// Handle for cancelling a running query from any thread.
///
/// Safe to call from any thread and idempotent. If no query is running,
/// this is a no-op.
pub trait QueryCancelHandle: Send + Sync {
    fn cancel(&self);
}

/// A single driver-level connection to one server
#[async_trait]
pub trait DriverConnection: Send + Sync {
    /// Get the driver name (e.g., "postgresql")
    fn driver_name(&self) -> &str;

    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Execute a statement and return the number of affected rows
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// Whether the driver already knows the connection is unusable.
    ///
    /// A `true` here means nothing sent from now on could reach the server.
    fn is_closed(&self) -> bool;

    /// Get a handle that can be used to cancel running queries.
    ///
    /// Returns `None` if the driver does not support query cancellation.
    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        None
    }
}

/// A database driver: knows how to open connections to an endpoint
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Driver identifier (e.g., "postgres")
    fn name(&self) -> &'static str;

    /// Open a new connection to `endpoint`
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn DriverConnection>>;
}

#[async_trait]
impl<T: Driver> Driver for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn DriverConnection>> {
        (**self).connect(endpoint).await
    }
}
