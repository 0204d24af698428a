//! rsql Core - Shared abstractions for the resilient SQL connection layer
//!
//! This crate provides the types every other rsql crate depends on:
//!
//! - `Driver` / `DriverConnection` - the seam to an off-the-shelf wire driver
//! - `Endpoint` - the connection target a driver connects to
//! - `SqlError` - the error shapes the connection layer classifies
//! - Common types like `Value`, `Row`, `QueryResult`

mod driver;
mod endpoint;
mod error;
mod types;

pub use driver::*;
pub use endpoint::*;
pub use error::*;
pub use types::*;
