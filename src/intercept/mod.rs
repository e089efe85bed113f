//! Driver interception layer
//!
//! Wraps observed connections, statements, and result cursors so
//! every query, transaction boundary, and error is seen exactly once,
//! without changing what the host application observes.

mod connection;
mod identity;
mod registration;
mod statement;
mod traits;

pub use connection::MonitoredConnection;
pub use identity::ConnectionIdentity;
pub use registration::{BoxedDriverConnection, WrapFn, WrapperRegistry};
pub use statement::{MonitoredResultSet, MonitoredStatement};
pub use traits::{
    DriverConnection, DriverError, DriverResult, DriverResultSet, DriverStatement, ExecOutcome,
    ParamValue,
};
