//! Abstract connection capability set
//!
//! The driver wrapper hierarchy of the host platform collapses to
//! these traits. A registered wrap function receives something that
//! speaks `DriverConnection` and returns the monitored wrapper; the
//! core never probes driver internals.

use thiserror::Error;

/// Error surfaced by the underlying driver.
///
/// Carried through the interception layer untouched: the host
/// application sees exactly this value. The agent only reads it to
/// classify and emit.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct DriverError {
    /// Vendor error code (e.g. MySQL 1213).
    pub code: Option<i64>,
    /// SQLSTATE (e.g. PostgreSQL "40P01").
    pub sqlstate: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            sqlstate: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_sqlstate(mut self, sqlstate: &str) -> Self {
        self.sqlstate = Some(sqlstate.to_string());
        self
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// A value bound to a prepared statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Result of executing a statement
pub enum ExecOutcome {
    /// Mutation: number of affected rows.
    RowsAffected(u64),
    /// Query: a row cursor. Row count is known once it is closed.
    ResultSet(Box<dyn DriverResultSet>),
}

impl std::fmt::Debug for ExecOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecOutcome::RowsAffected(n) => f.debug_tuple("RowsAffected").field(n).finish(),
            ExecOutcome::ResultSet(_) => f.debug_tuple("ResultSet").field(&"..").finish(),
        }
    }
}

/// One database session
pub trait DriverConnection: Send {
    fn set_auto_commit(&mut self, auto_commit: bool) -> DriverResult<()>;

    fn commit(&mut self) -> DriverResult<()>;

    fn rollback(&mut self) -> DriverResult<()>;

    fn close(&mut self) -> DriverResult<()>;

    /// Statement factory. The SQL text is captured here, at creation
    /// time; this is the only place the core ever sees it.
    fn prepare(&mut self, sql: &str) -> DriverResult<Box<dyn DriverStatement>>;
}

/// One prepared statement
pub trait DriverStatement: Send {
    /// Bind a parameter at the given 1-based index.
    fn bind(&mut self, index: usize, value: ParamValue) -> DriverResult<()>;

    fn execute(&mut self) -> DriverResult<ExecOutcome>;
}

/// A forward-only row cursor
pub trait DriverResultSet: Send {
    /// Advance to the next row; false once exhausted.
    fn next_row(&mut self) -> DriverResult<bool>;

    fn close(&mut self) -> DriverResult<()>;
}

impl DriverConnection for Box<dyn DriverConnection> {
    fn set_auto_commit(&mut self, auto_commit: bool) -> DriverResult<()> {
        (**self).set_auto_commit(auto_commit)
    }

    fn commit(&mut self) -> DriverResult<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> DriverResult<()> {
        (**self).rollback()
    }

    fn close(&mut self) -> DriverResult<()> {
        (**self).close()
    }

    fn prepare(&mut self, sql: &str) -> DriverResult<Box<dyn DriverStatement>> {
        (**self).prepare(sql)
    }
}

impl DriverStatement for Box<dyn DriverStatement> {
    fn bind(&mut self, index: usize, value: ParamValue) -> DriverResult<()> {
        (**self).bind(index, value)
    }

    fn execute(&mut self) -> DriverResult<ExecOutcome> {
        (**self).execute()
    }
}

impl DriverResultSet for Box<dyn DriverResultSet> {
    fn next_row(&mut self) -> DriverResult<bool> {
        (**self).next_row()
    }

    fn close(&mut self) -> DriverResult<()> {
        (**self).close()
    }
}
