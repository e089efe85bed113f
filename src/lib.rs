pub mod agent;
pub mod collector;
pub mod config;
pub mod deadlock;
pub mod emit;
pub mod error;
pub mod event;
pub mod intercept;
pub mod logging;
pub mod monitor;
pub mod registry;
pub mod sql;

pub use agent::{AgentCore, DbAgent};
pub use collector::{MetricsCollector, SubmitResult};
pub use config::{AgentConfig, CollectorKind};
pub use deadlock::{Cycle, DeadlockDetector, DetectorHandle, LockEvent, WaitForGraph};
pub use emit::{CompositeSink, Delivery, HttpSink, Sink, StdoutSink, STDOUT_EVENT_TAG};
pub use error::{AgentError, Result};
pub use event::{DbEvent, QueryEventBody, QueryStatus, SequencedEvent, TxOutcome};
pub use intercept::{
    BoxedDriverConnection, ConnectionIdentity, DriverConnection, DriverError, DriverResult,
    DriverResultSet, DriverStatement, ExecOutcome, MonitoredConnection, MonitoredResultSet,
    MonitoredStatement, ParamValue, WrapFn, WrapperRegistry,
};
pub use logging::init_logging;
pub use registry::{
    AutoCommitTransition, CompletedTx, LongTxReport, QueryRecord, TransactionContext,
    TransactionRegistry, TxSnapshot, TxStatus,
};
pub use sql::{
    classify_db_error, mask_sql, statement_kind, statement_targets, DbErrorKind, LockMode,
    StatementKind,
};
