//! Observable event model
//!
//! The only vocabulary shared between the interceptor, the detectors,
//! and the emitters. Every event is serialized internally tagged with
//! camelCase fields; optional fields are omitted when absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sql::{mask_sql, DbErrorKind, StatementKind};

/// Outcome of an observed query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

/// Terminal state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxOutcome {
    Committed,
    RolledBack,
    Aborted,
    AbortedDeadlock,
}

impl TxOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Aborted => "ABORTED",
            Self::AbortedDeadlock => "ABORTED_DEADLOCK",
        }
    }
}

/// Fields shared by `QueryExecuted` and `SlowQuery`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEventBody {
    pub conn_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    pub sql_fingerprint: String,
    pub kind: StatementKind,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    pub status: QueryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<DbErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param_count: Option<u32>,
}

/// Tagged variant for every observable event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum DbEvent {
    QueryExecuted(QueryEventBody),
    SlowQuery(QueryEventBody),
    TransactionStarted {
        tx_id: String,
        conn_id: String,
    },
    TransactionEnded {
        tx_id: String,
        outcome: TxOutcome,
    },
    LongRunningTransaction {
        tx_id: String,
        age_ms: u64,
        query_count: u64,
    },
    DeadlockDetected {
        participants: Vec<String>,
        resources: Vec<String>,
        victim: String,
    },
    ConnectionPoolSample {
        active: u64,
        idle: u64,
        max: u64,
    },
    TpsSample {
        window_ms: u64,
        count: u64,
        qps: f64,
    },
    DropSummary {
        dropped: u64,
    },
}

impl DbEvent {
    /// Variant tag, as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueryExecuted(_) => "QueryExecuted",
            Self::SlowQuery(_) => "SlowQuery",
            Self::TransactionStarted { .. } => "TransactionStarted",
            Self::TransactionEnded { .. } => "TransactionEnded",
            Self::LongRunningTransaction { .. } => "LongRunningTransaction",
            Self::DeadlockDetected { .. } => "DeadlockDetected",
            Self::ConnectionPoolSample { .. } => "ConnectionPoolSample",
            Self::TpsSample { .. } => "TpsSample",
            Self::DropSummary { .. } => "DropSummary",
        }
    }

    /// Only a successfully executed query may be sampled out or shed
    /// under back-pressure. Everything else must reach the sink.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            Self::QueryExecuted(body) if body.status == QueryStatus::Ok
        )
    }

    /// Re-mask every SQL-bearing field. Masking is idempotent, so an
    /// already-fingerprinted statement passes through unchanged.
    pub fn mask_sql_fields(&mut self) {
        if let Self::QueryExecuted(body) | Self::SlowQuery(body) = self {
            body.sql_fingerprint = mask_sql(&body.sql_fingerprint);
            if let Some(msg) = &body.error_message {
                body.error_message = Some(mask_sql(msg));
            }
        }
    }
}

/// Wire envelope: per-process monotonic sequence number plus the
/// submission timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    #[serde(with = "rfc3339_millis")]
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DbEvent,
}

/// RFC3339 timestamps with fixed millisecond precision.
mod rfc3339_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
