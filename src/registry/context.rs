//! Per-transaction bookkeeping

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::event::QueryStatus;

/// Lifecycle state of a logical transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Committed,
    RolledBack,
    Aborted,
    AbortedDeadlock,
}

/// One observed query inside a transaction
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub query_id: Uuid,
    pub sql_fingerprint: String,
    pub duration_ms: u64,
    pub status: QueryStatus,
}

/// Live state of one transaction on one connection
///
/// Mutated only through the interception path; destroyed when the
/// transaction completes or its connection dies.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    pub tx_id: String,
    pub connection_id: String,
    pub started_at: DateTime<Utc>,
    pub queries: Vec<QueryRecord>,
    pub locks_held: BTreeSet<String>,
    pub locks_requested: BTreeSet<String>,
    pub last_activity_at: DateTime<Utc>,
    pub status: TxStatus,
    /// Set once the long-running event for this transaction has been
    /// emitted; the sweep never re-emits for the same crossing.
    pub long_tx_reported: bool,
    /// Set by the deadlock detector; upgrades the terminal outcome.
    pub deadlock_victim: bool,
}

impl TransactionContext {
    pub fn new(tx_id: &str, connection_id: &str) -> Self {
        let now = Utc::now();
        Self {
            tx_id: tx_id.to_string(),
            connection_id: connection_id.to_string(),
            started_at: now,
            queries: Vec::new(),
            locks_held: BTreeSet::new(),
            locks_requested: BTreeSet::new(),
            last_activity_at: now,
            status: TxStatus::Active,
            long_tx_reported: false,
            deadlock_victim: false,
        }
    }

    pub fn record_query(&mut self, sql_fingerprint: &str, duration_ms: u64, status: QueryStatus) {
        self.queries.push(QueryRecord {
            query_id: Uuid::new_v4(),
            sql_fingerprint: sql_fingerprint.to_string(),
            duration_ms,
            status,
        });
        self.last_activity_at = Utc::now();
    }

    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.started_at).num_milliseconds().max(0) as u64
    }
}
