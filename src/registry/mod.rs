//! Transaction registry
//!
//! Correlates per-connection activity into logical transactions. Owns
//! the `connection -> transaction` mapping and the per-transaction
//! context. Safe for concurrent use from any application thread: the
//! connection map's entry locking is the compare-and-set that makes
//! racing observers converge on exactly one ACTIVE transaction per
//! connection.

mod context;

pub use context::{QueryRecord, TransactionContext, TxStatus};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::event::{QueryStatus, TxOutcome};

/// A transaction that just reached its terminal state
#[derive(Debug, Clone)]
pub struct CompletedTx {
    pub tx_id: String,
    pub connection_id: String,
    pub outcome: TxOutcome,
    pub query_count: u64,
}

/// A transaction that just crossed the long-running threshold
#[derive(Debug, Clone)]
pub struct LongTxReport {
    pub tx_id: String,
    pub age_ms: u64,
    pub query_count: u64,
}

/// Snapshot used by the deadlock detector for victim selection
#[derive(Debug, Clone)]
pub struct TxSnapshot {
    pub tx_id: String,
    pub started_at: DateTime<Utc>,
    pub query_count: u64,
}

#[derive(Default)]
pub struct TransactionRegistry {
    by_conn: DashMap<String, String>,
    contexts: DashMap<String, TransactionContext>,
    sweep_cursor: AtomicUsize,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Auto-commit flipped on the connection.
    ///
    /// `false` mints a transaction when none is active; `true`
    /// completes the active one as COMMITTED (auto-commit flushes).
    /// Idempotent in both directions.
    pub fn on_auto_commit_change(
        &self,
        conn_id: &str,
        auto_commit: bool,
    ) -> AutoCommitTransition {
        if auto_commit {
            match self.complete(conn_id, TxOutcome::Committed) {
                Some(done) => AutoCommitTransition::Completed(done),
                None => AutoCommitTransition::NoChange,
            }
        } else {
            match self.begin(conn_id) {
                Some(tx_id) => AutoCommitTransition::Started(tx_id),
                None => AutoCommitTransition::NoChange,
            }
        }
    }

    /// Mint an ACTIVE transaction for the connection unless one
    /// already exists. Returns the new id only when minted.
    pub fn begin(&self, conn_id: &str) -> Option<String> {
        match self.by_conn.entry(conn_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let tx_id = mint_tx_id();
                self.contexts
                    .insert(tx_id.clone(), TransactionContext::new(&tx_id, conn_id));
                slot.insert(tx_id.clone());
                debug!("Transaction {} started on {}", tx_id, conn_id);
                Some(tx_id)
            }
        }
    }

    /// Complete the connection's ACTIVE transaction. Returns None if
    /// there was none. A transaction marked as deadlock victim
    /// reports ABORTED_DEADLOCK regardless of the requested outcome.
    pub fn complete(&self, conn_id: &str, outcome: TxOutcome) -> Option<CompletedTx> {
        let (_, tx_id) = self.by_conn.remove(conn_id)?;
        let (_, mut ctx) = self.contexts.remove(&tx_id)?;

        let outcome = if ctx.deadlock_victim {
            TxOutcome::AbortedDeadlock
        } else {
            outcome
        };
        ctx.status = match outcome {
            TxOutcome::Committed => TxStatus::Committed,
            TxOutcome::RolledBack => TxStatus::RolledBack,
            TxOutcome::Aborted => TxStatus::Aborted,
            TxOutcome::AbortedDeadlock => TxStatus::AbortedDeadlock,
        };
        debug!(
            "Transaction {} on {} ended: {}",
            ctx.tx_id,
            conn_id,
            outcome.as_str()
        );

        Some(CompletedTx {
            tx_id: ctx.tx_id.clone(),
            connection_id: ctx.connection_id.clone(),
            outcome,
            query_count: ctx.queries.len() as u64,
        })
    }

    /// Connection died. A lingering ACTIVE transaction is aborted.
    pub fn on_connection_closed(&self, conn_id: &str) -> Option<CompletedTx> {
        self.complete(conn_id, TxOutcome::Aborted)
    }

    /// Append a query record to the connection's ACTIVE transaction,
    /// if any. Returns the transaction id the query belongs to.
    pub fn record_query(
        &self,
        conn_id: &str,
        sql_fingerprint: &str,
        duration_ms: u64,
        status: QueryStatus,
    ) -> Option<String> {
        let tx_id = self.by_conn.get(conn_id)?.value().clone();
        let mut ctx = self.contexts.get_mut(&tx_id)?;
        ctx.record_query(sql_fingerprint, duration_ms, status);
        Some(tx_id)
    }

    /// Transaction id currently active on the connection, if any.
    pub fn active_tx(&self, conn_id: &str) -> Option<String> {
        self.by_conn.get(conn_id).map(|id| id.value().clone())
    }

    /// Record lock bookkeeping on the context.
    pub fn note_locks(&self, tx_id: &str, resources: &BTreeSet<String>, acquired: bool) {
        if let Some(mut ctx) = self.contexts.get_mut(tx_id) {
            for res in resources {
                if acquired {
                    ctx.locks_requested.remove(res);
                    ctx.locks_held.insert(res.clone());
                } else {
                    ctx.locks_requested.insert(res.clone());
                }
            }
        }
    }

    /// Mark a transaction as the chosen deadlock victim; its terminal
    /// event will report ABORTED_DEADLOCK.
    pub fn mark_deadlock_victim(&self, tx_id: &str) -> bool {
        match self.contexts.get_mut(tx_id) {
            Some(mut ctx) => {
                ctx.deadlock_victim = true;
                true
            }
            None => false,
        }
    }

    /// Snapshot for victim selection; missing ids are skipped.
    pub fn snapshots(&self, tx_ids: &[String]) -> Vec<TxSnapshot> {
        tx_ids
            .iter()
            .filter_map(|id| {
                self.contexts.get(id).map(|ctx| TxSnapshot {
                    tx_id: ctx.tx_id.clone(),
                    started_at: ctx.started_at,
                    query_count: ctx.queries.len() as u64,
                })
            })
            .collect()
    }

    /// Visit at most `budget` ACTIVE transactions, resuming where the
    /// previous sweep left off, and report each one that crossed the
    /// long-running threshold for the first time.
    pub fn sweep_long_running(&self, threshold: Duration, budget: usize) -> Vec<LongTxReport> {
        let mut ids: Vec<String> = self.contexts.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return Vec::new();
        }
        ids.sort_unstable();

        let start = self.sweep_cursor.load(Ordering::Relaxed) % ids.len();
        let visit = budget.min(ids.len());
        self.sweep_cursor
            .store((start + visit) % ids.len().max(1), Ordering::Relaxed);

        let now = Utc::now();
        let threshold_ms = threshold.as_millis() as u64;
        let mut reports = Vec::new();

        for offset in 0..visit {
            let id = &ids[(start + offset) % ids.len()];
            if let Some(mut ctx) = self.contexts.get_mut(id) {
                if ctx.long_tx_reported {
                    continue;
                }
                let age_ms = ctx.age_ms(now);
                if age_ms >= threshold_ms {
                    ctx.long_tx_reported = true;
                    reports.push(LongTxReport {
                        tx_id: ctx.tx_id.clone(),
                        age_ms,
                        query_count: ctx.queries.len() as u64,
                    });
                }
            }
        }

        reports
    }

    /// Number of connections with an ACTIVE transaction.
    pub fn active_count(&self) -> usize {
        self.by_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_conn.is_empty() && self.contexts.is_empty()
    }
}

fn mint_tx_id() -> String {
    let bytes: [u8; 4] = rand::thread_rng().gen();
    format!(
        "tx-{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}

/// What an auto-commit flip did to the connection's transaction state
#[derive(Debug, Clone)]
pub enum AutoCommitTransition {
    Started(String),
    Completed(CompletedTx),
    NoChange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_active_tx_per_connection() {
        let registry = TransactionRegistry::new();

        let first = registry.begin("c1").expect("first begin mints");
        assert!(registry.begin("c1").is_none(), "second begin is a no-op");
        assert_eq!(registry.active_tx("c1").as_deref(), Some(first.as_str()));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_auto_commit_transitions() {
        let registry = TransactionRegistry::new();

        let started = registry.on_auto_commit_change("c1", false);
        let tx_id = match started {
            AutoCommitTransition::Started(id) => id,
            other => panic!("expected Started, got {other:?}"),
        };

        // Repeating the same flip changes nothing.
        assert!(matches!(
            registry.on_auto_commit_change("c1", false),
            AutoCommitTransition::NoChange
        ));

        // Flipping back flushes as COMMITTED.
        match registry.on_auto_commit_change("c1", true) {
            AutoCommitTransition::Completed(done) => {
                assert_eq!(done.tx_id, tx_id);
                assert_eq!(done.outcome, TxOutcome::Committed);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_complete_outcomes() {
        let registry = TransactionRegistry::new();

        registry.begin("c1");
        let done = registry.complete("c1", TxOutcome::RolledBack).unwrap();
        assert_eq!(done.outcome, TxOutcome::RolledBack);

        registry.begin("c2");
        let done = registry.on_connection_closed("c2").unwrap();
        assert_eq!(done.outcome, TxOutcome::Aborted);

        assert!(registry.complete("c3", TxOutcome::Committed).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_deadlock_victim_upgrades_outcome() {
        let registry = TransactionRegistry::new();
        let tx_id = registry.begin("c1").unwrap();

        assert!(registry.mark_deadlock_victim(&tx_id));
        let done = registry.complete("c1", TxOutcome::RolledBack).unwrap();
        assert_eq!(done.outcome, TxOutcome::AbortedDeadlock);
    }

    #[test]
    fn test_record_query() {
        let registry = TransactionRegistry::new();
        let tx_id = registry.begin("c1").unwrap();

        let recorded = registry.record_query("c1", "SELECT ?", 3, QueryStatus::Ok);
        assert_eq!(recorded.as_deref(), Some(tx_id.as_str()));
        assert!(registry
            .record_query("c9", "SELECT ?", 3, QueryStatus::Ok)
            .is_none());

        let done = registry.complete("c1", TxOutcome::Committed).unwrap();
        assert_eq!(done.query_count, 1);
    }

    #[test]
    fn test_sweep_reports_once() {
        let registry = TransactionRegistry::new();
        registry.begin("c1").unwrap();

        // Zero threshold: the transaction has already crossed it.
        let first = registry.sweep_long_running(Duration::from_millis(0), 1000);
        assert_eq!(first.len(), 1);

        let second = registry.sweep_long_running(Duration::from_millis(0), 1000);
        assert!(second.is_empty(), "sticky bit suppresses re-emission");
    }

    #[test]
    fn test_sweep_budget_bounds_visits() {
        let registry = TransactionRegistry::new();
        for i in 0..10 {
            registry.begin(&format!("c{i}")).unwrap();
        }

        let mut reported = 0;
        for _ in 0..5 {
            reported += registry
                .sweep_long_running(Duration::from_millis(0), 3)
                .len();
        }
        // 5 ticks x budget 3 cover all 10 transactions at least once.
        assert_eq!(reported, 10);
    }

    #[test]
    fn test_tx_id_shape() {
        let id = mint_tx_id();
        assert!(id.starts_with("tx-"));
        assert_eq!(id.len(), 11);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
