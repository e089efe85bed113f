//! Statement and result-set wrappers
//!
//! Each wrapped call records a start instant, invokes the underlying
//! driver, records the end, and produces events. The inner result or
//! error is returned unchanged; the host application cannot tell it
//! is being observed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::agent::AgentCore;
use crate::event::{QueryEventBody, QueryStatus};
use crate::sql::{classify_db_error, mask_sql, statement_targets, LockMode, StatementKind};

use super::traits::{
    DriverResult, DriverResultSet, DriverStatement, ExecOutcome, ParamValue,
};

/// Observing wrapper around a prepared statement.
///
/// SQL is inspected once, at creation time: fingerprint, statement
/// kind, target tables, and lock intent are all derived here and
/// reused for every execution.
pub struct MonitoredStatement<S> {
    inner: S,
    core: Arc<AgentCore>,
    conn_id: String,
    fingerprint: String,
    kind: StatementKind,
    targets: BTreeSet<String>,
    lock_mode: LockMode,
    bound_params: u32,
}

impl<S: DriverStatement> MonitoredStatement<S> {
    pub(crate) fn attach(inner: S, core: Arc<AgentCore>, conn_id: String, sql: &str) -> Self {
        let kind = crate::sql::statement_kind(sql);
        let (targets, lock_mode) = statement_targets(sql);
        let fingerprint = if core.config.mask_sql_params {
            mask_sql(sql)
        } else {
            // The collector still masks before anything leaves the
            // process; skipping here only saves hot-path work.
            sql.to_string()
        };
        Self {
            inner,
            core,
            conn_id,
            fingerprint,
            kind,
            targets,
            lock_mode,
            bound_params: 0,
        }
    }

    fn event_body(
        &self,
        tx_id: Option<String>,
        duration_ms: u64,
        row_count: Option<u64>,
        status: QueryStatus,
        error: Option<&crate::intercept::DriverError>,
    ) -> QueryEventBody {
        QueryEventBody {
            conn_id: self.conn_id.clone(),
            tx_id,
            sql_fingerprint: self.fingerprint.clone(),
            kind: self.kind,
            duration_ms,
            row_count,
            status,
            error_kind: error
                .map(|e| classify_db_error(e.code, e.sqlstate.as_deref(), &e.message)),
            error_message: error.map(|e| e.message.clone()),
            param_count: (!self.core.config.safe_mode && self.bound_params > 0)
                .then_some(self.bound_params),
        }
    }
}

impl<S: DriverStatement> DriverStatement for MonitoredStatement<S> {
    fn bind(&mut self, index: usize, value: ParamValue) -> DriverResult<()> {
        self.inner.bind(index, value)?;
        if !self.core.config.safe_mode {
            self.bound_params = self.bound_params.max(index as u32);
        }
        Ok(())
    }

    fn execute(&mut self) -> DriverResult<ExecOutcome> {
        let core = self.core.clone();
        let tx_id = core.registry.active_tx(&self.conn_id);

        // Register the lock request before the driver call: while the
        // statement blocks on a busy lock, the wait-for edge is live.
        let tracks_locks =
            tx_id.is_some() && self.lock_mode != LockMode::None && !self.targets.is_empty();
        if tracks_locks {
            let tx = tx_id.as_deref().expect("tx checked above");
            core.detector.lock_requested(tx, &self.targets);
            core.registry.note_locks(tx, &self.targets, false);
        }

        let started = Instant::now();
        let result = self.inner.execute();
        let duration_ms = started.elapsed().as_millis() as u64;
        core.tps.record();

        match result {
            Ok(outcome) => {
                if tracks_locks {
                    let tx = tx_id.as_deref().expect("tx checked above");
                    core.detector.lock_acquired(tx, &self.targets);
                    core.registry.note_locks(tx, &self.targets, true);
                }
                if tx_id.is_some() {
                    core.registry.record_query(
                        &self.conn_id,
                        &self.fingerprint,
                        duration_ms,
                        QueryStatus::Ok,
                    );
                }

                match outcome {
                    ExecOutcome::RowsAffected(n) => {
                        core.emit_query(self.event_body(
                            tx_id,
                            duration_ms,
                            Some(n),
                            QueryStatus::Ok,
                            None,
                        ));
                        Ok(ExecOutcome::RowsAffected(n))
                    }
                    ExecOutcome::ResultSet(rows) => {
                        if core.config.safe_mode {
                            // No result-set wrapping in safe mode; the
                            // row count stays unknown.
                            core.emit_query(self.event_body(
                                tx_id,
                                duration_ms,
                                None,
                                QueryStatus::Ok,
                                None,
                            ));
                            Ok(ExecOutcome::ResultSet(rows))
                        } else {
                            let pending =
                                self.event_body(tx_id, duration_ms, None, QueryStatus::Ok, None);
                            Ok(ExecOutcome::ResultSet(Box::new(MonitoredResultSet {
                                inner: rows,
                                core,
                                pending: Some(pending),
                                rows_seen: 0,
                            })))
                        }
                    }
                }
            }
            Err(err) => {
                if tx_id.is_some() {
                    core.registry.record_query(
                        &self.conn_id,
                        &self.fingerprint,
                        duration_ms,
                        QueryStatus::Error,
                    );
                }
                let body =
                    self.event_body(tx_id, duration_ms, None, QueryStatus::Error, Some(&err));
                let error_kind = body.error_kind;
                core.emit_query(body);

                if let Some(kind) = error_kind {
                    if kind.triggers_deadlock_check() {
                        core.detector.request_check(&format!(
                            "query failed on {} with {:?}",
                            self.conn_id, kind
                        ));
                    }
                }

                Err(err)
            }
        }
    }
}

/// Observing wrapper around a row cursor.
///
/// Counts rows as the host iterates and finalizes the query event
/// when the cursor is closed (or dropped), so the row count makes it
/// onto the wire when the driver can provide one.
pub struct MonitoredResultSet {
    inner: Box<dyn DriverResultSet>,
    core: Arc<AgentCore>,
    pending: Option<QueryEventBody>,
    rows_seen: u64,
}

impl MonitoredResultSet {
    fn finalize(&mut self) {
        if let Some(mut body) = self.pending.take() {
            body.row_count = Some(self.rows_seen);
            self.core.emit_query(body);
        }
    }
}

impl DriverResultSet for MonitoredResultSet {
    fn next_row(&mut self) -> DriverResult<bool> {
        let more = self.inner.next_row()?;
        if more {
            self.rows_seen += 1;
        }
        Ok(more)
    }

    fn close(&mut self) -> DriverResult<()> {
        let result = self.inner.close();
        self.finalize();
        result
    }
}

impl Drop for MonitoredResultSet {
    fn drop(&mut self) {
        self.finalize();
    }
}
