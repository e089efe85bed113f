//! Connection wrapper

use std::sync::Arc;
use tracing::debug;

use crate::agent::AgentCore;
use crate::event::{DbEvent, TxOutcome};
use crate::registry::AutoCommitTransition;

use super::statement::MonitoredStatement;
use super::traits::{DriverConnection, DriverResult, DriverStatement};

/// Observing wrapper around one database session.
///
/// Transaction boundaries (auto-commit flips, commit, rollback,
/// close) feed the registry; the statement factory hands back
/// monitored statements that capture the SQL at creation time.
/// Every inner result and error passes through unchanged.
pub struct MonitoredConnection<C> {
    inner: C,
    core: Arc<AgentCore>,
    conn_id: String,
    token: u64,
    closed: bool,
}

impl<C: DriverConnection> MonitoredConnection<C> {
    pub(crate) fn attach(inner: C, core: Arc<AgentCore>, token: u64) -> Self {
        let conn_id = core.identity.acquire(token);
        debug!("Observing connection {}", conn_id);
        Self {
            inner,
            core,
            conn_id,
            token,
            closed: false,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.conn_id
    }
}

impl<C> MonitoredConnection<C> {
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(done) = self.core.registry.on_connection_closed(&self.conn_id) {
            self.core.finish_tx(done);
        }
        self.core.identity.release(self.token);
    }
}

impl<C: DriverConnection> DriverConnection for MonitoredConnection<C> {
    fn set_auto_commit(&mut self, auto_commit: bool) -> DriverResult<()> {
        self.inner.set_auto_commit(auto_commit)?;

        match self
            .core
            .registry
            .on_auto_commit_change(&self.conn_id, auto_commit)
        {
            AutoCommitTransition::Started(tx_id) => {
                self.core.collector.submit(DbEvent::TransactionStarted {
                    tx_id,
                    conn_id: self.conn_id.clone(),
                });
            }
            AutoCommitTransition::Completed(done) => self.core.finish_tx(done),
            AutoCommitTransition::NoChange => {}
        }
        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.inner.commit()?;
        if let Some(done) = self.core.registry.complete(&self.conn_id, TxOutcome::Committed) {
            self.core.finish_tx(done);
        }
        Ok(())
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.inner.rollback()?;
        if let Some(done) = self
            .core
            .registry
            .complete(&self.conn_id, TxOutcome::RolledBack)
        {
            self.core.finish_tx(done);
        }
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        // The driver handle is gone either way; release our identity
        // even when the close itself errors.
        let result = self.inner.close();
        self.release();
        result
    }

    fn prepare(&mut self, sql: &str) -> DriverResult<Box<dyn DriverStatement>> {
        let stmt = self.inner.prepare(sql)?;
        Ok(Box::new(MonitoredStatement::attach(
            stmt,
            self.core.clone(),
            self.conn_id.clone(),
            sql,
        )))
    }
}

impl<C> Drop for MonitoredConnection<C> {
    fn drop(&mut self) {
        self.release();
    }
}
