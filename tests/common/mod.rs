//! Shared test doubles: a scripted in-memory driver and a recording
//! sink.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubedb_agent::{
    statement_kind, DbEvent, Delivery, DriverConnection, DriverError, DriverResult,
    DriverResultSet, DriverStatement, ExecOutcome, ParamValue, SequencedEvent, Sink,
    StatementKind,
};

/// Hands out fake connections and lets a test script the next
/// execution failure.
#[derive(Clone, Default)]
pub struct FakeDriver {
    next_error: Arc<Mutex<Option<DriverError>>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> FakeConnection {
        FakeConnection {
            next_error: self.next_error.clone(),
        }
    }

    /// The next `execute` on any statement of this driver fails with
    /// the given error.
    pub fn fail_next(&self, err: DriverError) {
        *self.next_error.lock().unwrap() = Some(err);
    }
}

pub struct FakeConnection {
    next_error: Arc<Mutex<Option<DriverError>>>,
}

impl DriverConnection for FakeConnection {
    fn set_auto_commit(&mut self, _auto_commit: bool) -> DriverResult<()> {
        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        Ok(())
    }

    fn rollback(&mut self) -> DriverResult<()> {
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        Ok(())
    }

    fn prepare(&mut self, sql: &str) -> DriverResult<Box<dyn DriverStatement>> {
        Ok(Box::new(FakeStatement {
            sql: sql.to_string(),
            rows: 1,
            next_error: self.next_error.clone(),
        }))
    }
}

pub struct FakeStatement {
    sql: String,
    rows: u64,
    next_error: Arc<Mutex<Option<DriverError>>>,
}

impl DriverStatement for FakeStatement {
    fn bind(&mut self, _index: usize, _value: ParamValue) -> DriverResult<()> {
        Ok(())
    }

    fn execute(&mut self) -> DriverResult<ExecOutcome> {
        if let Some(err) = self.next_error.lock().unwrap().take() {
            return Err(err);
        }
        match statement_kind(&self.sql) {
            StatementKind::Select => Ok(ExecOutcome::ResultSet(Box::new(FakeResultSet {
                remaining: self.rows,
            }))),
            _ => Ok(ExecOutcome::RowsAffected(self.rows)),
        }
    }
}

pub struct FakeResultSet {
    remaining: u64,
}

impl DriverResultSet for FakeResultSet {
    fn next_row(&mut self) -> DriverResult<bool> {
        if self.remaining > 0 {
            self.remaining -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn close(&mut self) -> DriverResult<()> {
        Ok(())
    }
}

/// Sink that keeps everything it is handed.
pub struct RecordingSink {
    events: Mutex<Vec<SequencedEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<SequencedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_named(&self, name: &str) -> Vec<SequencedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event.name() == name)
            .collect()
    }

    pub fn count_named(&self, name: &str) -> usize {
        self.events_named(name).len()
    }

    /// Poll until at least `count` events with the tag arrived, or
    /// the timeout elapsed.
    pub async fn wait_for(&self, name: &str, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count_named(name) >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, batch: &[SequencedEvent]) -> Delivery {
        self.events.lock().unwrap().extend(batch.to_vec());
        Delivery::Ok
    }
}

/// Pull the transaction id out of a lifecycle event.
pub fn started_tx_id(event: &DbEvent) -> Option<(String, String)> {
    match event {
        DbEvent::TransactionStarted { tx_id, conn_id } => {
            Some((tx_id.clone(), conn_id.clone()))
        }
        _ => None,
    }
}
