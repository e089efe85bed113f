//! Agent bootstrap
//!
//! One `DbAgent` per process. Construction wires the registry, the
//! deadlock detector, the collector, and the sweep ticker together
//! and spawns the background tasks; shutdown signals them and drains
//! the collector within a bounded deadline.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::collector::{run_consumer, MetricsCollector};
use crate::config::AgentConfig;
use crate::deadlock::{DeadlockDetector, DetectorHandle};
use crate::emit::{self, Sink};
use crate::error::{AgentError, Result};
use crate::event::{DbEvent, QueryEventBody};
use crate::intercept::{
    BoxedDriverConnection, ConnectionIdentity, DriverConnection, MonitoredConnection, WrapFn,
    WrapperRegistry,
};
use crate::monitor::{run_sweeper, TpsCounter};
use crate::registry::{CompletedTx, TransactionRegistry};

/// Shared dependencies of the interception path.
///
/// Everything here is either immutable configuration or safe for
/// concurrent use from any application thread.
pub struct AgentCore {
    pub config: AgentConfig,
    pub registry: Arc<TransactionRegistry>,
    pub collector: Arc<MetricsCollector>,
    pub detector: DetectorHandle,
    pub identity: ConnectionIdentity,
    pub tps: TpsCounter,
}

impl AgentCore {
    /// Submit a query event, doubling it as SlowQuery past the
    /// threshold.
    pub(crate) fn emit_query(&self, body: QueryEventBody) {
        let slow_body =
            (body.duration_ms >= self.config.slow_query_threshold_ms).then(|| body.clone());
        self.collector.submit(DbEvent::QueryExecuted(body));
        if let Some(body) = slow_body {
            self.collector.submit(DbEvent::SlowQuery(body));
        }
    }

    /// Terminal bookkeeping for a completed transaction: the detector
    /// drops its edges, then the lifecycle event goes out.
    pub(crate) fn finish_tx(&self, done: CompletedTx) {
        self.detector.tx_completed(&done.tx_id);
        self.collector.submit(DbEvent::TransactionEnded {
            tx_id: done.tx_id,
            outcome: done.outcome,
        });
    }
}

/// The in-process monitoring agent
pub struct DbAgent {
    core: Arc<AgentCore>,
    wrappers: WrapperRegistry,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DbAgent {
    /// Parse the argument string, build the configured sink, start.
    ///
    /// Must be called within a tokio runtime.
    pub fn start_from_args(args: &str) -> Self {
        let config = AgentConfig::parse(args);
        let sink = emit::build_sink(&config);
        Self::start(config, sink)
    }

    /// Start with an explicit sink (the factory the bootstrap supplies).
    pub fn start(config: AgentConfig, sink: Arc<dyn Sink>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(TransactionRegistry::new());
        let collector = Arc::new(MetricsCollector::new(
            config.queue_capacity,
            config.sampling_rate,
        ));

        let mut tasks = Vec::new();
        let (detector, detector_task) = DeadlockDetector::spawn(
            registry.clone(),
            collector.clone(),
            Duration::from_millis(config.deadlock_check_interval_ms),
            shutdown_rx.clone(),
        );
        if config.enabled {
            tasks.push(detector_task);
        } else {
            // Master switch off: nothing runs, handles lead nowhere.
            detector_task.abort();
        }

        let core = Arc::new(AgentCore {
            config: config.clone(),
            registry,
            collector: collector.clone(),
            detector,
            identity: ConnectionIdentity::new(),
            tps: TpsCounter::new(),
        });

        let wrappers = WrapperRegistry::new();
        if config.enabled {
            tasks.push(tokio::spawn(run_consumer(
                collector,
                sink,
                config.batch_size,
                Duration::from_millis(config.batch_timeout_ms),
                shutdown_rx.clone(),
            )));
            tasks.push(tokio::spawn(run_sweeper(core.clone(), shutdown_rx)));

            for scheme in &config.db_types {
                let core = core.clone();
                wrappers.register(
                    scheme,
                    Arc::new(move |conn: BoxedDriverConnection| {
                        Box::new(MonitoredConnection::attach(
                            conn,
                            core.clone(),
                            core.identity.fresh_token(),
                        )) as BoxedDriverConnection
                    }),
                );
            }
            info!(
                "Database monitoring agent started (schemes: {}, sink: {})",
                config.db_types.join(","),
                config.collector_kind
            );
        } else {
            info!("Database monitoring agent disabled by configuration");
        }

        Self {
            core,
            wrappers,
            shutdown_tx,
            tasks,
        }
    }

    pub fn core(&self) -> &Arc<AgentCore> {
        &self.core
    }

    pub fn config(&self) -> &AgentConfig {
        &self.core.config
    }

    /// Register a custom wrap function for a driver scheme (the
    /// platform bootstrap hook).
    pub fn register_wrapper(&self, scheme: &str, wrap: WrapFn) {
        self.wrappers.register(scheme, wrap);
    }

    /// Wrap a new physical connection for its URL scheme. Schemes
    /// outside `db-types` (and everything while disabled) pass
    /// through unobserved.
    pub fn wrap_connection(
        &self,
        scheme: &str,
        conn: BoxedDriverConnection,
    ) -> BoxedDriverConnection {
        if !self.core.config.observes_scheme(scheme) {
            return conn;
        }
        self.wrappers.wrap(scheme, conn)
    }

    /// Typed wrapper for hosts that embed the agent directly instead
    /// of going through scheme registration.
    pub fn monitor<C: DriverConnection>(&self, conn: C) -> MonitoredConnection<C> {
        MonitoredConnection::attach(conn, self.core.clone(), self.core.identity.fresh_token())
    }

    /// Wrap sharing an existing handle token, so a pool wrapper keeps
    /// the physical connection's identity.
    pub fn monitor_keyed<C: DriverConnection>(
        &self,
        conn: C,
        token: u64,
    ) -> MonitoredConnection<C> {
        MonitoredConnection::attach(conn, self.core.clone(), token)
    }

    /// Signal all tasks, drain the collector, and wait for the
    /// pipeline to exit within the configured deadline.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.core.collector.close();

        let deadline = Duration::from_millis(self.core.config.shutdown_drain_ms);
        let started = std::time::Instant::now();
        let mut tasks = self.tasks;

        for i in 0..tasks.len() {
            let remaining = deadline.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, &mut tasks[i]).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("Shutdown drain deadline exceeded, aborting pipeline tasks");
                    for task in &tasks[i..] {
                        task.abort();
                    }
                    return Err(AgentError::ShutdownTimeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        info!(
            "Agent shut down, {} events dropped over the process lifetime",
            self.core.collector.dropped_total()
        );
        Ok(())
    }
}
