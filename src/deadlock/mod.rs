//! Deadlock detection
//!
//! The wait-for graph is owned by a single actor task; application
//! threads only send lock events over a channel, so the hot path
//! never contends on the graph. Cycle checks run on a periodic tick
//! and on demand after errors whose classification suggests lock
//! contention.

mod graph;

pub use graph::{Cycle, WaitForGraph};

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collector::MetricsCollector;
use crate::event::DbEvent;
use crate::registry::{TransactionRegistry, TxSnapshot};

/// Lock activity observed by the interceptor
#[derive(Debug)]
pub enum LockEvent {
    /// Transaction is about to block on the resources.
    Requested {
        tx_id: String,
        resources: BTreeSet<String>,
    },
    /// Transaction finished a statement that locked the resources.
    Acquired {
        tx_id: String,
        resources: BTreeSet<String>,
    },
    /// Transaction reached a terminal state.
    Completed { tx_id: String },
    /// A suspicious error asked for an immediate cycle check.
    CheckNow { reason: String },
}

/// Cheap cloneable handle the interception path uses to feed the
/// detector. Sends never block.
#[derive(Clone)]
pub struct DetectorHandle {
    tx: mpsc::UnboundedSender<LockEvent>,
}

impl DetectorHandle {
    pub fn lock_requested(&self, tx_id: &str, resources: &BTreeSet<String>) {
        if resources.is_empty() {
            return;
        }
        let _ = self.tx.send(LockEvent::Requested {
            tx_id: tx_id.to_string(),
            resources: resources.clone(),
        });
    }

    pub fn lock_acquired(&self, tx_id: &str, resources: &BTreeSet<String>) {
        if resources.is_empty() {
            return;
        }
        let _ = self.tx.send(LockEvent::Acquired {
            tx_id: tx_id.to_string(),
            resources: resources.clone(),
        });
    }

    pub fn tx_completed(&self, tx_id: &str) {
        let _ = self.tx.send(LockEvent::Completed {
            tx_id: tx_id.to_string(),
        });
    }

    pub fn request_check(&self, reason: &str) {
        let _ = self.tx.send(LockEvent::CheckNow {
            reason: reason.to_string(),
        });
    }
}

/// Wait-for graph owner
pub struct DeadlockDetector {
    graph: WaitForGraph,
    registry: Arc<TransactionRegistry>,
    collector: Arc<MetricsCollector>,
    rx: mpsc::UnboundedReceiver<LockEvent>,
    check_interval: Duration,
}

impl DeadlockDetector {
    /// Spawn the detector actor. The returned handle feeds it; the
    /// task exits when the shutdown signal fires.
    pub fn spawn(
        registry: Arc<TransactionRegistry>,
        collector: Arc<MetricsCollector>,
        check_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (DetectorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let detector = Self {
            graph: WaitForGraph::new(),
            registry,
            collector,
            rx,
            check_interval,
        };
        let task = tokio::spawn(detector.run(shutdown));
        (DetectorHandle { tx }, task)
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; consume it so the
        // first real check happens one interval in.
        tick.tick().await;

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => {
                        let mut wants_check = matches!(event, LockEvent::CheckNow { .. });
                        self.apply(event);
                        // Drain whatever else is queued before a check
                        // so the graph is as current as possible.
                        while let Ok(event) = self.rx.try_recv() {
                            wants_check |= matches!(event, LockEvent::CheckNow { .. });
                            self.apply(event);
                        }
                        if wants_check {
                            self.check_for_deadlock();
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    self.check_for_deadlock();
                }
                _ = shutdown.changed() => {
                    debug!("Deadlock detector shutting down");
                    break;
                }
            }
        }
    }

    fn apply(&mut self, event: LockEvent) {
        match event {
            LockEvent::Requested { tx_id, resources } => {
                for res in &resources {
                    self.graph.add_request(&tx_id, res);
                }
            }
            LockEvent::Acquired { tx_id, resources } => {
                for res in &resources {
                    self.graph.add_acquired(&tx_id, res);
                }
            }
            LockEvent::Completed { tx_id } => {
                self.graph.remove_tx(&tx_id);
            }
            LockEvent::CheckNow { reason } => {
                debug!("Cycle check requested: {}", reason);
            }
        }
    }

    /// One bounded search pass. Every cycle found is reported once,
    /// its participants marked, and its edges dropped.
    fn check_for_deadlock(&mut self) {
        // A single pass cannot find more cycles than vertices.
        let mut budget = self.graph.vertex_count();
        while budget > 0 {
            budget -= 1;
            let cycle = match self.graph.find_cycle() {
                Some(cycle) => cycle,
                None => return,
            };

            let snapshots = self.registry.snapshots(&cycle.participants);
            if snapshots.len() != cycle.participants.len() {
                // A participant already completed; the cycle is stale.
                self.graph.drop_cycle_edges(&cycle);
                continue;
            }

            let victim = match select_victim(&snapshots) {
                Some(victim) => victim,
                None => return,
            };

            warn!(
                "Deadlock detected among [{}] over [{}], victim {}",
                cycle.participants.join(", "),
                cycle
                    .resources
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
                victim
            );

            for participant in &cycle.participants {
                self.registry.mark_deadlock_victim(participant);
            }

            self.collector.submit(DbEvent::DeadlockDetected {
                participants: cycle.participants.clone(),
                resources: cycle.resources.iter().cloned().collect(),
                victim: victim.clone(),
            });
            info!("Recommended deadlock victim: {}", victim);

            self.graph.drop_cycle_edges(&cycle);
        }
    }
}

/// Victim policy: fewest completed queries, then most recent start,
/// then lexicographically smallest transaction id.
fn select_victim(snapshots: &[TxSnapshot]) -> Option<String> {
    snapshots
        .iter()
        .min_by(|a, b| {
            a.query_count
                .cmp(&b.query_count)
                .then_with(|| cmp_recency(a.started_at, b.started_at))
                .then_with(|| a.tx_id.cmp(&b.tx_id))
        })
        .map(|s| s.tx_id.clone())
}

fn cmp_recency(a: DateTime<Utc>, b: DateTime<Utc>) -> std::cmp::Ordering {
    // Most recent first.
    b.cmp(&a)
}
