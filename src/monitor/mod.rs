//! Background monitors
//!
//! One ticker drives three cheap scans: long-running transactions
//! (budgeted, sticky once-per-transaction reporting), the TPS window,
//! and the connection pool sample.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::agent::AgentCore;
use crate::event::DbEvent;

/// Query counter behind the TPS sample. Incremented on every observed
/// execution, drained once per sweep tick.
#[derive(Default)]
pub struct TpsCounter {
    count: AtomicU64,
}

impl TpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn take(&self) -> u64 {
        self.count.swap(0, Ordering::Relaxed)
    }
}

/// Sweep task: runs until the shutdown signal fires.
pub async fn run_sweeper(core: Arc<AgentCore>, mut shutdown: watch::Receiver<bool>) {
    let window_ms = core.config.sweep_interval_ms;
    let threshold = Duration::from_millis(core.config.long_tx_threshold_ms);
    let budget = core.config.sweep_budget;

    let mut tick = tokio::time::interval(Duration::from_millis(window_ms));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick fires immediately; skip it so each
    // sample covers a full window.
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => {
                debug!("Sweeper shutting down");
                break;
            }
        }

        for report in core.registry.sweep_long_running(threshold, budget) {
            core.collector.submit(DbEvent::LongRunningTransaction {
                tx_id: report.tx_id,
                age_ms: report.age_ms,
                query_count: report.query_count,
            });
        }

        let count = core.tps.take();
        core.collector.submit(DbEvent::TpsSample {
            window_ms,
            count,
            qps: count as f64 * 1000.0 / window_ms as f64,
        });

        let open = core.identity.open_count() as u64;
        let active = (core.registry.active_count() as u64).min(open);
        core.collector.submit(DbEvent::ConnectionPoolSample {
            active,
            idle: open - active,
            max: core.identity.peak_open(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tps_counter_drains_on_take() {
        let tps = TpsCounter::new();
        tps.record();
        tps.record();
        tps.record();
        assert_eq!(tps.take(), 3);
        assert_eq!(tps.take(), 0);
    }
}
