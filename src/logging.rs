//! Agent log output setup
//!
//! The agent logs its own operational messages through `tracing`;
//! monitored-query events go through the collector pipeline instead
//! and never pass through here.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber for the agent.
///
/// Honors `RUST_LOG` when set. Safe to call when the host application
/// already installed a subscriber: the second install attempt is
/// discarded.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kubedb_agent=debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
