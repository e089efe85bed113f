//! Event sinks
//!
//! Batches leave the collector through a single `Sink` contract. The
//! stdout sink is for log-scraper pickup, the HTTP sink ships to a
//! remote collector, and the composite fans out to both.

mod composite;
mod http;
mod stdout;

pub use composite::CompositeSink;
pub use http::HttpSink;
pub use stdout::{StdoutSink, STDOUT_EVENT_TAG};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::config::{AgentConfig, CollectorKind};
use crate::event::SequencedEvent;

/// Outcome of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The whole batch was acknowledged.
    Ok,
    /// Worth retrying: the batch is redelivered with backoff.
    Transient(String),
    /// Not worth retrying: the batch is discarded after one log line.
    Fatal(String),
}

/// Output adapter for event batches
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, batch: &[SequencedEvent]) -> Delivery;
}

/// Build the sink configured by `collector-kind`.
pub fn build_sink(config: &AgentConfig) -> Arc<dyn Sink> {
    match config.collector_kind {
        CollectorKind::Stdout => Arc::new(StdoutSink::new()),
        CollectorKind::Http => match &config.collector_endpoint {
            Some(endpoint) => Arc::new(HttpSink::new(endpoint, config.http_timeout_ms)),
            None => {
                warn!("collector-kind=http without collector-endpoint, falling back to stdout");
                Arc::new(StdoutSink::new())
            }
        },
        CollectorKind::Composite => {
            let mut sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(StdoutSink::new())];
            if let Some(endpoint) = &config.collector_endpoint {
                sinks.push(Arc::new(HttpSink::new(endpoint, config.http_timeout_ms)));
            }
            Arc::new(CompositeSink::new(sinks))
        }
    }
}
