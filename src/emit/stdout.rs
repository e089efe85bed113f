//! Structured stdout sink

use async_trait::async_trait;
use std::io::Write;
use tracing::error;

use super::{Delivery, Sink};
use crate::event::SequencedEvent;

/// Fixed line prefix so log scrapers can filter cheaply.
pub const STDOUT_EVENT_TAG: &str = "KUBEDB_METRICS: ";

/// Writes one tag-prefixed JSON object per event, one per line.
///
/// Stdout cannot be "down", so this sink never reports a transient
/// failure; a serialization problem is logged and the event skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn deliver(&self, batch: &[SequencedEvent]) -> Delivery {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for event in batch {
            match serde_json::to_string(event) {
                Ok(json) => {
                    if let Err(e) = writeln!(out, "{STDOUT_EVENT_TAG}{json}") {
                        error!("Failed writing event line to stdout: {}", e);
                    }
                }
                Err(e) => error!("Failed serializing {} event: {}", event.event.name(), e),
            }
        }
        let _ = out.flush();
        Delivery::Ok
    }
}
