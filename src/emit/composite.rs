//! Fan-out sink

use async_trait::async_trait;
use std::sync::Arc;

use super::{Delivery, Sink};
use crate::event::SequencedEvent;

/// Delivers every batch to all configured sinks and aggregates the
/// results: Ok iff all Ok, a fatal outcome dominates a transient one.
pub struct CompositeSink {
    sinks: Vec<Arc<dyn Sink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl Sink for CompositeSink {
    fn name(&self) -> &'static str {
        "composite"
    }

    async fn deliver(&self, batch: &[SequencedEvent]) -> Delivery {
        let mut transient: Option<String> = None;
        let mut fatal: Option<String> = None;

        for sink in &self.sinks {
            match sink.deliver(batch).await {
                Delivery::Ok => {}
                Delivery::Transient(reason) => {
                    transient.get_or_insert(format!("{}: {}", sink.name(), reason));
                }
                Delivery::Fatal(reason) => {
                    fatal.get_or_insert(format!("{}: {}", sink.name(), reason));
                }
            }
        }

        if let Some(reason) = fatal {
            Delivery::Fatal(reason)
        } else if let Some(reason) = transient {
            Delivery::Transient(reason)
        } else {
            Delivery::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSink(Delivery);

    #[async_trait]
    impl Sink for FixedSink {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn deliver(&self, _batch: &[SequencedEvent]) -> Delivery {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_all_ok() {
        let sink = CompositeSink::new(vec![
            Arc::new(FixedSink(Delivery::Ok)),
            Arc::new(FixedSink(Delivery::Ok)),
        ]);
        assert_eq!(sink.deliver(&[]).await, Delivery::Ok);
    }

    #[tokio::test]
    async fn test_transient_wins_over_ok() {
        let sink = CompositeSink::new(vec![
            Arc::new(FixedSink(Delivery::Ok)),
            Arc::new(FixedSink(Delivery::Transient("503".to_string()))),
        ]);
        assert!(matches!(sink.deliver(&[]).await, Delivery::Transient(_)));
    }

    #[tokio::test]
    async fn test_fatal_dominates() {
        let sink = CompositeSink::new(vec![
            Arc::new(FixedSink(Delivery::Transient("503".to_string()))),
            Arc::new(FixedSink(Delivery::Fatal("400".to_string()))),
            Arc::new(FixedSink(Delivery::Ok)),
        ]);
        assert!(matches!(sink.deliver(&[]).await, Delivery::Fatal(_)));
    }

    #[tokio::test]
    async fn test_empty_composite_is_ok() {
        let sink = CompositeSink::new(Vec::new());
        assert_eq!(sink.deliver(&[]).await, Delivery::Ok);
    }
}
