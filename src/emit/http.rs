//! Remote collector sink

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::{Delivery, Sink};
use crate::event::SequencedEvent;

/// POSTs each batch to the collector endpoint as one JSON array.
///
/// A 2xx response acknowledges the whole batch; there is no partial
/// ack. 5xx and connection failures are transient, 4xx (other than
/// 408/429) discards the batch.
pub struct HttpSink {
    client: Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: &str, timeout_ms: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn deliver(&self, batch: &[SequencedEvent]) -> Delivery {
        if batch.is_empty() {
            return Delivery::Ok;
        }

        let response = match self
            .client
            .post(&self.endpoint)
            .json(&batch)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Delivery::Transient(format!("request failed: {e}")),
        };

        let status = response.status();
        if status.is_success() {
            debug!("Delivered {} events to {}", batch.len(), self.endpoint);
            return Delivery::Ok;
        }
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            return Delivery::Transient(format!("HTTP {status}"));
        }
        Delivery::Fatal(format!("HTTP {status}"))
    }
}
