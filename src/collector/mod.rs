//! Metrics collection pipeline
//!
//! Many producers (application threads, the detector, the sweeper)
//! submit events; one consumer task batches them out to the sink.
//! Submission never blocks: at capacity a droppable event is shed,
//! while a non-droppable event evicts the oldest droppable one so
//! lifecycle and error events always get through.

use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::emit::{Delivery, Sink};
use crate::event::{DbEvent, SequencedEvent};

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 5_000;

/// What happened to a submitted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    /// Enqueued for delivery.
    Accepted,
    /// Discarded by the sampling rate; not counted as a drop.
    SampledOut,
    /// Shed at capacity (or after close); counted into DropSummary.
    Dropped,
}

struct QueueState {
    buf: VecDeque<SequencedEvent>,
    next_seq: u64,
    closed: bool,
}

/// Bounded event queue with drop accounting
pub struct MetricsCollector {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    sampling_rate: f64,
    dropped_pending: AtomicU64,
    dropped_total: AtomicU64,
}

impl MetricsCollector {
    pub fn new(capacity: usize, sampling_rate: f64) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buf: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 1,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            sampling_rate: sampling_rate.clamp(0.0, 1.0),
            dropped_pending: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Non-blocking submission from any thread.
    ///
    /// Sampling applies only to successfully executed queries; slow
    /// queries, transaction lifecycle, deadlock, and error events are
    /// never sampled out and never shed in favor of newer traffic.
    pub fn submit(&self, event: DbEvent) -> SubmitResult {
        if event.is_droppable()
            && self.sampling_rate < 1.0
            && !rand::thread_rng().gen_bool(self.sampling_rate)
        {
            return SubmitResult::SampledOut;
        }
        self.enqueue(event, false)
    }

    /// Pipeline-internal submission (drop summaries during drain);
    /// ignores the closed flag so the final summary is not lost.
    fn submit_internal(&self, event: DbEvent) -> SubmitResult {
        self.enqueue(event, true)
    }

    fn enqueue(&self, mut event: DbEvent, internal: bool) -> SubmitResult {
        // Raw literals never leave the process; masking is idempotent
        // so an already-fingerprinted statement is untouched.
        event.mask_sql_fields();

        let mut state = self.lock_state();
        if state.closed && !internal {
            self.count_drop(1);
            return SubmitResult::Dropped;
        }

        if state.buf.len() >= self.capacity {
            if event.is_droppable() {
                self.count_drop(1);
                return SubmitResult::Dropped;
            }
            // Keep the newest: evict the oldest droppable event to
            // make room for one that must not be lost.
            if let Some(pos) = state.buf.iter().position(|e| e.event.is_droppable()) {
                state.buf.remove(pos);
                self.count_drop(1);
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.buf.push_back(SequencedEvent {
            seq,
            ts: chrono::Utc::now(),
            event,
        });
        drop(state);

        self.notify.notify_one();
        SubmitResult::Accepted
    }

    /// Drain up to `max` events, waiting at most `timeout` for the
    /// batch to fill. May return an empty batch on timeout or after
    /// close.
    pub async fn next_batch(&self, max: usize, timeout: Duration) -> Vec<SequencedEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut batch = Vec::new();

        loop {
            let closed = {
                let mut state = self.lock_state();
                while batch.len() < max {
                    match state.buf.pop_front() {
                        Some(event) => batch.push(event),
                        None => break,
                    }
                }
                state.closed
            };

            if batch.len() >= max || closed || tokio::time::Instant::now() >= deadline {
                return batch;
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Stop accepting events. Whatever is queued stays drainable.
    pub fn close(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    pub fn pending(&self) -> usize {
        self.lock_state().buf.len()
    }

    /// Drops accumulated since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped_pending.swap(0, Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    fn count_drop(&self, n: u64) {
        self.dropped_pending.fetch_add(n, Ordering::Relaxed);
        self.dropped_total.fetch_add(n, Ordering::Relaxed);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Consumer task: batches events out of the collector and into the
/// sink, retrying transient failures with exponential backoff while
/// producers keep submitting.
pub async fn run_consumer(
    collector: Arc<MetricsCollector>,
    sink: Arc<dyn Sink>,
    batch_size: usize,
    batch_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let dropped = collector.take_dropped();
        if dropped > 0 {
            collector.submit_internal(DbEvent::DropSummary { dropped });
        }

        let batch = collector.next_batch(batch_size, batch_timeout).await;
        if batch.is_empty() {
            if collector.is_closed() {
                // Surface any drops counted after close, then stop.
                let dropped = collector.take_dropped();
                if dropped == 0 {
                    break;
                }
                collector.submit_internal(DbEvent::DropSummary { dropped });
            }
            continue;
        }

        deliver_with_retry(sink.as_ref(), &batch, &mut shutdown).await;
    }
    debug!("Collector consumer exited");
}

async fn deliver_with_retry(
    sink: &dyn Sink,
    batch: &[SequencedEvent],
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        match sink.deliver(batch).await {
            Delivery::Ok => return,
            Delivery::Fatal(reason) => {
                warn!(
                    "Sink {} rejected batch of {} events: {}",
                    sink.name(),
                    batch.len(),
                    reason
                );
                return;
            }
            Delivery::Transient(reason) => {
                if *shutdown.borrow() {
                    warn!(
                        "Dropping batch of {} events on shutdown after transient failure: {}",
                        batch.len(),
                        reason
                    );
                    return;
                }
                attempt += 1;
                let delay = backoff_delay(attempt);
                warn!(
                    "Sink {} transient failure (attempt {}): {}, retrying in {:?}",
                    sink.name(),
                    attempt,
                    reason,
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

/// Exponential backoff with full jitter: uniform in [0, min(base *
/// 2^(attempt-1), cap)].
fn backoff_delay(attempt: u32) -> Duration {
    let ceiling = BACKOFF_BASE_MS
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{QueryEventBody, QueryStatus, TxOutcome};
    use crate::sql::StatementKind;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    fn query_event(status: QueryStatus) -> DbEvent {
        DbEvent::QueryExecuted(QueryEventBody {
            conn_id: "c1".to_string(),
            tx_id: None,
            sql_fingerprint: "SELECT ?".to_string(),
            kind: StatementKind::Select,
            duration_ms: 1,
            row_count: None,
            status,
            error_kind: None,
            error_message: None,
            param_count: None,
        })
    }

    fn ended_event() -> DbEvent {
        DbEvent::TransactionEnded {
            tx_id: "tx-00000001".to_string(),
            outcome: TxOutcome::Committed,
        }
    }

    struct RecordingSink {
        batches: StdMutex<Vec<Vec<SequencedEvent>>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: StdMutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<SequencedEvent> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn deliver(&self, batch: &[SequencedEvent]) -> Delivery {
            self.batches.lock().unwrap().push(batch.to_vec());
            Delivery::Ok
        }
    }

    struct FlakySink {
        failures_left: StdMutex<u32>,
        delivered: StdMutex<Vec<SequencedEvent>>,
    }

    #[async_trait]
    impl Sink for FlakySink {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn deliver(&self, batch: &[SequencedEvent]) -> Delivery {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Delivery::Transient("simulated outage".to_string());
            }
            self.delivered.lock().unwrap().extend(batch.to_vec());
            Delivery::Ok
        }
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let collector = MetricsCollector::new(16, 1.0);
        for _ in 0..5 {
            assert_eq!(collector.submit(ended_event()), SubmitResult::Accepted);
        }
        let state = collector.lock_state();
        let seqs: Vec<u64> = state.buf.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_droppable_shed_at_capacity() {
        let collector = MetricsCollector::new(2, 1.0);
        assert_eq!(
            collector.submit(query_event(QueryStatus::Ok)),
            SubmitResult::Accepted
        );
        assert_eq!(
            collector.submit(query_event(QueryStatus::Ok)),
            SubmitResult::Accepted
        );
        assert_eq!(
            collector.submit(query_event(QueryStatus::Ok)),
            SubmitResult::Dropped
        );
        assert_eq!(collector.take_dropped(), 1);
        assert_eq!(collector.pending(), 2);
    }

    #[test]
    fn test_critical_event_evicts_oldest_droppable() {
        let collector = MetricsCollector::new(2, 1.0);
        collector.submit(query_event(QueryStatus::Ok));
        collector.submit(query_event(QueryStatus::Ok));

        assert_eq!(collector.submit(ended_event()), SubmitResult::Accepted);
        assert_eq!(collector.take_dropped(), 1);

        let state = collector.lock_state();
        // The eviction took the oldest query; the lifecycle event is in.
        assert_eq!(state.buf.len(), 2);
        assert_eq!(state.buf.back().unwrap().event.name(), "TransactionEnded");
    }

    #[test]
    fn test_error_queries_are_not_droppable() {
        let collector = MetricsCollector::new(1, 1.0);
        collector.submit(ended_event());
        // Queue full of non-droppable events: the error query still
        // enters (capacity is a soft bound for critical traffic).
        assert_eq!(
            collector.submit(query_event(QueryStatus::Error)),
            SubmitResult::Accepted
        );
        assert_eq!(collector.pending(), 2);
    }

    #[test]
    fn test_sampling_zero_keeps_critical_events() {
        let collector = MetricsCollector::new(16, 0.0);
        assert_eq!(
            collector.submit(query_event(QueryStatus::Ok)),
            SubmitResult::SampledOut
        );
        assert_eq!(
            collector.submit(query_event(QueryStatus::Error)),
            SubmitResult::Accepted
        );
        assert_eq!(collector.submit(ended_event()), SubmitResult::Accepted);
        // Sampled-out events are not drops.
        assert_eq!(collector.take_dropped(), 0);
    }

    #[test]
    fn test_submit_after_close_is_dropped() {
        let collector = MetricsCollector::new(16, 1.0);
        collector.close();
        assert_eq!(collector.submit(ended_event()), SubmitResult::Dropped);
    }

    #[test]
    fn test_masking_applied_on_submit() {
        let collector = MetricsCollector::new(16, 1.0);
        let mut body = match query_event(QueryStatus::Ok) {
            DbEvent::QueryExecuted(body) => body,
            _ => unreachable!(),
        };
        body.sql_fingerprint = "SELECT * FROM t WHERE id = 99".to_string();
        collector.submit(DbEvent::QueryExecuted(body));

        let state = collector.lock_state();
        match &state.buf.front().unwrap().event {
            DbEvent::QueryExecuted(body) => {
                assert_eq!(body.sql_fingerprint, "SELECT * FROM t WHERE id = ?");
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_batch_respects_size_limit() {
        let collector = MetricsCollector::new(64, 1.0);
        for _ in 0..10 {
            collector.submit(ended_event());
        }
        let batch = collector.next_batch(4, Duration::from_millis(10)).await;
        assert_eq!(batch.len(), 4);
        assert_eq!(collector.pending(), 6);
    }

    #[tokio::test]
    async fn test_batch_times_out_empty() {
        let collector = MetricsCollector::new(64, 1.0);
        let batch = collector.next_batch(4, Duration::from_millis(10)).await;
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_consumer_delivers_and_summarizes_drops() {
        let collector = Arc::new(MetricsCollector::new(2, 1.0));
        let sink = RecordingSink::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Burst past capacity before the consumer starts.
        for _ in 0..5 {
            collector.submit(query_event(QueryStatus::Ok));
        }

        let consumer = tokio::spawn(run_consumer(
            collector.clone(),
            sink.clone(),
            10,
            Duration::from_millis(20),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = shutdown_tx.send(true);
        collector.close();
        consumer.await.unwrap();

        let events = sink.events();
        let delivered_queries = events
            .iter()
            .filter(|e| e.event.name() == "QueryExecuted")
            .count();
        let summarized: u64 = events
            .iter()
            .filter_map(|e| match &e.event {
                DbEvent::DropSummary { dropped } => Some(*dropped),
                _ => None,
            })
            .sum();

        assert_eq!(delivered_queries, 2);
        assert_eq!(summarized, 3);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_until_delivered() {
        let collector = Arc::new(MetricsCollector::new(16, 1.0));
        let sink = Arc::new(FlakySink {
            failures_left: StdMutex::new(2),
            delivered: StdMutex::new(Vec::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        collector.submit(ended_event());

        let consumer = tokio::spawn(run_consumer(
            collector.clone(),
            sink.clone(),
            10,
            Duration::from_millis(10),
            shutdown_rx,
        ));

        // Enough time for two backoff rounds (base 100ms, jittered).
        tokio::time::sleep(Duration::from_millis(600)).await;
        let _ = shutdown_tx.send(true);
        collector.close();
        consumer.await.unwrap();

        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }
}
