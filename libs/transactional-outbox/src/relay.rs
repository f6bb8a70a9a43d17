//! Background relay: claims outbox batches and publishes them.
//!
//! Claimed entries are published strictly sequentially, so within one
//! aggregate key the transport sees insertion order: the claim is ordered by
//! `occurred_at`, the key routes to a single partition, and nothing here
//! publishes out of turn. A crash mid-batch leaves the lease to expire and
//! the unpublished remainder re-enters the claim set.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use dead_letter::{reason, DeadLetterStore, NewDeadLetter};
use event_schema::topics;
use message_transport::Transport;

use crate::metrics::OutboxMetrics;
use crate::{OutboxMessage, OutboxResult, OutboxStore};

#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_retries: i32,
    pub lease_ttl: Duration,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    pub topic_prefix: String,
    pub service_name: String,
    pub dlq_enabled: bool,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            max_retries: 5,
            lease_ttl: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            topic_prefix: "mercato".to_string(),
            service_name: "unknown".to_string(),
            dlq_enabled: true,
        }
    }
}

pub struct OutboxRelay<S, T, D>
where
    S: OutboxStore,
    T: Transport,
    D: DeadLetterStore,
{
    store: Arc<S>,
    transport: Arc<T>,
    dlq: Arc<D>,
    config: OutboxRelayConfig,
    metrics: Option<OutboxMetrics>,
}

impl<S, T, D> OutboxRelay<S, T, D>
where
    S: OutboxStore,
    T: Transport,
    D: DeadLetterStore,
{
    pub fn new(store: Arc<S>, transport: Arc<T>, dlq: Arc<D>, config: OutboxRelayConfig) -> Self {
        Self {
            store,
            transport,
            dlq,
            config,
            metrics: None,
        }
    }

    /// Attach Prometheus gauges updated each polling cycle.
    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Poll-publish loop. Runs until the shutdown channel flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = %self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "Outbox relay starting"
        );

        loop {
            match self.process_batch().await {
                Ok(count) if count > 0 => {
                    info!(published_count = count, "Published events from outbox");
                }
                Ok(_) => debug!("No outbox events to publish"),
                Err(e) => error!(error = %e, "Outbox relay batch failed"),
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.store.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }

            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {
                    info!("Outbox relay shutting down");
                    break;
                }
            }
        }
    }

    /// Claim and publish one batch. Returns the number published.
    pub async fn process_batch(&self) -> OutboxResult<usize> {
        let batch = self
            .store
            .claim(self.config.batch_size, self.config.lease_ttl)
            .await?;

        let mut published = 0;

        for message in batch {
            // Entries that exhausted their budget before we saw them (e.g.,
            // a crash between the final failure and the DLQ move).
            if message.retry_count >= self.config.max_retries {
                self.move_to_dlq(&message, reason::MAX_RETRIES_EXCEEDED, message.last_error.clone())
                    .await?;
                continue;
            }

            let topic = topics::topic_for_event(&self.config.topic_prefix, &message.event_type);
            let envelope = message.to_envelope();

            match self.transport.publish(&topic, &envelope).await {
                Ok(()) => {
                    self.store.mark_processed(message.id).await?;
                    published += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.published.inc();
                    }
                }
                Err(e) if e.is_retriable() => {
                    let attempt = message.retry_count + 1;
                    if attempt >= self.config.max_retries {
                        warn!(
                            event_id = %message.id,
                            attempt,
                            error = %e,
                            "Outbox entry exhausted retries"
                        );
                        self.move_to_dlq(
                            &message,
                            reason::MAX_RETRIES_EXCEEDED,
                            Some(e.to_string()),
                        )
                        .await?;
                    } else {
                        let backoff = calculate_backoff(
                            self.config.retry_backoff,
                            self.config.max_backoff,
                            message.retry_count,
                        );
                        self.store
                            .record_failure(message.id, &e.to_string(), backoff)
                            .await?;
                    }
                }
                Err(e) => {
                    // Validation rejection: no retry can succeed.
                    warn!(event_id = %message.id, error = %e, "Outbox entry rejected by transport");
                    self.move_to_dlq(&message, reason::MALFORMED, Some(e.to_string()))
                        .await?;
                }
            }
        }

        Ok(published)
    }

    /// Quarantine the entry and remove it from the active set.
    async fn move_to_dlq(
        &self,
        message: &OutboxMessage,
        failure_reason: &str,
        error_details: Option<String>,
    ) -> OutboxResult<()> {
        if self.config.dlq_enabled {
            let entry = NewDeadLetter::from_envelope(
                &message.to_envelope(),
                failure_reason,
                error_details,
                message.retry_count,
                &self.config.service_name,
            );
            self.dlq.enqueue(entry).await?;
            if let Some(metrics) = &self.metrics {
                metrics.dead_lettered.inc();
            }
        } else {
            warn!(
                event_id = %message.id,
                "DLQ disabled; dropping exhausted outbox entry from active set"
            );
        }

        self.store.mark_processed(message.id).await
    }
}

/// Exponential backoff: base doubled per prior failure, capped.
fn calculate_backoff(base: Duration, max: Duration, retry_count: i32) -> Duration {
    if retry_count < 0 {
        return base.min(max);
    }

    let shift = retry_count.clamp(0, 16) as u32;
    let multiplier = 1_u32 << shift;
    let backoff = base.saturating_mul(multiplier);
    if backoff > max {
        max
    } else {
        backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dead_letter::{DeadLetterEntry, DeadLetterFilter, DeadLetterResult};
    use event_schema::EventEnvelope;
    use message_transport::{TransportError, TransportResult};
    use serde_json::json;
    use sqlx::{Postgres, Transaction};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(30);

        assert_eq!(calculate_backoff(base, max, 0), Duration::from_millis(500));
        assert_eq!(calculate_backoff(base, max, 1), Duration::from_secs(1));
        assert_eq!(calculate_backoff(base, max, 2), Duration::from_secs(2));
        assert_eq!(calculate_backoff(base, max, 6), Duration::from_secs(30));
        assert_eq!(calculate_backoff(base, max, 16), Duration::from_secs(30));
        assert_eq!(calculate_backoff(base, max, -1), Duration::from_millis(500));
    }

    /// In-memory store scripted for relay behavior tests.
    #[derive(Default)]
    struct FakeStore {
        claimable: Mutex<VecDeque<OutboxMessage>>,
        processed: Mutex<Vec<Uuid>>,
        failures: Mutex<Vec<(Uuid, String)>>,
    }

    #[async_trait]
    impl OutboxStore for FakeStore {
        async fn append(
            &self,
            _tx: &mut Transaction<'_, Postgres>,
            _message: &OutboxMessage,
        ) -> OutboxResult<()> {
            unreachable!("relay tests never append")
        }

        async fn claim(
            &self,
            batch_size: i64,
            _lease_ttl: Duration,
        ) -> OutboxResult<Vec<OutboxMessage>> {
            let mut claimable = self.claimable.lock().unwrap();
            let take = (batch_size as usize).min(claimable.len());
            Ok(claimable.drain(..take).collect())
        }

        async fn mark_processed(&self, id: Uuid) -> OutboxResult<()> {
            self.processed.lock().unwrap().push(id);
            Ok(())
        }

        async fn record_failure(
            &self,
            id: Uuid,
            error: &str,
            _retry_in: Duration,
        ) -> OutboxResult<()> {
            self.failures.lock().unwrap().push((id, error.to_string()));
            Ok(())
        }

        async fn release_expired_leases(&self) -> OutboxResult<u64> {
            Ok(0)
        }

        async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
            Ok((self.claimable.lock().unwrap().len() as i64, 0))
        }
    }

    /// Transport that fails the first `fail_first` publishes.
    struct FlakyTransport {
        fail_first: Mutex<usize>,
        published: Mutex<Vec<(String, EventEnvelope)>>,
    }

    impl FlakyTransport {
        fn new(fail_first: usize) -> Self {
            Self {
                fail_first: Mutex::new(fail_first),
                published: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> TransportResult<()> {
            let mut remaining = self.fail_first.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Retriable("broker timeout".to_string()));
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), envelope.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeDlq {
        entries: Mutex<Vec<NewDeadLetter>>,
    }

    #[async_trait]
    impl DeadLetterStore for FakeDlq {
        async fn enqueue(&self, entry: NewDeadLetter) -> DeadLetterResult<Uuid> {
            self.entries.lock().unwrap().push(entry);
            Ok(Uuid::new_v4())
        }

        async fn list(&self, _f: DeadLetterFilter) -> DeadLetterResult<Vec<DeadLetterEntry>> {
            Ok(Vec::new())
        }

        async fn load(&self, id: Uuid) -> DeadLetterResult<DeadLetterEntry> {
            Err(dead_letter::DeadLetterError::NotFound(id))
        }

        async fn mark_reprocessed(
            &self,
            _id: Uuid,
            _notes: Option<String>,
        ) -> DeadLetterResult<()> {
            Ok(())
        }

        async fn depth(&self, _service: &str) -> DeadLetterResult<i64> {
            Ok(self.entries.lock().unwrap().len() as i64)
        }
    }

    fn relay_under_test(
        store: Arc<FakeStore>,
        transport: Arc<FlakyTransport>,
        dlq: Arc<FakeDlq>,
    ) -> OutboxRelay<FakeStore, FlakyTransport, FakeDlq> {
        OutboxRelay::new(
            store,
            transport,
            dlq,
            OutboxRelayConfig {
                service_name: "order-service".to_string(),
                ..Default::default()
            },
        )
    }

    fn queued_message(event_type: &str, key: &str, retry_count: i32) -> OutboxMessage {
        let mut message =
            OutboxMessage::new(event_type, key, Uuid::new_v4(), json!({"k": key}));
        message.retry_count = retry_count;
        message
    }

    #[tokio::test]
    async fn publishes_batch_in_order_and_marks_processed() {
        let store = Arc::new(FakeStore::default());
        let transport = Arc::new(FlakyTransport::new(0));
        let dlq = Arc::new(FakeDlq::default());

        let first = queued_message("order.submitted", "order-1", 0);
        let second = queued_message("order.confirmed", "order-1", 0);
        store
            .claimable
            .lock()
            .unwrap()
            .extend([first.clone(), second.clone()]);

        let relay = relay_under_test(store.clone(), transport.clone(), dlq);
        let published = relay.process_batch().await.unwrap();

        assert_eq!(published, 2);
        let sent = transport.published.lock().unwrap();
        assert_eq!(sent[0].1.event_id, first.id);
        assert_eq!(sent[1].1.event_id, second.id);
        assert_eq!(sent[0].0, "mercato.order.events");
        assert_eq!(*store.processed.lock().unwrap(), vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn retriable_failure_records_and_leaves_row_active() {
        let store = Arc::new(FakeStore::default());
        let transport = Arc::new(FlakyTransport::new(1));
        let dlq = Arc::new(FakeDlq::default());

        let message = queued_message("payment.charge", "order-2", 0);
        store.claimable.lock().unwrap().push_back(message.clone());

        let relay = relay_under_test(store.clone(), transport, dlq.clone());
        let published = relay.process_batch().await.unwrap();

        assert_eq!(published, 0);
        assert!(store.processed.lock().unwrap().is_empty());
        let failures = store.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, message.id);
        assert!(dlq.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_at_retry_budget_moves_to_dlq() {
        let store = Arc::new(FakeStore::default());
        let transport = Arc::new(FlakyTransport::new(1));
        let dlq = Arc::new(FakeDlq::default());

        // retry_count == max_retries - 1: one more attempt is made, and its
        // failure crosses the budget.
        let message = queued_message("payment.charge", "order-2", 4);
        store.claimable.lock().unwrap().push_back(message.clone());

        let relay = relay_under_test(store.clone(), transport, dlq.clone());
        relay.process_batch().await.unwrap();

        let entries = dlq.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].failure_reason, reason::MAX_RETRIES_EXCEEDED);
        assert_eq!(entries[0].original_event_id, Some(message.id));
        // Removed from the active set.
        assert_eq!(*store.processed.lock().unwrap(), vec![message.id]);
    }

    #[tokio::test]
    async fn below_budget_entry_gets_another_attempt() {
        let store = Arc::new(FakeStore::default());
        let transport = Arc::new(FlakyTransport::new(0));
        let dlq = Arc::new(FakeDlq::default());

        let message = queued_message("payment.charge", "order-2", 3);
        store.claimable.lock().unwrap().push_back(message.clone());

        let relay = relay_under_test(store.clone(), transport.clone(), dlq.clone());
        let published = relay.process_batch().await.unwrap();

        assert_eq!(published, 1);
        assert!(dlq.entries.lock().unwrap().is_empty());
        assert_eq!(transport.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_entry_claimed_after_crash_goes_to_dlq() {
        let store = Arc::new(FakeStore::default());
        let transport = Arc::new(FlakyTransport::new(0));
        let dlq = Arc::new(FakeDlq::default());

        let message = queued_message("payment.charge", "order-2", 5);
        store.claimable.lock().unwrap().push_back(message.clone());

        let relay = relay_under_test(store.clone(), transport.clone(), dlq.clone());
        let published = relay.process_batch().await.unwrap();

        assert_eq!(published, 0);
        assert!(transport.published.lock().unwrap().is_empty());
        assert_eq!(dlq.entries.lock().unwrap().len(), 1);
    }
}
