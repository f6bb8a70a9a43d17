//! The consumer loop: transport deliveries through the inbox filter.
//!
//! One loop per subscription; messages are processed strictly sequentially
//! in arrival order, which preserves per-partition FIFO. The offset is
//! acknowledged only when the inbox says so, never for a delivery whose
//! handler failed within its attempt budget.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use dead_letter::{DeadLetterStore, NewDeadLetter};
use idempotent_inbox::InboxFilter;
use message_transport::{Delivery, Subscription};

pub struct ConsumerLoop<Sub, D>
where
    Sub: Subscription,
    D: DeadLetterStore,
{
    subscription: Arc<Sub>,
    inbox: Arc<InboxFilter<D>>,
    dlq: Arc<D>,
    dlq_enabled: bool,
    service_name: String,
}

impl<Sub, D> ConsumerLoop<Sub, D>
where
    Sub: Subscription,
    D: DeadLetterStore,
{
    pub fn new(
        subscription: Arc<Sub>,
        inbox: Arc<InboxFilter<D>>,
        dlq: Arc<D>,
        dlq_enabled: bool,
        service_name: String,
    ) -> Self {
        Self {
            subscription,
            inbox,
            dlq,
            dlq_enabled,
            service_name,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(service = %self.service_name, "Consumer loop starting");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Consumer loop shutting down");
                    break;
                }
                delivery = self.subscription.recv() => {
                    match delivery {
                        Ok(delivery) => {
                            if let Err(e) = self.handle_delivery(&delivery).await {
                                error!(
                                    topic = %delivery.topic,
                                    offset = delivery.offset,
                                    error = %e,
                                    "Delivery handling failed; offset not committed"
                                );
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Transport receive failed; backing off");
                            sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    pub(crate) async fn handle_delivery(&self, delivery: &Delivery) -> anyhow::Result<()> {
        match &delivery.decoded {
            Ok(envelope) => {
                let outcome = self.inbox.accept(envelope).await?;
                debug!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    outcome = ?outcome,
                    "Delivery admitted through inbox"
                );
                if outcome.should_ack() {
                    self.subscription.ack(delivery)?;
                }
                Ok(())
            }
            Err(decode_error) => {
                // Malformed input never retries: quarantine and move on.
                if self.dlq_enabled {
                    self.dlq
                        .enqueue(NewDeadLetter::from_raw(
                            &delivery.value,
                            Some(decode_error.to_string()),
                            &self.service_name,
                        ))
                        .await?;
                } else {
                    warn!(
                        topic = %delivery.topic,
                        offset = delivery.offset,
                        error = %decode_error,
                        "DLQ disabled; dropping malformed message"
                    );
                }
                self.subscription.ack(delivery)?;
                Ok(())
            }
        }
    }
}
