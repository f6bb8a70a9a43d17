//! Host-side recovery sweeps and scheduled jobs.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

use async_trait::async_trait;
use dead_letter::DeadLetterStore;
use idempotent_inbox::InboxFilter;
use saga_core::RecoverySweep;
use transactional_outbox::OutboxStore;

/// Clears expired outbox leases left by a crashed relay, making the backlog
/// visible again for the next claim.
pub struct OutboxLeaseSweep<S: OutboxStore> {
    store: Arc<S>,
}

impl<S: OutboxStore> OutboxLeaseSweep<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: OutboxStore> RecoverySweep for OutboxLeaseSweep<S> {
    fn name(&self) -> &str {
        "outbox-expired-leases"
    }

    async fn sweep(&self) -> anyhow::Result<u64> {
        Ok(self.store.release_expired_leases().await?)
    }
}

/// Re-drives inbox rows that were received but never processed.
pub struct InboxRedispatchSweep<D: DeadLetterStore> {
    filter: Arc<InboxFilter<D>>,
    batch_size: i64,
}

impl<D: DeadLetterStore> InboxRedispatchSweep<D> {
    pub fn new(filter: Arc<InboxFilter<D>>, batch_size: i64) -> Self {
        Self { filter, batch_size }
    }
}

#[async_trait]
impl<D: DeadLetterStore + 'static> RecoverySweep for InboxRedispatchSweep<D> {
    fn name(&self) -> &str {
        "inbox-redispatch"
    }

    async fn sweep(&self) -> anyhow::Result<u64> {
        Ok(self.filter.redispatch_unprocessed(self.batch_size).await?)
    }
}

/// Periodic compaction of old processed inbox rows.
pub async fn run_inbox_compaction<D: DeadLetterStore>(
    filter: Arc<InboxFilter<D>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Inbox compaction job starting");

    loop {
        tokio::select! {
            _ = sleep(interval) => {
                match filter.cleanup_processed().await {
                    Ok(deleted) if deleted > 0 => {
                        info!(deleted, "Inbox compaction removed processed rows");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Inbox compaction failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("Inbox compaction job shutting down");
                break;
            }
        }
    }
}
