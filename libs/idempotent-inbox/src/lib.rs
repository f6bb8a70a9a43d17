//! # Idempotent Inbox
//!
//! The receive-side idempotence boundary. Every consumed event lands in
//! `inbox_messages` keyed by its unique `event_id`; the handler runs inside
//! the same database transaction that marks the row processed, so the domain
//! effect of one logical event happens exactly once no matter how many times
//! the transport delivers it.
//!
//! The transport offset is acknowledged only after that transaction commits.
//! A crash between commit and ack causes redelivery, which hits the
//! processed row and is dropped as a duplicate.
//!
//! ## Flow
//!
//! ```text
//! Kafka → Subscription.recv → InboxFilter.accept → HandlerRegistry
//!                                   │                    │
//!                          insert-or-conflict     handler tx (domain
//!                          on event_id            writes + outbox appends
//!                                                 + processed_at mark)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use dead_letter::{reason, DeadLetterStore, NewDeadLetter};
use event_schema::EventEnvelope;

mod error;
pub mod handler;
pub mod metrics;

pub use error::{HandlerError, InboxError, InboxResult};
pub use handler::{EventHandler, HandlerRegistry};

/// One received event and its processing bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub correlation_id: Uuid,
}

/// What `accept` did with a delivery. Every variant except `Failed` means
/// the caller should acknowledge the transport offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// First delivery: handler ran and its transaction committed.
    Processed,
    /// Already processed (or processed concurrently). Dropped.
    Duplicate,
    /// No handler registered for this event type. Recorded and dropped.
    Unhandled,
    /// Handler failed within the attempt budget; the transport will redeliver.
    Failed(String),
    /// Attempt budget exhausted; quarantined and closed.
    DeadLettered,
}

impl AcceptOutcome {
    /// Whether the transport offset should be committed for this delivery.
    pub fn should_ack(&self) -> bool {
        !matches!(self, AcceptOutcome::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct InboxConfig {
    pub service_name: String,
    pub max_attempts: i32,
    /// How long processed rows are kept before compaction.
    pub retention: Duration,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            max_attempts: 5,
            retention: Duration::from_secs(7 * 86400),
        }
    }
}

/// Deduplicating gate in front of the handler registry.
pub struct InboxFilter<D: DeadLetterStore> {
    pool: PgPool,
    registry: Arc<HandlerRegistry>,
    dlq: Arc<D>,
    config: InboxConfig,
    metrics: Option<metrics::InboxMetrics>,
}

impl<D: DeadLetterStore> InboxFilter<D> {
    pub fn new(
        pool: PgPool,
        registry: Arc<HandlerRegistry>,
        dlq: Arc<D>,
        config: InboxConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            dlq,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: metrics::InboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Admit one delivery.
    ///
    /// `accept(e)` after `accept(e)` is a no-op: the second call sees the
    /// processed row and returns [`AcceptOutcome::Duplicate`].
    pub async fn accept(&self, envelope: &EventEnvelope) -> InboxResult<AcceptOutcome> {
        // Record receipt. The row survives failed attempts so the attempt
        // counter is meaningful across redeliveries.
        let inserted = sqlx::query(
            r#"
            INSERT INTO inbox_messages (
                id, event_id, event_type, payload, received_at, attempts, correlation_id
            ) VALUES ($1, $2, $3, $4, NOW(), 0, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(envelope.event_id)
        .bind(&envelope.event_type)
        .bind(&envelope.payload)
        .bind(envelope.correlation_id)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            let row = sqlx::query(
                "SELECT processed_at, attempts FROM inbox_messages WHERE event_id = $1",
            )
            .bind(envelope.event_id)
            .fetch_one(&self.pool)
            .await?;

            let processed_at: Option<DateTime<Utc>> = row.try_get("processed_at")?;
            if processed_at.is_some() {
                debug!(event_id = %envelope.event_id, "Duplicate delivery dropped");
                if let Some(metrics) = &self.metrics {
                    metrics.duplicates.inc();
                }
                return Ok(AcceptOutcome::Duplicate);
            }

            let attempts: i32 = row.try_get("attempts")?;
            if attempts >= self.config.max_attempts {
                return self.quarantine(envelope).await;
            }
            // Redelivery of a previously failed event: fall through and retry.
        }

        self.try_handle(envelope).await
    }

    async fn try_handle(&self, envelope: &EventEnvelope) -> InboxResult<AcceptOutcome> {
        let Some(handler) = self.registry.get(&envelope.event_type) else {
            // Topics carry event types a given consumer does not care about;
            // close the row so they are not redelivered forever.
            debug!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                "No handler registered; closing inbox entry"
            );
            self.close_row(envelope.event_id).await?;
            return Ok(AcceptOutcome::Unhandled);
        };

        let mut tx = self.pool.begin().await?;

        // Claim the row inside the handler transaction. Losing the race
        // (another consumer instance finished first) rolls everything back.
        let claimed = sqlx::query(
            r#"
            UPDATE inbox_messages
            SET processed_at = NOW()
            WHERE event_id = $1
              AND processed_at IS NULL
            "#,
        )
        .bind(envelope.event_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !claimed {
            tx.rollback().await?;
            if let Some(metrics) = &self.metrics {
                metrics.duplicates.inc();
            }
            return Ok(AcceptOutcome::Duplicate);
        }

        match handler.handle(&mut tx, envelope).await {
            Ok(()) => {
                tx.commit().await?;
                if let Some(metrics) = &self.metrics {
                    metrics.processed.inc();
                }
                debug!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    "Event processed"
                );
                Ok(AcceptOutcome::Processed)
            }
            Err(HandlerError::Fatal(detail)) => {
                tx.rollback().await?;
                warn!(
                    event_id = %envelope.event_id,
                    error = %detail,
                    "Handler failed fatally; quarantining"
                );
                self.record_attempt(envelope.event_id, &detail).await?;
                self.quarantine_with_reason(envelope, reason::HANDLER_ERROR, &detail)
                    .await
            }
            Err(HandlerError::Retriable(detail)) => {
                tx.rollback().await?;
                let attempts = self.record_attempt(envelope.event_id, &detail).await?;
                if attempts >= self.config.max_attempts {
                    return self.quarantine(envelope).await;
                }
                warn!(
                    event_id = %envelope.event_id,
                    attempts,
                    error = %detail,
                    "Handler failed; awaiting redelivery"
                );
                Ok(AcceptOutcome::Failed(detail))
            }
        }
    }

    /// Increment the attempt counter outside the rolled-back transaction.
    async fn record_attempt(&self, event_id: Uuid, error: &str) -> InboxResult<i32> {
        let row = sqlx::query(
            r#"
            UPDATE inbox_messages
            SET attempts = attempts + 1,
                last_error = $2
            WHERE event_id = $1
            RETURNING attempts
            "#,
        )
        .bind(event_id)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("attempts")?)
    }

    async fn quarantine(&self, envelope: &EventEnvelope) -> InboxResult<AcceptOutcome> {
        let detail = format!("attempt budget of {} exhausted", self.config.max_attempts);
        self.quarantine_with_reason(envelope, reason::MAX_ATTEMPTS_EXCEEDED, &detail)
            .await
    }

    async fn quarantine_with_reason(
        &self,
        envelope: &EventEnvelope,
        failure_reason: &str,
        detail: &str,
    ) -> InboxResult<AcceptOutcome> {
        let attempts = self.current_attempts(envelope.event_id).await?;

        self.dlq
            .enqueue(NewDeadLetter::from_envelope(
                envelope,
                failure_reason,
                Some(detail.to_string()),
                attempts,
                &self.config.service_name,
            ))
            .await?;

        // Close the row so the transport stops redelivering.
        self.close_row(envelope.event_id).await?;

        if let Some(metrics) = &self.metrics {
            metrics.dead_lettered.inc();
        }

        info!(
            event_id = %envelope.event_id,
            failure_reason = %failure_reason,
            attempts,
            "Event quarantined"
        );

        Ok(AcceptOutcome::DeadLettered)
    }

    async fn current_attempts(&self, event_id: Uuid) -> InboxResult<i32> {
        let row = sqlx::query("SELECT attempts FROM inbox_messages WHERE event_id = $1")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("attempts")?)
    }

    async fn close_row(&self, event_id: Uuid) -> InboxResult<()> {
        sqlx::query(
            "UPDATE inbox_messages SET processed_at = NOW() WHERE event_id = $1 AND processed_at IS NULL",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rows received but never processed, oldest first. The recovery worker
    /// re-drives these through the registry when the transport has gone
    /// quiet (e.g., the redelivery that should retry them was already acked
    /// by a crashed predecessor).
    pub async fn find_unprocessed(&self, limit: i64) -> InboxResult<Vec<InboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, event_type, payload, received_at,
                   processed_at, attempts, last_error, correlation_id
            FROM inbox_messages
            WHERE processed_at IS NULL
              AND attempts < $2
            ORDER BY received_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(self.config.max_attempts)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(InboxMessage {
                    id: row.try_get("id")?,
                    event_id: row.try_get("event_id")?,
                    event_type: row.try_get("event_type")?,
                    payload: row.try_get("payload")?,
                    received_at: row.try_get("received_at")?,
                    processed_at: row.try_get("processed_at")?,
                    attempts: row.try_get("attempts")?,
                    last_error: row.try_get("last_error")?,
                    correlation_id: row.try_get("correlation_id")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }

    /// Re-drive stalled unprocessed rows through their handlers. Returns the
    /// number that reached a terminal outcome (processed or quarantined).
    pub async fn redispatch_unprocessed(&self, limit: i64) -> InboxResult<u64> {
        let stalled = self.find_unprocessed(limit).await?;
        let mut resolved = 0;

        for message in stalled {
            // The stored columns are what the handler contract needs; the
            // routing fields were only meaningful on the wire.
            let envelope = EventEnvelope {
                event_id: message.event_id,
                correlation_id: message.correlation_id,
                causation_id: None,
                event_type: message.event_type.clone(),
                aggregate_key: message.correlation_id.to_string(),
                occurred_at: message.received_at,
                schema_version: event_schema::SCHEMA_VERSION,
                payload: message.payload.clone(),
                extra_headers: Default::default(),
            };

            match self.try_handle(&envelope).await? {
                AcceptOutcome::Processed
                | AcceptOutcome::Duplicate
                | AcceptOutcome::Unhandled
                | AcceptOutcome::DeadLettered => resolved += 1,
                AcceptOutcome::Failed(_) => {}
            }
        }

        Ok(resolved)
    }

    /// Compact processed rows older than the retention window.
    pub async fn cleanup_processed(&self) -> InboxResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .map_err(|e| InboxError::InvalidConfig(e.to_string()))?;

        let result = sqlx::query(
            r#"
            DELETE FROM inbox_messages
            WHERE processed_at IS NOT NULL
              AND processed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Compacted processed inbox rows");
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_policy_follows_outcome() {
        assert!(AcceptOutcome::Processed.should_ack());
        assert!(AcceptOutcome::Duplicate.should_ack());
        assert!(AcceptOutcome::Unhandled.should_ack());
        assert!(AcceptOutcome::DeadLettered.should_ack());
        assert!(!AcceptOutcome::Failed("boom".to_string()).should_ack());
    }

    #[test]
    fn default_config_matches_budgets() {
        let config = InboxConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retention, Duration::from_secs(7 * 86400));
    }
}
