//! # Transactional Outbox
//!
//! Makes event publication atomic with local state changes: events are
//! inserted into `outbox_messages` inside the same database transaction that
//! mutated domain state, and a background relay publishes them to the
//! transport afterwards. If the transaction rolls back, the event was never
//! queued; if the relay crashes mid-batch, its lease expires and the entries
//! are claimed again (duplicate publishes are absorbed by consumer inboxes).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxMessage, OutboxStore, SqlxOutboxStore};
//! use sqlx::PgPool;
//! use uuid::Uuid;
//! use serde_json::json;
//!
//! async fn confirm_order(
//!     pool: &PgPool,
//!     outbox: &SqlxOutboxStore,
//!     order_id: Uuid,
//!     correlation_id: Uuid,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     sqlx::query("UPDATE orders SET status = 'confirmed' WHERE id = $1")
//!         .bind(order_id)
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     let message = OutboxMessage::new(
//!         "order.confirmed",
//!         order_id.to_string(),
//!         correlation_id,
//!         json!({ "order_id": order_id }),
//!     );
//!     outbox.append(&mut tx, &message).await?;
//!
//!     // Both the status change and the event become durable together.
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use event_schema::{EventEnvelope, SCHEMA_VERSION};

mod error;
pub mod macros;
pub mod metrics;
pub mod relay;
pub mod reprocess;

pub use error::{OutboxError, OutboxResult};
pub use relay::{OutboxRelay, OutboxRelayConfig};
pub use reprocess::reprocess_dead_letter;

/// One event awaiting (or done with) publication.
///
/// The row id doubles as the event id on the wire, so every retransmission
/// of the same row carries the same identity and downstream inboxes can
/// deduplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub event_type: String,
    /// Partition routing key; per-key publish order follows insertion order
    pub aggregate_key: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub correlation_id: Uuid,
}

impl OutboxMessage {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_key: impl Into<String>,
        correlation_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_key: aggregate_key.into(),
            payload,
            occurred_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            last_error: None,
            correlation_id,
        }
    }

    /// Queue an envelope whose identity is already fixed (e.g., saga step
    /// commands with derived event ids).
    pub fn from_envelope(envelope: &EventEnvelope) -> Self {
        Self {
            id: envelope.event_id,
            event_type: envelope.event_type.clone(),
            aggregate_key: envelope.aggregate_key.clone(),
            payload: envelope.payload.clone(),
            occurred_at: envelope.occurred_at,
            processed_at: None,
            retry_count: 0,
            last_error: None,
            correlation_id: envelope.correlation_id,
        }
    }

    /// The envelope this row publishes as. The outbox payload already *is*
    /// the integration payload; nothing is enriched at relay time.
    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.id,
            correlation_id: self.correlation_id,
            causation_id: None,
            event_type: self.event_type.clone(),
            aggregate_key: self.aggregate_key.clone(),
            occurred_at: self.occurred_at,
            schema_version: SCHEMA_VERSION,
            payload: self.payload.clone(),
            extra_headers: Default::default(),
        }
    }
}

/// Storage seam for outbox rows.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Enlist an insert in the caller's transaction. The event becomes
    /// durable iff that transaction commits. Appending an id that is
    /// already queued is a no-op, so re-executing a recovered saga step
    /// (whose command id is derived) cannot fail here.
    async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &OutboxMessage,
    ) -> OutboxResult<()>;

    /// Claim up to `batch_size` unprocessed entries, oldest first, stamping
    /// each with a lease so no other relay publishes them concurrently.
    /// Entries whose lease has expired are claimable again.
    async fn claim(&self, batch_size: i64, lease_ttl: Duration)
        -> OutboxResult<Vec<OutboxMessage>>;

    async fn mark_processed(&self, id: Uuid) -> OutboxResult<()>;

    /// Record a failed publish attempt. The lease is replaced with the retry
    /// backoff window, keeping the row invisible until it elapses.
    async fn record_failure(&self, id: Uuid, error: &str, retry_in: Duration)
        -> OutboxResult<()>;

    /// Clear leases that expired without resolution (crashed relay). The
    /// rows were already claimable; this makes the backlog visible to scans.
    async fn release_expired_leases(&self) -> OutboxResult<u64>;

    /// `(pending_count, oldest_pending_age_seconds)`; age 0 when none pending.
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// SQLx-based implementation over `outbox_messages`.
pub struct SqlxOutboxStore {
    pool: PgPool,
}

impl SqlxOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Reset entries created since the timestamp for operational backfill.
    pub async fn replay_since(&self, ts: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET processed_at = NULL,
                retry_count = 0,
                last_error = NULL,
                leased_until = NULL,
                lease_token = NULL
            WHERE occurred_at >= $1
            "#,
        )
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    /// Reset entries by id range (inclusive) for operational backfill.
    pub async fn replay_range(&self, from_id: Uuid, to_id: Uuid) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET processed_at = NULL,
                retry_count = 0,
                last_error = NULL,
                leased_until = NULL,
                lease_token = NULL
            WHERE id BETWEEN $1 AND $2
            "#,
        )
        .bind(from_id)
        .bind(to_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<OutboxMessage, sqlx::Error> {
    Ok(OutboxMessage {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        aggregate_key: row.try_get("aggregate_key")?,
        payload: row.try_get("payload")?,
        occurred_at: row.try_get("occurred_at")?,
        processed_at: row.try_get("processed_at")?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        correlation_id: row.try_get("correlation_id")?,
    })
}

#[async_trait]
impl OutboxStore for SqlxOutboxStore {
    async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &OutboxMessage,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id,
                event_type,
                aggregate_key,
                payload,
                occurred_at,
                processed_at,
                retry_count,
                last_error,
                correlation_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id)
        .bind(&message.event_type)
        .bind(&message.aggregate_key)
        .bind(&message.payload)
        .bind(message.occurred_at)
        .bind(message.processed_at)
        .bind(message.retry_count)
        .bind(&message.last_error)
        .bind(message.correlation_id)
        .execute(&mut **tx)
        .await?;

        debug!(
            event_id = %message.id,
            event_type = %message.event_type,
            aggregate_key = %message.aggregate_key,
            "Event appended to outbox"
        );

        Ok(())
    }

    async fn claim(
        &self,
        batch_size: i64,
        lease_ttl: Duration,
    ) -> OutboxResult<Vec<OutboxMessage>> {
        let lease_token = Uuid::new_v4();

        let rows = sqlx::query(
            r#"
            WITH ready AS (
                SELECT id
                FROM outbox_messages
                WHERE processed_at IS NULL
                  AND (leased_until IS NULL OR leased_until < NOW())
                ORDER BY occurred_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_messages m
            SET leased_until = NOW() + make_interval(secs => $2::double precision),
                lease_token = $3
            FROM ready
            WHERE m.id = ready.id
            RETURNING m.id, m.event_type, m.aggregate_key, m.payload,
                      m.occurred_at, m.processed_at, m.retry_count,
                      m.last_error, m.correlation_id
            "#,
        )
        .bind(batch_size)
        .bind(lease_ttl.as_secs_f64())
        .bind(lease_token)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()?;

        // UPDATE .. RETURNING gives no ordering guarantee; restore insertion
        // order so per-key FIFO survives the claim.
        messages.sort_by_key(|m| m.occurred_at);

        debug!(count = messages.len(), "Claimed outbox batch");

        Ok(messages)
    }

    async fn mark_processed(&self, id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET processed_at = NOW(),
                leased_until = NULL,
                lease_token = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(event_id = %id, "Outbox entry not found when marking processed");
            return Err(OutboxError::MessageNotFound(id));
        }

        Ok(())
    }

    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        retry_in: Duration,
    ) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET retry_count = retry_count + 1,
                last_error = $2,
                leased_until = NOW() + make_interval(secs => $3::double precision),
                lease_token = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(retry_in.as_secs_f64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(event_id = %id, "Outbox entry not found when recording failure");
            return Err(OutboxError::MessageNotFound(id));
        }

        warn!(event_id = %id, error = %error, "Outbox publish attempt failed");

        Ok(())
    }

    async fn release_expired_leases(&self) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET leased_until = NULL,
                lease_token = NULL
            WHERE processed_at IS NULL
              AND leased_until IS NOT NULL
              AND leased_until < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(occurred_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_messages
            WHERE processed_at IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trip_keeps_identity() {
        let correlation_id = Uuid::new_v4();
        let message = OutboxMessage::new(
            "order.confirmed",
            "order-3",
            correlation_id,
            json!({"order_id": "order-3"}),
        );

        let envelope = message.to_envelope();
        assert_eq!(envelope.event_id, message.id);
        assert_eq!(envelope.correlation_id, correlation_id);
        assert_eq!(envelope.aggregate_key, "order-3");

        let back = OutboxMessage::from_envelope(&envelope);
        assert_eq!(back.id, message.id);
        assert_eq!(back.payload, message.payload);
        assert_eq!(back.retry_count, 0);
    }

    #[test]
    fn from_envelope_preserves_derived_event_id() {
        let correlation_id = Uuid::new_v4();
        let derived = Uuid::new_v5(&correlation_id, b"charge-payment");
        let envelope =
            EventEnvelope::new("payment.charge", "order-1", correlation_id, json!({}))
                .with_event_id(derived);

        assert_eq!(OutboxMessage::from_envelope(&envelope).id, derived);
    }
}
