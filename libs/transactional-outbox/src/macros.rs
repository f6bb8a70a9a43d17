//! Convenience macros for working with the outbox.

/// Queue an event in the outbox within an existing transaction.
///
/// Evaluates to the append's `OutboxResult`, so the caller decides how the
/// failure propagates. Two forms:
///
/// - `outbox_event!(tx, store, envelope)` queues a pre-built event
///   envelope, keeping its event id (saga step commands and replies derive
///   theirs, and retries must reuse it).
/// - `outbox_event!(tx, store, event_type, aggregate_key, correlation_id,
///   payload)` builds a fresh event with a generated id.
///
/// # Usage
///
/// ```rust,no_run
/// use transactional_outbox::{outbox_event, SqlxOutboxStore};
/// use sqlx::PgPool;
/// use uuid::Uuid;
/// use serde_json::json;
///
/// # async fn example(pool: PgPool, outbox: SqlxOutboxStore) -> Result<(), Box<dyn std::error::Error>> {
/// let mut tx = pool.begin().await?;
/// let order_id = Uuid::new_v4();
/// let correlation_id = Uuid::new_v4();
///
/// sqlx::query("INSERT INTO orders (id) VALUES ($1)")
///     .bind(order_id)
///     .execute(&mut *tx)
///     .await?;
///
/// outbox_event!(
///     &mut tx,
///     &outbox,
///     "order.submitted",
///     order_id,
///     correlation_id,
///     json!({ "order_id": order_id })
/// )?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! outbox_event {
    ($tx:expr, $store:expr, $envelope:expr) => {{
        use $crate::{OutboxMessage, OutboxStore as _};

        $store
            .append($tx, &OutboxMessage::from_envelope($envelope))
            .await
    }};
    ($tx:expr, $store:expr, $event_type:expr, $aggregate_key:expr, $correlation_id:expr, $payload:expr) => {{
        use $crate::{OutboxMessage, OutboxStore as _};

        let message = OutboxMessage::new(
            $event_type,
            $aggregate_key.to_string(),
            $correlation_id,
            $payload,
        );

        $store.append($tx, &message).await
    }};
}
