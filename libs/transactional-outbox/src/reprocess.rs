//! Operator replay of dead-letter entries through the normal outbox path.

use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use dead_letter::{reason, DeadLetterStore};

use crate::{OutboxMessage, OutboxResult, OutboxStore};

/// Republish a quarantined entry.
///
/// The reprocessing marker is flipped first (its already-reprocessed guard
/// is what prevents a double replay) and the outbox insert follows in its
/// own transaction. If the insert fails the entry stays marked and the error
/// surfaces to the operator for manual intervention.
///
/// Publish-side quarantines (`max_retries_exceeded`, relay-level
/// `malformed`) keep the original event id so downstream inboxes still
/// deduplicate against earlier partial publishes. Consume-side quarantines
/// get a fresh id: the consumer's inbox has already recorded the original as
/// processed, and the replay must not be swallowed by that record.
pub async fn reprocess_dead_letter<S, D>(
    pool: &PgPool,
    dlq: &D,
    outbox: &S,
    id: Uuid,
    operator_notes: Option<String>,
) -> OutboxResult<Uuid>
where
    S: OutboxStore,
    D: DeadLetterStore,
{
    let entry = dlq.load(id).await?;
    if entry.reprocessed {
        return Err(crate::OutboxError::AlreadyReprocessed(id));
    }

    dlq.mark_reprocessed(id, operator_notes).await?;

    let reuse_original = matches!(
        entry.failure_reason.as_str(),
        reason::MAX_RETRIES_EXCEEDED | reason::MALFORMED
    );

    let mut message = OutboxMessage::new(
        entry.event_type.clone(),
        entry
            .correlation_id
            .map(|c| c.to_string())
            .unwrap_or_else(|| entry.id.to_string()),
        entry.correlation_id.unwrap_or_else(Uuid::new_v4),
        entry.payload.clone(),
    );
    if reuse_original {
        if let Some(original) = entry.original_event_id {
            message.id = original;
        }
    }

    let mut tx = pool.begin().await?;
    outbox.append(&mut tx, &message).await?;
    tx.commit().await?;

    info!(
        dlq_id = %id,
        event_id = %message.id,
        event_type = %message.event_type,
        "Dead-letter entry queued for republication"
    );

    Ok(message.id)
}
