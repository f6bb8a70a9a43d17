//! Error types for the transactional outbox library.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("outbox entry not found: {0}")]
    MessageNotFound(Uuid),

    #[error("publish failed: {0}")]
    Publish(#[from] message_transport::TransportError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("dead-letter error: {0}")]
    DeadLetter(#[from] dead_letter::DeadLetterError),

    #[error("dead-letter entry {0} was already reprocessed")]
    AlreadyReprocessed(Uuid),
}
