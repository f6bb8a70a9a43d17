//! Error types for the saga library.
//!
//! These cover storage and wiring faults only. A step that fails its
//! business purpose is not an error; it is a [`crate::StepResult::Failure`]
//! and becomes a state transition.

use thiserror::Error;
use uuid::Uuid;

pub type SagaResult<T> = Result<T, SagaError>;

#[derive(Error, Debug)]
pub enum SagaError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("saga not found for correlation id {0}")]
    NotFound(Uuid),

    #[error("saga already exists for correlation id {0}")]
    DuplicateCorrelation(Uuid),

    #[error("stale saga state for correlation id {correlation_id} (expected version {expected_version})")]
    Concurrency {
        correlation_id: Uuid,
        expected_version: i64,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no orchestrator registered for saga type '{0}'")]
    UnknownSagaType(String),

    #[error("saga definition has no step named '{0}'")]
    UnknownStep(String),

    #[error("outbox error: {0}")]
    Outbox(#[from] transactional_outbox::OutboxError),
}
