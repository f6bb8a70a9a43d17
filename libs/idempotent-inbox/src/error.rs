//! Error types for the idempotent inbox library.

use thiserror::Error;

pub type InboxResult<T> = Result<T, InboxError>;

#[derive(Error, Debug)]
pub enum InboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("dead-letter error: {0}")]
    DeadLetter(#[from] dead_letter::DeadLetterError),

    #[error("invalid inbox configuration: {0}")]
    InvalidConfig(String),
}

/// How a handler failed. Retriable failures roll back and wait for
/// redelivery; fatal ones skip the retry budget and quarantine immediately.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("retriable handler error: {0}")]
    Retriable(String),

    #[error("fatal handler error: {0}")]
    Fatal(String),
}

impl From<sqlx::Error> for HandlerError {
    fn from(e: sqlx::Error) -> Self {
        // Storage hiccups (deadlocks, serialization failures) deserve a retry.
        HandlerError::Retriable(e.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        // A payload that does not deserialize will not on the next attempt
        // either.
        HandlerError::Fatal(e.to_string())
    }
}
