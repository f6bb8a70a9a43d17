//! Message transport contract.
//!
//! The coordination core treats the broker as a black box with exactly this
//! contract: keyed, partitioned publish that returns only after the broker
//! has durably acknowledged the message; subscription by topic and consumer
//! group with per-partition FIFO delivery; and manual acknowledgement, which
//! the consumer performs only after its inbox transaction commits. Delivery
//! is at-least-once; deduplication is the inbox's job.

use async_trait::async_trait;
use thiserror::Error;

use event_schema::{EnvelopeError, EventEnvelope};

pub mod kafka;

pub use kafka::{KafkaSubscription, KafkaTransport};

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    /// Timeouts, broker elections, transient connectivity. Retry next cycle.
    #[error("retriable transport error: {0}")]
    Retriable(String),

    /// Validation rejections (oversized or invalid message). Retrying cannot
    /// succeed; the message belongs in the dead-letter queue.
    #[error("fatal transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, TransportError::Retriable(_))
    }
}

/// Publish side of the transport contract.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish an envelope to a topic, keyed by its aggregate key.
    ///
    /// Returns `Ok` only after the broker has durably stored the message
    /// with the configured replication.
    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> TransportResult<()>;
}

/// One message handed to a consumer. The raw key/value/headers are kept
/// alongside the decode result so malformed messages can be quarantined
/// with their original bytes.
#[derive(Debug)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub decoded: Result<EventEnvelope, EnvelopeError>,
}

/// Subscribe side of the transport contract.
///
/// `recv` yields messages of one consumer-group assignment; messages from a
/// single partition arrive in FIFO order and must be processed sequentially.
/// `ack` commits the offset and must only be called after the handler's
/// database transaction has committed. A crash between commit and ack causes
/// redelivery, which the inbox filter absorbs.
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn recv(&self) -> TransportResult<Delivery>;

    fn ack(&self, delivery: &Delivery) -> TransportResult<()>;
}
