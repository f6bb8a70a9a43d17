/// Event Schema Registry for all Kafka topics across Mercato services
///
/// This library defines the canonical event envelope, its wire codec, and the
/// versioned commerce event types exchanged between services. Each message
/// carries a required `schema-version` header so consumers can reject
/// payloads they do not understand.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// Wire codec (Kafka key/value/headers)
pub mod codec;
// Domain events enumeration
pub mod events;
// Topic naming scheme
pub mod topics;

pub use codec::{decode, encode, EnvelopeError, WireMessage};
pub use events::DomainEvent;

/// Current schema version for all events
pub const SCHEMA_VERSION: u32 = 1;

/// Canonical envelope for every message on the transport.
///
/// The envelope is immutable once built; retries of the same logical send
/// reuse the same `event_id` so downstream inboxes can deduplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID, stable across retransmissions
    pub event_id: Uuid,
    /// Saga instance / workflow identity threading through related events
    pub correlation_id: Uuid,
    /// The event that caused this one, if any
    pub causation_id: Option<Uuid>,
    /// Fully qualified event type (e.g., "inventory.reserve")
    pub event_type: String,
    /// Routing key; colocates related events on one partition
    pub aggregate_key: String,
    /// Wall clock at origin
    pub occurred_at: DateTime<Utc>,
    /// Schema version for compatibility checking
    pub schema_version: u32,
    /// Event payload as JSON
    pub payload: serde_json::Value,
    /// Headers we did not produce ourselves, carried through verbatim
    pub extra_headers: BTreeMap<String, String>,
}

impl EventEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_key: impl Into<String>,
        correlation_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            correlation_id,
            causation_id: None,
            event_type: event_type.into(),
            aggregate_key: aggregate_key.into(),
            occurred_at: Utc::now(),
            schema_version: SCHEMA_VERSION,
            payload,
            extra_headers: BTreeMap::new(),
        }
    }

    /// Override the generated event ID. Used when the ID is derived from the
    /// workflow (e.g., saga step commands) so retries stay deduplicable.
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Decode the payload into its typed commerce event.
    pub fn domain_event(&self) -> Result<DomainEvent, EnvelopeError> {
        DomainEvent::decode(&self.event_type, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_defaults() {
        let correlation_id = Uuid::new_v4();
        let envelope = EventEnvelope::new(
            "order.submitted",
            "order-42",
            correlation_id,
            json!({"order_id": "order-42"}),
        );

        assert_eq!(envelope.schema_version, SCHEMA_VERSION);
        assert_eq!(envelope.correlation_id, correlation_id);
        assert_eq!(envelope.aggregate_key, "order-42");
        assert!(envelope.causation_id.is_none());
        assert!(envelope.extra_headers.is_empty());
    }

    #[test]
    fn derived_event_id_is_stable() {
        let correlation_id = Uuid::new_v4();
        let derived = Uuid::new_v5(&correlation_id, b"reserve-inventory");

        let first = EventEnvelope::new("inventory.reserve", "order-1", correlation_id, json!({}))
            .with_event_id(derived);
        let second = EventEnvelope::new("inventory.reserve", "order-1", correlation_id, json!({}))
            .with_event_id(derived);

        assert_eq!(first.event_id, second.event_id);
    }
}
