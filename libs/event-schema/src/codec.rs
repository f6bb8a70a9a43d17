//! Wire codec for the canonical event envelope.
//!
//! A message on the transport is `(key, value, headers)`: the key bytes are
//! the aggregate key string, the value bytes are the JSON payload, and the
//! headers carry envelope identity. Messages missing required headers or
//! carrying an unrecognised schema version decode to
//! [`EnvelopeError::Malformed`] and belong in the dead-letter queue.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::{EventEnvelope, SCHEMA_VERSION};

/// Required and well-known header names.
pub mod headers {
    pub const EVENT_ID: &str = "event-id";
    pub const EVENT_TYPE: &str = "event-type";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const CAUSATION_ID: &str = "causation-id";
    pub const SCHEMA_VERSION: &str = "schema-version";
    pub const OCCURRED_AT: &str = "occurred-at";

    pub const REQUIRED: &[&str] = &[
        EVENT_ID,
        EVENT_TYPE,
        CORRELATION_ID,
        SCHEMA_VERSION,
        OCCURRED_AT,
    ];
}

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("malformed envelope: {reason}")]
    Malformed { reason: String },
}

impl EnvelopeError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    fn missing_header(name: &str) -> Self {
        Self::malformed(format!("missing required header '{name}'"))
    }

    fn bad_header(name: &str, detail: impl std::fmt::Display) -> Self {
        Self::malformed(format!("invalid header '{name}': {detail}"))
    }
}

/// Encoded form ready for the transport.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// Serialize an envelope to its wire form.
///
/// `occurred-at` is emitted at microsecond precision, matching what the
/// database stores for the same event.
pub fn encode(envelope: &EventEnvelope) -> WireMessage {
    let mut headers = vec![
        (
            headers::EVENT_ID.to_string(),
            envelope.event_id.to_string(),
        ),
        (
            headers::EVENT_TYPE.to_string(),
            envelope.event_type.clone(),
        ),
        (
            headers::CORRELATION_ID.to_string(),
            envelope.correlation_id.to_string(),
        ),
        (
            headers::SCHEMA_VERSION.to_string(),
            envelope.schema_version.to_string(),
        ),
        (
            headers::OCCURRED_AT.to_string(),
            envelope
                .occurred_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        ),
    ];

    if let Some(causation_id) = envelope.causation_id {
        headers.push((headers::CAUSATION_ID.to_string(), causation_id.to_string()));
    }

    for (name, value) in &envelope.extra_headers {
        headers.push((name.clone(), value.clone()));
    }

    WireMessage {
        key: envelope.aggregate_key.as_bytes().to_vec(),
        value: envelope.payload.to_string().into_bytes(),
        headers,
    }
}

/// Reconstruct an envelope from its wire form.
///
/// Headers outside the well-known set are preserved in `extra_headers`.
pub fn decode(
    key: &[u8],
    value: &[u8],
    wire_headers: &[(String, String)],
) -> Result<EventEnvelope, EnvelopeError> {
    let aggregate_key = std::str::from_utf8(key)
        .map_err(|_| EnvelopeError::malformed("message key is not valid UTF-8"))?
        .to_string();

    let lookup = |name: &str| -> Option<&str> {
        wire_headers
            .iter()
            .find(|(header, _)| header == name)
            .map(|(_, value)| value.as_str())
    };

    let event_id = lookup(headers::EVENT_ID)
        .ok_or_else(|| EnvelopeError::missing_header(headers::EVENT_ID))?
        .parse::<Uuid>()
        .map_err(|e| EnvelopeError::bad_header(headers::EVENT_ID, e))?;

    let event_type = lookup(headers::EVENT_TYPE)
        .ok_or_else(|| EnvelopeError::missing_header(headers::EVENT_TYPE))?
        .to_string();

    let correlation_id = lookup(headers::CORRELATION_ID)
        .ok_or_else(|| EnvelopeError::missing_header(headers::CORRELATION_ID))?
        .parse::<Uuid>()
        .map_err(|e| EnvelopeError::bad_header(headers::CORRELATION_ID, e))?;

    let schema_version = lookup(headers::SCHEMA_VERSION)
        .ok_or_else(|| EnvelopeError::missing_header(headers::SCHEMA_VERSION))?
        .parse::<u32>()
        .map_err(|e| EnvelopeError::bad_header(headers::SCHEMA_VERSION, e))?;

    if schema_version > SCHEMA_VERSION {
        return Err(EnvelopeError::malformed(format!(
            "unrecognised schema version {schema_version} (supported <= {SCHEMA_VERSION})"
        )));
    }

    let occurred_at = match lookup(headers::OCCURRED_AT) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| EnvelopeError::bad_header(headers::OCCURRED_AT, e))?
            .with_timezone(&Utc),
        None => return Err(EnvelopeError::missing_header(headers::OCCURRED_AT)),
    };

    let causation_id = match lookup(headers::CAUSATION_ID) {
        Some(raw) => Some(
            raw.parse::<Uuid>()
                .map_err(|e| EnvelopeError::bad_header(headers::CAUSATION_ID, e))?,
        ),
        None => None,
    };

    let payload: serde_json::Value = serde_json::from_slice(value)
        .map_err(|e| EnvelopeError::malformed(format!("payload is not valid JSON: {e}")))?;

    let known = [
        headers::EVENT_ID,
        headers::EVENT_TYPE,
        headers::CORRELATION_ID,
        headers::CAUSATION_ID,
        headers::SCHEMA_VERSION,
        headers::OCCURRED_AT,
    ];
    let extra_headers: BTreeMap<String, String> = wire_headers
        .iter()
        .filter(|(name, _)| !known.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    Ok(EventEnvelope {
        event_id,
        correlation_id,
        causation_id,
        event_type,
        aggregate_key,
        occurred_at,
        schema_version,
        payload,
        extra_headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample_envelope() -> EventEnvelope {
        let correlation_id = Uuid::new_v4();
        EventEnvelope::new(
            "payment.charge",
            "order-7",
            correlation_id,
            json!({"amount_cents": 2500, "currency": "USD"}),
        )
        .with_causation_id(Uuid::new_v4())
        .with_occurred_at(Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap())
    }

    #[test]
    fn encode_decode_round_trip() {
        let envelope = sample_envelope();
        let wire = encode(&envelope);
        let decoded = decode(&wire.key, &wire.value, &wire.headers).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn round_trip_preserves_extra_headers() {
        let mut envelope = sample_envelope();
        envelope
            .extra_headers
            .insert("trace-id".to_string(), "abc123".to_string());

        let wire = encode(&envelope);
        let decoded = decode(&wire.key, &wire.value, &wire.headers).unwrap();

        assert_eq!(decoded.extra_headers.get("trace-id").unwrap(), "abc123");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn key_bytes_equal_aggregate_key() {
        let envelope = sample_envelope();
        let wire = encode(&envelope);
        assert_eq!(wire.key, b"order-7");
    }

    #[test]
    fn missing_required_header_is_malformed() {
        let envelope = sample_envelope();
        let wire = encode(&envelope);

        for required in headers::REQUIRED {
            let stripped: Vec<(String, String)> = wire
                .headers
                .iter()
                .filter(|(name, _)| name != required)
                .cloned()
                .collect();

            let err = decode(&wire.key, &wire.value, &stripped).unwrap_err();
            assert!(
                matches!(err, EnvelopeError::Malformed { ref reason } if reason.contains(required)),
                "expected malformed error for stripped '{required}'"
            );
        }
    }

    #[test]
    fn unknown_schema_version_is_malformed() {
        let envelope = sample_envelope();
        let mut wire = encode(&envelope);
        for (name, value) in wire.headers.iter_mut() {
            if name == headers::SCHEMA_VERSION {
                *value = (SCHEMA_VERSION + 1).to_string();
            }
        }

        let err = decode(&wire.key, &wire.value, &wire.headers).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed { .. }));
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let envelope = sample_envelope();
        let wire = encode(&envelope);
        let err = decode(&wire.key, b"not json", &wire.headers).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed { .. }));
    }
}
