//! Kafka implementation of the transport contract.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info, warn};

use event_schema::{codec, EventEnvelope};

use crate::{Delivery, Subscription, Transport, TransportError, TransportResult};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

fn classify(err: &KafkaError) -> TransportError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge)
        | Some(RDKafkaErrorCode::InvalidMessage)
        | Some(RDKafkaErrorCode::InvalidMessageSize) => TransportError::Fatal(err.to_string()),
        _ => TransportError::Retriable(err.to_string()),
    }
}

/// Producer-side transport.
///
/// The producer is created with idempotence enabled so broker-level retries
/// cannot reorder or duplicate within a partition:
/// `enable.idempotence=true`, `acks=all`,
/// `max.in.flight.requests.per.connection=5`.
pub struct KafkaTransport {
    producer: FutureProducer,
}

impl KafkaTransport {
    pub fn connect(brokers: &str, client_id: &str) -> TransportResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("client.id", client_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("retries", "3")
            .create()
            .map_err(|e| TransportError::Fatal(format!("failed to create producer: {e}")))?;

        info!(brokers = %brokers, client_id = %client_id, "Kafka producer created");

        Ok(Self { producer })
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> TransportResult<()> {
        let wire = codec::encode(envelope);

        let mut headers = OwnedHeaders::new();
        for (name, value) in &wire.headers {
            headers = headers.insert(Header {
                key: name,
                value: Some(value.as_bytes()),
            });
        }

        let record = FutureRecord::to(topic)
            .key(&wire.key)
            .payload(&wire.value)
            .headers(headers);

        self.producer
            .send(record, DELIVERY_TIMEOUT)
            .await
            .map_err(|(err, _)| classify(&err))?;

        debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            topic = %topic,
            "Event published"
        );

        Ok(())
    }
}

/// Consumer-side transport with manual offset commits.
///
/// Auto-commit is disabled; offsets move only through [`Subscription::ack`],
/// after the inbox transaction commits. Redeliveries after a crash are
/// expected and absorbed by inbox deduplication.
pub struct KafkaSubscription {
    consumer: StreamConsumer,
}

impl KafkaSubscription {
    pub fn connect(
        brokers: &str,
        group_id: &str,
        client_id: &str,
        topics: &[&str],
    ) -> TransportResult<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("client.id", client_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "10000")
            .create()
            .map_err(|e| TransportError::Fatal(format!("failed to create consumer: {e}")))?;

        consumer
            .subscribe(topics)
            .map_err(|e| TransportError::Fatal(format!("failed to subscribe: {e}")))?;

        info!(group_id = %group_id, topics = ?topics, "Kafka consumer subscribed");

        Ok(Self { consumer })
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn recv(&self) -> TransportResult<Delivery> {
        let message = self.consumer.recv().await.map_err(|e| classify(&e))?;

        let key = message.key().unwrap_or_default().to_vec();
        let value = message.payload().unwrap_or_default().to_vec();

        let mut headers = Vec::new();
        if let Some(borrowed) = message.headers() {
            for header in borrowed.iter() {
                if let Some(raw) = header.value {
                    headers.push((
                        header.key.to_string(),
                        String::from_utf8_lossy(raw).into_owned(),
                    ));
                }
            }
        }

        let decoded = codec::decode(&key, &value, &headers);
        if let Err(ref e) = decoded {
            warn!(
                topic = %message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                error = %e,
                "Received undecodable message"
            );
        }

        Ok(Delivery {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key,
            value,
            headers,
            decoded,
        })
    }

    fn ack(&self, delivery: &Delivery) -> TransportResult<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &delivery.topic,
                delivery.partition,
                Offset::Offset(delivery.offset + 1),
            )
            .map_err(|e| TransportError::Fatal(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| classify(&e))
    }
}
