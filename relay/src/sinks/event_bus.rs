use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::error::SinkError;
use crate::event::TelemetryEvent;
use crate::sinks::Sink;

/// Publishes one message per admitted event to the internal event-bus
/// topic, keyed by device id so downstream consumers see per-device order.
pub struct EventBusSink {
    producer: FutureProducer,
    topic: String,
    storage_prefix: String,
    send_timeout: Duration,
}

impl EventBusSink {
    pub fn new(
        client_config: &ClientConfig,
        topic: String,
        storage_prefix: String,
        send_timeout: Duration,
    ) -> Result<EventBusSink> {
        info!(topic, "connecting event-bus producer");
        let producer: FutureProducer = client_config
            .create()
            .context("failed to create event-bus producer")?;

        // Fail fast on startup if the bus cluster cannot be reached at all.
        drop(
            producer
                .client()
                .fetch_metadata(None, Timeout::After(Duration::from_secs(10)))
                .context("event bus unreachable")?,
        );
        info!(topic, "event-bus producer connected");

        Ok(EventBusSink {
            producer,
            topic,
            storage_prefix,
            send_timeout,
        })
    }
}

#[async_trait]
impl Sink for EventBusSink {
    fn name(&self) -> &'static str {
        "event-bus"
    }

    async fn deliver(&self, event: &TelemetryEvent) -> Result<(), SinkError> {
        let payload = serde_json::to_string(&event.to_wire(&self.storage_prefix))
            .map_err(|e| SinkError::Terminal(format!("failed to serialize event: {e}")))?;

        let record = FutureRecord::to(&self.topic)
            .key(&event.device_id)
            .payload(&payload);

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok(_) => {
                debug!(event = %event.key(), topic = %self.topic, "published to event bus");
                Ok(())
            }
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _)) => {
                error!(event = %event.key(), "event too large for the bus");
                Err(SinkError::Terminal("message exceeds bus size limit".to_string()))
            }
            Err((e, _)) => {
                error!(event = %event.key(), error = ?e, "event-bus publish failed");
                Err(SinkError::Retryable(format!("bus publish failed: {e}")))
            }
        }
    }
}
