use std::sync::Arc;

use chrono::{DateTime, Utc};
use rdkafka::Message;
use tracing::{debug, error, warn};

use crate::decoder::{Decoded, Decoder};
use crate::dedup::DedupWindow;
use crate::event::{DeliveryReceipt, DeliveryStatus, TelemetryMessage};
use crate::kafka::AckableMessage;
use crate::metrics_const::{
    DUPLICATES_DROPPED, MALFORMED_MESSAGES, SINK_DELIVERIES, SINK_TERMINAL_FAILURES,
    UNKNOWN_EVENT_TYPES,
};
use crate::recent::RecentReadings;
use crate::retry::{self, RetryPolicy};
use crate::sinks::Sink;

/// The per-message path: decode, deduplicate, publish, persist, ack.
///
/// One worker owns one of these, so the dedup window needs no locking and
/// events for a given device flow through in arrival order. Every message
/// reaches a terminal outcome here; nothing early-returns with the ack
/// undetermined.
pub struct PipelineWorker {
    decoder: Decoder,
    dedup: DedupWindow,
    publisher: Arc<dyn Sink>,
    router: Arc<dyn Sink>,
    recent: Arc<RecentReadings>,
    retry: RetryPolicy,
}

impl PipelineWorker {
    pub fn new(
        decoder: Decoder,
        dedup: DedupWindow,
        publisher: Arc<dyn Sink>,
        router: Arc<dyn Sink>,
        recent: Arc<RecentReadings>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            decoder,
            dedup,
            publisher,
            router,
            recent,
            retry,
        }
    }

    pub async fn handle(&mut self, message: AckableMessage) {
        let received_at = receipt_time(&message);
        let raw = match TelemetryMessage::from_parts(message.key(), message.payload(), received_at)
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "discarding malformed message");
                metrics::counter!(MALFORMED_MESSAGES).increment(1);
                message.ack();
                return;
            }
        };

        let event = match self.decoder.decode(&raw) {
            Ok(Decoded::Event(event)) => event,
            Ok(Decoded::UnknownEventType {
                device_id,
                event_type,
            }) => {
                warn!(device_id, event_type, "skipping unknown event type");
                metrics::counter!(UNKNOWN_EVENT_TYPES).increment(1);
                message.ack();
                return;
            }
            Err(e) => {
                warn!(key = %raw.key, error = %e, "discarding malformed message");
                metrics::counter!(MALFORMED_MESSAGES).increment(1);
                message.ack();
                return;
            }
        };

        if !self.dedup.admit(&event) {
            debug!(event = %event.key(), "dropping duplicate");
            metrics::counter!(DUPLICATES_DROPPED).increment(1);
            message.ack();
            return;
        }
        self.recent.record(&event);

        // Both destinations run to a receipt before the ack; a terminal
        // failure is still a determined outcome, so the message is acked
        // rather than redelivered forever.
        let published = retry::deliver(self.publisher.as_ref(), &event, &self.retry).await;
        observe_receipt(&published);
        let persisted = retry::deliver(self.router.as_ref(), &event, &self.retry).await;
        observe_receipt(&persisted);

        message.ack();
    }

    pub fn sweep_dedup(&mut self) {
        self.dedup.sweep();
        metrics::gauge!(crate::metrics_const::DEDUP_TRACKED_ENTRIES)
            .set(self.dedup.tracked_entries() as f64);
    }
}

fn observe_receipt(receipt: &DeliveryReceipt) {
    match &receipt.status {
        DeliveryStatus::Delivered => {
            metrics::counter!(SINK_DELIVERIES, "sink" => receipt.sink).increment(1);
        }
        DeliveryStatus::TerminalFailure(reason) => {
            error!(
                sink = receipt.sink,
                event = %receipt.event,
                attempts = receipt.attempts,
                reason,
                "delivery failed terminally"
            );
            metrics::counter!(SINK_TERMINAL_FAILURES, "sink" => receipt.sink).increment(1);
        }
    }
}

fn receipt_time(message: &AckableMessage) -> DateTime<Utc> {
    message
        .kafka_message()
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}
