use std::sync::Arc;

use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, warn};

use crate::kafka::tracker::TrackerShared;
use crate::metrics_const::{MESSAGES_AUTO_NACKED, MESSAGES_COMPLETED};

/// Terminal outcome of processing one message.
#[derive(Debug, Clone)]
pub enum MessageResult {
    Success,
    Failed(String),
}

impl MessageResult {
    pub fn is_success(&self) -> bool {
        matches!(self, MessageResult::Success)
    }
}

/// A broker message the pipeline must drive to a terminal outcome.
///
/// Acking records success, nacking records terminal failure; either makes
/// the offset eligible for commit. Dropping one without an outcome is a bug
/// in the caller; the `Drop` impl keeps that offset pending so it is never
/// committed past and the message is redelivered after a restart. The held
/// semaphore permit is released with the message, which is what bounds
/// intake.
pub struct AckableMessage {
    message: OwnedMessage,
    tracker: Arc<TrackerShared>,
    acked: bool,
    _permit: OwnedSemaphorePermit,
}

impl AckableMessage {
    pub(crate) fn new(
        message: OwnedMessage,
        tracker: Arc<TrackerShared>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            message,
            tracker,
            acked: false,
            _permit: permit,
        }
    }

    /// Successful processing; the offset becomes committable.
    pub fn ack(mut self) {
        self.complete(MessageResult::Success);
        debug!(
            topic = self.message.topic(),
            partition = self.message.partition(),
            offset = self.message.offset(),
            "acked message"
        );
        metrics::counter!(MESSAGES_COMPLETED, "status" => "acked").increment(1);
    }

    /// Terminal failure; the outcome is determined, so the offset still
    /// becomes committable rather than being redelivered forever.
    pub fn nack(mut self, reason: String) {
        warn!(
            topic = self.message.topic(),
            partition = self.message.partition(),
            offset = self.message.offset(),
            reason,
            "nacked message"
        );
        self.complete(MessageResult::Failed(reason));
        metrics::counter!(MESSAGES_COMPLETED, "status" => "nacked").increment(1);
    }

    fn complete(&mut self, result: MessageResult) {
        if self.acked {
            return;
        }
        self.tracker.complete(
            self.message.topic(),
            self.message.partition(),
            self.message.offset(),
            &result,
        );
        self.acked = true;
    }

    pub fn kafka_message(&self) -> &OwnedMessage {
        &self.message
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.message.key()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.message.payload()
    }
}

impl Drop for AckableMessage {
    fn drop(&mut self) {
        if !self.acked {
            error!(
                topic = self.message.topic(),
                partition = self.message.partition(),
                offset = self.message.offset(),
                "message dropped without an outcome, holding its offset for redelivery"
            );
            // Not a determined outcome: the offset stays pending so the safe
            // commit offset never advances past it.
            self.tracker.abandon();
            self.acked = true;
            metrics::counter!(MESSAGES_AUTO_NACKED).increment(1);
        }
    }
}
