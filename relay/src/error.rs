use thiserror::Error;

/// A single inbound message that cannot be turned into a telemetry event.
///
/// Never fatal to the pipeline: the message is logged, counted and discarded,
/// and ingestion continues.
#[derive(Error, Debug)]
pub enum MalformedMessageError {
    #[error("message has no key")]
    MissingKey,

    #[error("message key is not valid UTF-8")]
    NonUtf8Key,

    #[error("message key '{0}' does not match '<prefix>/<device-id>/<event-type>'")]
    KeyPattern(String),

    #[error("message key '{key}' does not start with the configured prefix '{prefix}'")]
    WrongPrefix { key: String, prefix: String },

    #[error("message has no payload")]
    MissingPayload,

    #[error("failed to parse '{event_type}' payload: {source}")]
    PayloadParsing {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("device-reported timestamp {0} is out of range")]
    TimestampOutOfRange(i64),
}

/// Outcome classification for a single delivery attempt against the event
/// bus, the warehouse or object storage.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The sink was temporarily unavailable; the attempt may be retried
    /// with backoff.
    #[error("transient sink failure: {0}")]
    Retryable(String),

    /// Retrying cannot succeed (unserializable event, rejected write);
    /// reported as a terminal failure in the delivery receipt.
    #[error("terminal sink failure: {0}")]
    Terminal(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Retryable(_))
    }
}

/// Broker-level failure. Unlike per-message errors this is retried with
/// backoff for as long as the connection stays down, and is never silently
/// swallowed.
#[derive(Error, Debug)]
#[error("broker connection failure: {0}")]
pub struct ConnectionError(#[from] pub rdkafka::error::KafkaError);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_names_the_broker_cause() {
        let err = ConnectionError(rdkafka::error::KafkaError::Canceled);
        assert!(err.to_string().starts_with("broker connection failure"));
    }

    #[test]
    fn sink_errors_classify_retryability() {
        assert!(SinkError::Retryable("queue full".to_string()).is_retryable());
        assert!(!SinkError::Terminal("rejected".to_string()).is_retryable());
    }
}
