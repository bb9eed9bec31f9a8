use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MalformedMessageError;

/// Class of telemetry a device can report, taken from the third segment of
/// the message key. Unknown segments are handled by the decoder and never
/// reach this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Metric,
    Status,
    Image,
}

impl EventType {
    pub fn parse(segment: &str) -> Option<Self> {
        match segment {
            "metric" => Some(EventType::Metric),
            "status" => Some(EventType::Status),
            "image" => Some(EventType::Image),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Metric => "metric",
            EventType::Status => "status",
            EventType::Image => "image",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed value union resolved once at decode time.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryValue {
    Reading(f64),
    StatusCode(i32),
    Blob(Vec<u8>),
}

/// Raw unit received from the broker, owned by the ingestion side until it
/// is decoded.
#[derive(Debug, Clone)]
pub struct TelemetryMessage {
    pub key: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl TelemetryMessage {
    /// Build from the raw broker key/payload pair. A missing or non-UTF-8
    /// key and a missing payload are malformed here, before any schema
    /// parsing happens.
    pub fn from_parts(
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
        received_at: DateTime<Utc>,
    ) -> Result<Self, MalformedMessageError> {
        let key = key.ok_or(MalformedMessageError::MissingKey)?;
        let key = std::str::from_utf8(key)
            .map_err(|_| MalformedMessageError::NonUtf8Key)?
            .to_string();
        let payload = payload.ok_or(MalformedMessageError::MissingPayload)?.to_vec();
        Ok(Self {
            key,
            payload,
            received_at,
        })
    }
}

/// Decoded, validated telemetry record.
///
/// Device id and event type, together with the sequence number when the
/// device supplies one, identify the event for deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub device_id: String,
    pub event_type: EventType,
    /// Device-reported occurrence time; falls back to the receipt time when
    /// the payload carries no timestamp.
    pub timestamp: DateTime<Utc>,
    pub value: TelemetryValue,
    pub sequence: Option<u64>,
}

impl TelemetryEvent {
    /// Identity used to correlate receipts and log lines with the event.
    pub fn key(&self) -> EventKey {
        EventKey {
            device_id: self.device_id.clone(),
            event_type: self.event_type,
            sequence: self.sequence,
            timestamp_ms: self.timestamp.timestamp_millis(),
        }
    }

    /// Deterministic object-storage key for this event. Re-deriving the key
    /// for a redelivered event lands on the same object, so storage writes
    /// overwrite instead of duplicating.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!(
            "{prefix}{}/{}/{}.bin",
            self.device_id,
            self.event_type,
            self.timestamp.timestamp_millis()
        )
    }

    /// Representation published on the internal event bus. Binary payloads
    /// are referenced by their storage key rather than inlined.
    pub fn to_wire(&self, storage_prefix: &str) -> WireEvent<'_> {
        let (reading, status_code, blob_ref) = match &self.value {
            TelemetryValue::Reading(v) => (Some(*v), None, None),
            TelemetryValue::StatusCode(c) => (None, Some(*c), None),
            TelemetryValue::Blob(_) => (None, None, Some(self.storage_key(storage_prefix))),
        };
        WireEvent {
            device_id: &self.device_id,
            event_type: self.event_type,
            timestamp: self.timestamp,
            sequence: self.sequence,
            reading,
            status_code,
            blob_ref,
        }
    }
}

/// One event-bus message per admitted event.
#[derive(Debug, Serialize)]
pub struct WireEvent<'a> {
    pub device_id: &'a str,
    pub event_type: EventType,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_ref: Option<String>,
}

/// Compact event identity carried by delivery receipts and failure logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub device_id: String,
    pub event_type: EventType,
    pub sequence: Option<u64>,
    pub timestamp_ms: i64,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sequence {
            Some(seq) => write!(f, "{}/{} seq={seq}", self.device_id, self.event_type),
            None => write!(
                f,
                "{}/{} ts={}",
                self.device_id, self.event_type, self.timestamp_ms
            ),
        }
    }
}

/// Final outcome of publishing or persisting one event, after the bounded
/// retry budget has been applied.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub event: EventKey,
    pub sink: &'static str,
    pub attempts: u32,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryStatus {
    Delivered,
    TerminalFailure(String),
}

impl DeliveryReceipt {
    pub fn is_delivered(&self) -> bool {
        matches!(self.status, DeliveryStatus::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metric_event() -> TelemetryEvent {
        TelemetryEvent {
            device_id: "dev-42".to_string(),
            event_type: EventType::Metric,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            value: TelemetryValue::Reading(21.5),
            sequence: Some(7),
        }
    }

    #[test]
    fn storage_key_is_deterministic() {
        let event = TelemetryEvent {
            event_type: EventType::Image,
            value: TelemetryValue::Blob(vec![1, 2, 3]),
            ..metric_event()
        };
        let key = event.storage_key("telemetry/");
        assert_eq!(key, "telemetry/dev-42/image/1700000000000.bin");
        assert_eq!(key, event.storage_key("telemetry/"));
    }

    #[test]
    fn wire_event_inlines_reading_and_references_blobs() {
        let metric = metric_event();
        let wire = serde_json::to_value(metric.to_wire("telemetry/")).unwrap();
        assert_eq!(wire["device_id"], "dev-42");
        assert_eq!(wire["event_type"], "metric");
        assert_eq!(wire["reading"], 21.5);
        assert!(wire.get("blob_ref").is_none());

        let image = TelemetryEvent {
            event_type: EventType::Image,
            value: TelemetryValue::Blob(vec![0xff; 16]),
            sequence: None,
            ..metric_event()
        };
        let wire = serde_json::to_value(image.to_wire("telemetry/")).unwrap();
        assert_eq!(wire["blob_ref"], "telemetry/dev-42/image/1700000000000.bin");
        assert!(wire.get("reading").is_none());
        assert!(wire.get("sequence").is_none());
    }

    #[test]
    fn from_parts_rejects_missing_key_and_payload() {
        let now = Utc::now();
        assert!(matches!(
            TelemetryMessage::from_parts(None, Some(b"{}"), now),
            Err(MalformedMessageError::MissingKey)
        ));
        assert!(matches!(
            TelemetryMessage::from_parts(Some(&[0xff, 0xfe]), Some(b"{}"), now),
            Err(MalformedMessageError::NonUtf8Key)
        ));
        assert!(matches!(
            TelemetryMessage::from_parts(Some(b"devices/dev-1/metric"), None, now),
            Err(MalformedMessageError::MissingPayload)
        ));
    }
}
