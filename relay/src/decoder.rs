use serde::Deserialize;
use tracing::debug;

use crate::error::MalformedMessageError;
use crate::event::{EventType, TelemetryEvent, TelemetryMessage, TelemetryValue};

/// Outcome of decoding a raw message. Unknown event types are an explicit
/// result rather than an error so newer device firmware can publish classes
/// this build does not understand yet without tripping failure counters.
#[derive(Debug)]
pub enum Decoded {
    Event(TelemetryEvent),
    UnknownEventType {
        device_id: String,
        event_type: String,
    },
}

/// Pure decoder for the `<prefix>/<device-id>/<event-type>` key convention.
/// No I/O; every failure mode is a [`MalformedMessageError`] that discards
/// only the one message.
#[derive(Debug, Clone)]
pub struct Decoder {
    prefix: String,
}

#[derive(Deserialize)]
struct MetricPayload {
    value: f64,
    #[serde(default)]
    ts: Option<i64>,
    #[serde(default)]
    seq: Option<u64>,
}

#[derive(Deserialize)]
struct StatusPayload {
    code: i32,
    #[serde(default)]
    ts: Option<i64>,
    #[serde(default)]
    seq: Option<u64>,
}

impl Decoder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn decode(&self, raw: &TelemetryMessage) -> Result<Decoded, MalformedMessageError> {
        let segments: Vec<&str> = raw.key.split('/').collect();
        if segments.len() != 3 {
            return Err(MalformedMessageError::KeyPattern(raw.key.clone()));
        }
        if segments[0] != self.prefix {
            return Err(MalformedMessageError::WrongPrefix {
                key: raw.key.clone(),
                prefix: self.prefix.clone(),
            });
        }
        let device_id = segments[1];
        let type_segment = segments[2];
        if device_id.is_empty() || type_segment.is_empty() {
            return Err(MalformedMessageError::KeyPattern(raw.key.clone()));
        }

        let Some(event_type) = EventType::parse(type_segment) else {
            debug!(device_id, event_type = type_segment, "unknown event type");
            return Ok(Decoded::UnknownEventType {
                device_id: device_id.to_string(),
                event_type: type_segment.to_string(),
            });
        };

        let event = match event_type {
            EventType::Metric => {
                let payload: MetricPayload = serde_json::from_slice(&raw.payload)
                    .map_err(|source| MalformedMessageError::PayloadParsing {
                        event_type: event_type.as_str(),
                        source,
                    })?;
                TelemetryEvent {
                    device_id: device_id.to_string(),
                    event_type,
                    timestamp: resolve_timestamp(payload.ts, raw)?,
                    value: TelemetryValue::Reading(payload.value),
                    sequence: payload.seq,
                }
            }
            EventType::Status => {
                let payload: StatusPayload = serde_json::from_slice(&raw.payload)
                    .map_err(|source| MalformedMessageError::PayloadParsing {
                        event_type: event_type.as_str(),
                        source,
                    })?;
                TelemetryEvent {
                    device_id: device_id.to_string(),
                    event_type,
                    timestamp: resolve_timestamp(payload.ts, raw)?,
                    value: TelemetryValue::StatusCode(payload.code),
                    sequence: payload.seq,
                }
            }
            EventType::Image => {
                // Opaque bytes; devices do not report an occurrence time for
                // images, so the receipt time stands in.
                if raw.payload.is_empty() {
                    return Err(MalformedMessageError::MissingPayload);
                }
                TelemetryEvent {
                    device_id: device_id.to_string(),
                    event_type,
                    timestamp: raw.received_at,
                    value: TelemetryValue::Blob(raw.payload.clone()),
                    sequence: None,
                }
            }
        };

        Ok(Decoded::Event(event))
    }
}

fn resolve_timestamp(
    ts: Option<i64>,
    raw: &TelemetryMessage,
) -> Result<chrono::DateTime<chrono::Utc>, MalformedMessageError> {
    match ts {
        Some(secs) => chrono::DateTime::from_timestamp(secs, 0)
            .ok_or(MalformedMessageError::TimestampOutOfRange(secs)),
        None => Ok(raw.received_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn raw(key: &str, payload: &[u8]) -> TelemetryMessage {
        TelemetryMessage {
            key: key.to_string(),
            payload: payload.to_vec(),
            received_at: Utc::now(),
        }
    }

    fn decode_event(key: &str, payload: &[u8]) -> TelemetryEvent {
        let decoder = Decoder::new("devices");
        match decoder.decode(&raw(key, payload)).unwrap() {
            Decoded::Event(event) => event,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn decodes_metric_from_key_segments() {
        let event = decode_event(
            "devices/dev-42/metric",
            br#"{"value": 21.5, "ts": 1700000000}"#,
        );
        assert_eq!(event.device_id, "dev-42");
        assert_eq!(event.event_type, EventType::Metric);
        assert_eq!(event.value, TelemetryValue::Reading(21.5));
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(event.sequence, None);
    }

    #[test]
    fn decodes_status_with_sequence() {
        let event = decode_event("devices/dev-7/status", br#"{"code": 2, "seq": 19}"#);
        assert_eq!(event.value, TelemetryValue::StatusCode(2));
        assert_eq!(event.sequence, Some(19));
    }

    #[test]
    fn metric_without_ts_uses_receipt_time() {
        let decoder = Decoder::new("devices");
        let message = raw("devices/dev-1/metric", br#"{"value": 1.0}"#);
        let Decoded::Event(event) = decoder.decode(&message).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.timestamp, message.received_at);
    }

    #[test]
    fn image_payload_is_kept_opaque() {
        let bytes = [0x89u8, 0x50, 0x4e, 0x47];
        let event = decode_event("devices/dev-7/image", &bytes);
        assert_eq!(event.value, TelemetryValue::Blob(bytes.to_vec()));
        assert_eq!(event.sequence, None);
    }

    #[test]
    fn rejects_keys_that_do_not_match_the_convention() {
        let decoder = Decoder::new("devices");
        for key in ["devices/dev-1", "devices/dev-1/metric/extra", "devices//metric", "devices/dev-1/"] {
            let err = decoder.decode(&raw(key, b"{}")).unwrap_err();
            assert!(
                matches!(err, MalformedMessageError::KeyPattern(_)),
                "key {key} gave {err:?}"
            );
        }

        let err = decoder
            .decode(&raw("sensors/dev-1/metric", b"{}"))
            .unwrap_err();
        assert!(matches!(err, MalformedMessageError::WrongPrefix { .. }));
    }

    #[test]
    fn rejects_unparseable_payload_for_declared_type() {
        let decoder = Decoder::new("devices");
        let err = decoder
            .decode(&raw("devices/dev-1/metric", b"not json"))
            .unwrap_err();
        assert!(matches!(
            err,
            MalformedMessageError::PayloadParsing { event_type: "metric", .. }
        ));

        // Valid JSON of the wrong shape is just as malformed.
        let err = decoder
            .decode(&raw("devices/dev-1/status", br#"{"value": 1.0}"#))
            .unwrap_err();
        assert!(matches!(err, MalformedMessageError::PayloadParsing { .. }));
    }

    #[test]
    fn unknown_event_type_is_not_an_error() {
        let decoder = Decoder::new("devices");
        let decoded = decoder
            .decode(&raw("devices/dev-1/lidar", b"whatever"))
            .unwrap();
        match decoded {
            Decoded::UnknownEventType {
                device_id,
                event_type,
            } => {
                assert_eq!(device_id, "dev-1");
                assert_eq!(event_type, "lidar");
            }
            other => panic!("expected unknown event type, got {other:?}"),
        }
    }

    #[test]
    fn rejects_out_of_range_timestamp() {
        let decoder = Decoder::new("devices");
        let err = decoder
            .decode(&raw(
                "devices/dev-1/metric",
                br#"{"value": 1.0, "ts": 9999999999999999}"#,
            ))
            .unwrap_err();
        assert!(matches!(err, MalformedMessageError::TimestampOutOfRange(_)));
    }
}
