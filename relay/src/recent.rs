use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::{EventType, TelemetryEvent, TelemetryValue};

/// One admitted event, trimmed for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentEntry {
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

/// Bounded list of each device's most recently admitted events, newest
/// first, served by the status server so operators can inspect a device
/// without querying the warehouse. Purely observational: delivery and
/// persistence never read from it.
pub struct RecentReadings {
    per_device: RwLock<HashMap<String, VecDeque<RecentEntry>>>,
    per_device_cap: usize,
    storage_prefix: String,
}

impl RecentReadings {
    pub fn new(per_device_cap: usize, storage_prefix: String) -> Self {
        Self {
            per_device: RwLock::new(HashMap::new()),
            per_device_cap,
            storage_prefix,
        }
    }

    /// Record an admitted event for its device, evicting the oldest entry
    /// once the device's list is full.
    pub fn record(&self, event: &TelemetryEvent) {
        let (reading, status_code, blob_ref) = match &event.value {
            TelemetryValue::Reading(v) => (Some(*v), None, None),
            TelemetryValue::StatusCode(c) => (None, Some(*c), None),
            TelemetryValue::Blob(_) => (None, None, Some(event.storage_key(&self.storage_prefix))),
        };
        let entry = RecentEntry {
            event_type: event.event_type,
            timestamp: event.timestamp,
            sequence: event.sequence,
            reading,
            status_code,
            blob_ref,
        };

        let mut devices = self.write_devices();
        let list = devices.entry(event.device_id.clone()).or_default();
        list.push_front(entry);
        list.truncate(self.per_device_cap);
    }

    /// The device's recent entries, newest first; empty for a device that
    /// has not reported.
    pub fn snapshot(&self, device_id: &str) -> Vec<RecentEntry> {
        self.read_devices()
            .get(device_id)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tracked_devices(&self) -> usize {
        self.read_devices().len()
    }

    fn read_devices(&self) -> RwLockReadGuard<'_, HashMap<String, VecDeque<RecentEntry>>> {
        self.per_device.read().expect("recent readings lock poisoned")
    }

    fn write_devices(&self) -> RwLockWriteGuard<'_, HashMap<String, VecDeque<RecentEntry>>> {
        self.per_device.write().expect("recent readings lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metric(device: &str, seq: u64, value: f64) -> TelemetryEvent {
        TelemetryEvent {
            device_id: device.to_string(),
            event_type: EventType::Metric,
            timestamp: Utc.timestamp_opt(1_700_000_000 + seq as i64, 0).unwrap(),
            value: TelemetryValue::Reading(value),
            sequence: Some(seq),
        }
    }

    #[test]
    fn snapshot_is_newest_first() {
        let recent = RecentReadings::new(100, "telemetry/".to_string());
        for seq in 1..=3 {
            recent.record(&metric("dev-1", seq, seq as f64));
        }
        let entries = recent.snapshot("dev-1");
        let sequences: Vec<Option<u64>> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![Some(3), Some(2), Some(1)]);
    }

    #[test]
    fn cap_evicts_the_oldest_entries() {
        let recent = RecentReadings::new(2, "telemetry/".to_string());
        for seq in 1..=5 {
            recent.record(&metric("dev-1", seq, 0.0));
        }
        let entries = recent.snapshot("dev-1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, Some(5));
        assert_eq!(entries[1].sequence, Some(4));
    }

    #[test]
    fn devices_do_not_share_lists() {
        let recent = RecentReadings::new(100, "telemetry/".to_string());
        recent.record(&metric("dev-1", 1, 0.0));
        recent.record(&metric("dev-2", 1, 0.0));
        assert_eq!(recent.snapshot("dev-1").len(), 1);
        assert_eq!(recent.snapshot("dev-2").len(), 1);
        assert_eq!(recent.tracked_devices(), 2);
        assert!(recent.snapshot("dev-3").is_empty());
    }

    #[test]
    fn blob_entries_carry_the_storage_key() {
        let recent = RecentReadings::new(100, "telemetry/".to_string());
        let image = TelemetryEvent {
            device_id: "dev-7".to_string(),
            event_type: EventType::Image,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            value: TelemetryValue::Blob(vec![1, 2, 3]),
            sequence: None,
        };
        recent.record(&image);
        let entries = recent.snapshot("dev-7");
        assert_eq!(
            entries[0].blob_ref.as_deref(),
            Some("telemetry/dev-7/image/1700000000000.bin")
        );
        assert_eq!(entries[0].reading, None);
    }
}
