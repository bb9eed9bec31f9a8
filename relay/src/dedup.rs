use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use siphasher::sip::SipHasher13;

use crate::event::{EventType, TelemetryEvent, TelemetryValue};

/// Bounds for the per-device duplicate suppression window.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long an admitted key suppresses replays.
    pub retention: Duration,
    /// Hard cap per device; oldest entries are evicted first so a replaying
    /// or misbehaving device cannot grow memory without bound.
    pub max_entries_per_device: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(300),
            max_entries_per_device: 1024,
        }
    }
}

/// Key an event is deduplicated under within its device's window.
///
/// Devices that supply a sequence number get exact suppression on
/// device+type+sequence. Without one we fall back to a content hash bounded
/// by the retention window: duplicates inside the window are dropped, and a
/// replay arriving after expiry is accepted as legitimately new. That small
/// false-negative rate is a deliberate trade-off, not a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DedupKey {
    Sequence { event_type: EventType, seq: u64 },
    ContentHash(u64),
}

#[derive(Debug, Default)]
struct DeviceWindow {
    seen: HashMap<DedupKey, Instant>,
    order: VecDeque<(DedupKey, Instant)>,
}

impl DeviceWindow {
    fn expire(&mut self, retention: Duration, now: Instant) {
        while let Some((key, inserted)) = self.order.front() {
            if now.duration_since(*inserted) < retention {
                break;
            }
            self.seen.remove(key);
            self.order.pop_front();
        }
    }

    fn evict_to_cap(&mut self, cap: usize) {
        while self.order.len() > cap {
            if let Some((key, _)) = self.order.pop_front() {
                self.seen.remove(&key);
            }
        }
    }
}

/// In-memory, bounded recent-history structure used to suppress duplicated
/// or replayed device messages. Owned exclusively by one pipeline worker;
/// sharding work by device id means no cross-worker contention exists.
///
/// State does not survive a process restart: replayed offsets after a
/// restart land within the at-least-once redelivery bound.
pub struct DedupWindow {
    config: DedupConfig,
    devices: HashMap<String, DeviceWindow>,
}

impl DedupWindow {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            devices: HashMap::new(),
        }
    }

    /// Returns whether the event is new within the retention window for its
    /// device+type+sequence key. Expired entries for the device are evicted
    /// lazily on each admission.
    pub fn admit(&mut self, event: &TelemetryEvent) -> bool {
        self.admit_at(event, Instant::now())
    }

    fn admit_at(&mut self, event: &TelemetryEvent, now: Instant) -> bool {
        let key = Self::key_for(event);
        let window = self.devices.entry(event.device_id.clone()).or_default();
        window.expire(self.config.retention, now);

        if window.seen.contains_key(&key) {
            return false;
        }

        window.seen.insert(key, now);
        window.order.push_back((key, now));
        window.evict_to_cap(self.config.max_entries_per_device);
        true
    }

    /// Periodic sweep: expire every device's window and drop devices that
    /// have gone quiet entirely.
    pub fn sweep(&mut self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&mut self, now: Instant) {
        self.devices.retain(|_, window| {
            window.expire(self.config.retention, now);
            !window.order.is_empty()
        });
    }

    pub fn tracked_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn tracked_entries(&self) -> usize {
        self.devices.values().map(|w| w.order.len()).sum()
    }

    fn key_for(event: &TelemetryEvent) -> DedupKey {
        match event.sequence {
            Some(seq) => DedupKey::Sequence {
                event_type: event.event_type,
                seq,
            },
            None => DedupKey::ContentHash(content_hash(event)),
        }
    }
}

fn content_hash(event: &TelemetryEvent) -> u64 {
    let mut hasher = SipHasher13::new();
    event.device_id.hash(&mut hasher);
    event.event_type.hash(&mut hasher);
    event.timestamp.timestamp_millis().hash(&mut hasher);
    match &event.value {
        TelemetryValue::Reading(v) => v.to_bits().hash(&mut hasher),
        TelemetryValue::StatusCode(c) => c.hash(&mut hasher),
        TelemetryValue::Blob(bytes) => bytes.hash(&mut hasher),
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event(device: &str, seq: Option<u64>) -> TelemetryEvent {
        TelemetryEvent {
            device_id: device.to_string(),
            event_type: EventType::Metric,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            value: TelemetryValue::Reading(21.5),
            sequence: seq,
        }
    }

    #[test]
    fn second_admission_of_same_sequence_is_rejected() {
        let mut window = DedupWindow::new(DedupConfig::default());
        assert!(window.admit(&event("dev-1", Some(7))));
        assert!(!window.admit(&event("dev-1", Some(7))));
        assert!(window.admit(&event("dev-1", Some(8))));
    }

    #[test]
    fn sequence_spaces_are_scoped_per_device_and_type() {
        let mut window = DedupWindow::new(DedupConfig::default());
        assert!(window.admit(&event("dev-1", Some(7))));
        assert!(window.admit(&event("dev-2", Some(7))));

        let status = TelemetryEvent {
            event_type: EventType::Status,
            value: TelemetryValue::StatusCode(0),
            ..event("dev-1", Some(7))
        };
        assert!(window.admit(&status));
    }

    #[test]
    fn content_hash_fallback_drops_duplicates_within_window() {
        let mut window = DedupWindow::new(DedupConfig::default());
        let start = Instant::now();
        assert!(window.admit_at(&event("dev-1", None), start));
        assert!(!window.admit_at(&event("dev-1", None), start + Duration::from_secs(1)));
    }

    #[test]
    fn content_hash_entry_expires_after_retention() {
        let mut window = DedupWindow::new(DedupConfig {
            retention: Duration::from_secs(60),
            ..DedupConfig::default()
        });
        let start = Instant::now();
        assert!(window.admit_at(&event("dev-1", None), start));
        // Replay after the window expires is accepted as legitimately new.
        assert!(window.admit_at(&event("dev-1", None), start + Duration::from_secs(61)));
    }

    #[test]
    fn per_device_cap_evicts_oldest_first() {
        let mut window = DedupWindow::new(DedupConfig {
            retention: Duration::from_secs(3600),
            max_entries_per_device: 3,
        });
        let start = Instant::now();
        for seq in 0..5 {
            assert!(window.admit_at(&event("dev-1", Some(seq)), start));
        }
        assert_eq!(window.tracked_entries(), 3);
        // seq 0 and 1 were evicted, so a replay of them is re-admitted.
        assert!(window.admit_at(&event("dev-1", Some(0)), start));
        // seq 4 is still held.
        assert!(!window.admit_at(&event("dev-1", Some(4)), start));
    }

    #[test]
    fn sweep_drops_quiet_devices() {
        let mut window = DedupWindow::new(DedupConfig {
            retention: Duration::from_secs(60),
            ..DedupConfig::default()
        });
        let start = Instant::now();
        assert!(window.admit_at(&event("dev-1", Some(1)), start));
        assert!(window.admit_at(&event("dev-2", Some(1)), start + Duration::from_secs(59)));
        window.sweep_at(start + Duration::from_secs(100));
        assert_eq!(window.tracked_devices(), 1);
        assert_eq!(window.tracked_entries(), 1);
    }
}
