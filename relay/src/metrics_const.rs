//! Centralized metric names so dashboards and tests reference one place.

pub const MESSAGES_RECEIVED: &str = "relay_messages_received_total";
pub const MESSAGES_COMPLETED: &str = "relay_messages_completed_total";
pub const MESSAGES_AUTO_NACKED: &str = "relay_messages_auto_nacked_total";

pub const MALFORMED_MESSAGES: &str = "relay_malformed_messages_total";
pub const UNKNOWN_EVENT_TYPES: &str = "relay_unknown_event_type_total";
pub const DUPLICATES_DROPPED: &str = "relay_duplicates_dropped_total";

pub const SINK_DELIVERIES: &str = "relay_sink_deliveries_total";
pub const SINK_RETRIES: &str = "relay_sink_retries_total";
pub const SINK_TERMINAL_FAILURES: &str = "relay_sink_terminal_failures_total";

pub const BROKER_CONNECTION_TRANSITIONS: &str = "relay_broker_connection_transitions_total";
pub const OFFSETS_COMMITTED: &str = "relay_offsets_committed_total";
pub const IN_FLIGHT_MESSAGES: &str = "relay_in_flight_messages";

pub const DEDUP_TRACKED_ENTRIES: &str = "relay_dedup_tracked_entries";
