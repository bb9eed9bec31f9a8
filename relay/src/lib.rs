//! Device telemetry relay.
//!
//! Consumes raw telemetry from the broker, decodes and deduplicates it,
//! publishes admitted events on the internal event bus and persists them:
//! metric and status events as warehouse rows, image payloads as objects
//! with a pointer row. Offsets are committed only once a message's outcome
//! is determined, so a crash replays work instead of losing it.

pub mod config;
pub mod decoder;
pub mod dedup;
pub mod error;
pub mod event;
pub mod kafka;
pub mod metrics_const;
pub mod pipeline;
pub mod processor_pool;
pub mod recent;
pub mod retry;
pub mod server;
pub mod service;
pub mod sinks;
