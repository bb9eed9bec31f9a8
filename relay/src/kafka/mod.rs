pub mod connection;
pub mod consumer;
pub mod message;
pub mod tracker;

pub use connection::ConnectionHealth;
pub use consumer::BrokerConsumer;
pub use message::{AckableMessage, MessageResult};
pub use tracker::{InFlightTracker, TrackerStats};
